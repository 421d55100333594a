use std::array::TryFromSliceError;
use thiserror::Error;

/// The primary error type for the `ff09-rs` library.
#[derive(Error, Debug)]
pub enum Ff09Error {
    #[error("BLE device not found. Is the Anker device powered on and in range?")]
    DeviceNotFound,

    #[error("Bluetooth error: {0}")]
    Ble(#[from] bluest::Error),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Timed out waiting for a device response")]
    ResponseTimeout,

    #[error("Timeout during BLE operation: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Device info carried no serial number, cannot derive the crypto IV")]
    MissingSerial,

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },
}

impl From<TryFromSliceError> for Ff09Error {
    fn from(_: TryFromSliceError) -> Self {
        Ff09Error::Protocol("Failed to convert slice to array".to_string())
    }
}
