pub mod command;
pub mod crypto;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod negotiate;
pub mod status;
pub mod tlv;
pub mod transport;

// Re-export the session handle for easy access
pub use device::Ff09Device;
pub use error::Ff09Error;
