//! Session establishment over the primary TLV handshake.
//!
//! # Handshake flow
//!
//! 1. Hello (`0x0001`): timestamp plus the shared key constant.
//! 2. Capabilities (`0x0003`): adds a feature flag byte and profile word.
//! 3. Device info (`0x0029`): the response carries firmware, serial number
//!    and MAC. The serial is mandatory, it seeds the crypto IV.
//! 4. Crypto announce (`0x0005`): capabilities again plus the cipher mode.
//! 5. Local bootstrap: install the fixed-key context. Nothing on the wire.
//! 6. Session key request (`0x0022`, encrypted): zero-filled placeholders
//!    the device overwrites.
//! 7. The device pushes the session key asynchronously; the driver polls
//!    the crypto state until it flips to `Session`.
//! 8. An initial status poll primes the telemetry map.
//!
//! Every step has a ten-second ceiling. Devices that never answer step 1
//! are the chargers that only speak the secondary negotiation; the caller
//! falls back to [`crate::negotiate`] on timeout.

use std::fmt;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info};

use crate::command::{Command, CommandHeader, Group};
use crate::crypto::{CryptoContext, CryptoState, KEY_MATERIAL};
use crate::device::Ff09Device;
use crate::dispatch::DeviceEvent;
use crate::error::Ff09Error;
use crate::tlv::{self, TlvMap, tag};
use crate::transport::Transport;

/// Ceiling for each handshake request and for the session key wait.
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the driver re-checks the crypto state in step 7.
pub const CRYPTO_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Feature flag byte sent in capabilities and crypto announce.
const CAP_FLAGS: u8 = 0x20;
/// Profile word sent alongside the flags.
const CAP_PROFILE: u16 = 0x00F0;
/// Cipher selector announced in step 4: AES session keying.
const CRYPTO_MODE: u8 = 0x02;

/// Identity reported by the device in step 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub firmware: String,
    pub mac: [u8; 6],
}

impl DeviceInfo {
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (fw {}, mac {})",
            self.serial,
            self.firmware,
            self.mac_string()
        )
    }
}

/// Current time as the 4-byte little-endian seconds field the handshake
/// bodies carry.
pub fn unix_time_le() -> [u8; 4] {
    (Utc::now().timestamp() as u32).to_le_bytes()
}

pub(crate) fn hello_body(timestamp: [u8; 4]) -> Bytes {
    tlv::encode(&[(tag::A1, &timestamp), (tag::A2, KEY_MATERIAL)])
}

pub(crate) fn capabilities_body(timestamp: [u8; 4]) -> Bytes {
    tlv::encode(&[
        (tag::A1, &timestamp),
        (tag::A2, KEY_MATERIAL),
        (tag::A3, &[CAP_FLAGS]),
        (tag::A4, &CAP_PROFILE.to_le_bytes()),
    ])
}

pub(crate) fn device_info_body(timestamp: [u8; 4]) -> Bytes {
    tlv::encode(&[(tag::A1, &timestamp), (tag::A2, KEY_MATERIAL)])
}

pub(crate) fn crypto_announce_body(timestamp: [u8; 4]) -> Bytes {
    tlv::encode(&[
        (tag::A1, &timestamp),
        (tag::A2, KEY_MATERIAL),
        (tag::A3, &[CAP_FLAGS]),
        (tag::A4, &CAP_PROFILE.to_le_bytes()),
        (tag::A5, &[CRYPTO_MODE]),
    ])
}

/// Step 6 body: the key slot and nonce slot ride along zeroed, the device
/// fills them in its reply.
pub(crate) fn session_key_request_body(timestamp: [u8; 4]) -> Bytes {
    tlv::encode(&[
        (tag::A1, &timestamp),
        (tag::A2, KEY_MATERIAL),
        (tag::A3, &[0u8; 4]),
        (tag::A5, &[0u8; 40]),
    ])
}

/// Extracts the identity fields from a device info response body.
pub fn parse_device_info(fields: &TlvMap) -> Result<DeviceInfo, Ff09Error> {
    let serial = fields
        .ascii(tag::A4)
        .filter(|s| !s.is_empty())
        .ok_or(Ff09Error::MissingSerial)?;
    let firmware = fields.ascii(tag::A3).unwrap_or_default();
    let mac = match fields.get(tag::A5) {
        Some(value) if value.len() >= 6 => {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&value[..6]);
            mac
        }
        _ => [0u8; 6],
    };
    Ok(DeviceInfo {
        serial,
        firmware,
        mac,
    })
}

/// Parses a full device info response frame payload.
pub fn parse_device_info_payload(payload: &[u8]) -> Result<DeviceInfo, Ff09Error> {
    let (header, body) = CommandHeader::parse(payload)?;
    if header.command() != Command::DeviceInfo {
        return Err(Ff09Error::Protocol(format!(
            "expected a device info response, got {:?}",
            header.command()
        )));
    }
    parse_device_info(&tlv::decode(body))
}

/// Runs the handshake to the `Session` state. On success the shared crypto
/// engine holds the device-issued session key and the device identity is
/// stored and published.
pub(crate) async fn run<T: Transport>(device: &mut Ff09Device<T>) -> Result<(), Ff09Error> {
    let timestamp = unix_time_le();

    debug!("handshake: hello");
    device
        .request_plain(Group::Handshake, Command::Hello, &hello_body(timestamp))
        .await?;

    debug!("handshake: capabilities");
    device
        .request_plain(
            Group::Handshake,
            Command::Capabilities,
            &capabilities_body(timestamp),
        )
        .await?;

    debug!("handshake: device info");
    let response = device
        .request_plain(
            Group::Handshake,
            Command::DeviceInfo,
            &device_info_body(timestamp),
        )
        .await?;
    let device_info = parse_device_info_payload(&response)?;
    info!(
        serial = %device_info.serial,
        firmware = %device_info.firmware,
        mac = %device_info.mac_string(),
        "device identified"
    );
    device.store_device_info(device_info.clone());

    debug!("handshake: crypto announce");
    device
        .request_plain(
            Group::Handshake,
            Command::CryptoSetup,
            &crypto_announce_body(timestamp),
        )
        .await?;

    // Step 5 happens locally.
    device
        .shared
        .crypto
        .install(CryptoContext::bootstrap(&device_info.serial));
    device
        .shared
        .events
        .emit(DeviceEvent::Crypto(CryptoState::Initial));

    debug!("handshake: session key request");
    let ciphertext = device
        .shared
        .crypto
        .encrypt_body(&session_key_request_body(timestamp))?;
    let payload = CommandHeader::new(Group::Handshake, Command::SessionKey)
        .encrypted()
        .encode_payload(&ciphertext);
    // The key comes back as an out-of-band push, not as the direct reply,
    // so nothing waits on the pending slot here.
    device.write_payload(&payload).await?;

    let deadline = Instant::now() + HANDSHAKE_STEP_TIMEOUT;
    while device.shared.crypto.state() != CryptoState::Session {
        if Instant::now() >= deadline {
            return Err(Ff09Error::ResponseTimeout);
        }
        sleep(CRYPTO_POLL_INTERVAL).await;
    }
    info!("session key installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

    #[test]
    fn test_hello_body_layout() {
        let body = hello_body(TS);
        assert_eq!(&body[..2], &[0xA1, 4]);
        assert_eq!(&body[2..6], &TS);
        assert_eq!(&body[6..8], &[0xA2, 40]);
        assert_eq!(&body[8..], KEY_MATERIAL.as_slice());
    }

    #[test]
    fn test_capabilities_body_adds_flags_and_profile() {
        let fields = tlv::decode(&capabilities_body(TS));
        assert_eq!(fields.byte(tag::A3), Some(0x20));
        assert_eq!(fields.u16_le(tag::A4), Some(0x00F0));
    }

    #[test]
    fn test_crypto_announce_selects_aes_mode() {
        let fields = tlv::decode(&crypto_announce_body(TS));
        assert_eq!(fields.byte(tag::A5), Some(0x02));
        assert_eq!(fields.get(tag::A2), Some(KEY_MATERIAL.as_slice()));
    }

    #[test]
    fn test_session_key_request_sends_zeroed_slots() {
        let fields = tlv::decode(&session_key_request_body(TS));
        assert_eq!(fields.get(tag::A3), Some([0u8; 4].as_slice()));
        assert_eq!(fields.get(tag::A5), Some([0u8; 40].as_slice()));
    }

    #[test]
    fn test_parse_device_info() {
        let fields = tlv::decode(&tlv::encode(&[
            (tag::A3, b"01.82".as_slice()),
            (tag::A4, b"AK7P2J4T00112233".as_slice()),
            (tag::A5, &[0xC8, 0x7F, 0x54, 0x01, 0x02, 0x03]),
        ]));
        let info = parse_device_info(&fields).unwrap();
        assert_eq!(info.serial, "AK7P2J4T00112233");
        assert_eq!(info.firmware, "01.82");
        assert_eq!(info.mac_string(), "c8:7f:54:01:02:03");
    }

    #[test]
    fn test_missing_serial_is_fatal() {
        let fields = tlv::decode(&tlv::encode(&[(tag::A3, b"01.82".as_slice())]));
        assert!(matches!(
            parse_device_info(&fields),
            Err(Ff09Error::MissingSerial)
        ));

        // An empty serial field counts as missing too.
        let fields = tlv::decode(&tlv::encode(&[(tag::A4, [].as_slice())]));
        assert!(matches!(
            parse_device_info(&fields),
            Err(Ff09Error::MissingSerial)
        ));
    }

    #[test]
    fn test_device_info_payload_requires_matching_command() {
        let header = CommandHeader::new(Group::Handshake, Command::Hello);
        let payload = header.encode_payload(&tlv::encode(&[(tag::A4, b"S".as_slice())]));
        assert!(matches!(
            parse_device_info_payload(&payload),
            Err(Ff09Error::Protocol(_))
        ));
    }
}
