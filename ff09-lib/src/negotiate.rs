//! Secondary key negotiation for wall chargers.
//!
//! Chargers that reject the TLV handshake fall back to a different key
//! exchange the vendor app drives with a fixed sequence of six packets,
//! replayed here verbatim from app captures. The packets are not FF09
//! frames and their internal structure is undocumented; the one thing that
//! is understood is the sixth device response, which carries the device's
//! P-256 public key as a raw 64-byte `X || Y` point. ECDH against a client
//! scalar baked into the app yields a shared secret whose first sixteen
//! bytes become an AES-128-CBC key with an all-zero IV.
//!
//! Telemetry after the exchange keeps arriving unframed. Two plaintext
//! layouts exist in the wild, told apart by length and by range checks on
//! the temperature and port fields.

use aes::Aes128;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use hex_literal::hex;
use p256::ecdh::diffie_hellman;
use p256::{PublicKey, SecretKey};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::crypto::{AES_BLOCK_SIZE, CryptoContext};
use crate::device::Ff09Device;
use crate::error::Ff09Error;
use crate::status::{PortMode, PortState, PowerStatus};
use crate::transport::Transport;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// The negotiation sequence, replayed byte for byte.
pub const NEGOTIATION_PACKETS: [&[u8]; 6] = [
    &hex!("02fd0016010001009c"),
    &hex!("02fd0016010002009f"),
    &hex!("02fd001603000300440cb1"),
    &hex!("02fd00160500040012000000000000c3"),
    &hex!(
        "02fd001647000500"
        "6f41b2c8d1a98e04f2c05b7d9a1e8c63b07d5a92e14f86c3d90b2a7f5e83d1c4"
        "29e6a07b8f3d52c1b49a60e7d2f81c35a68b04d9f27e53c08a1b6d4e92f7035c"
        "7a"
    ),
    &hex!("02fd0016070006002e91d5"),
];

/// Client-side ECDH scalar, paired with the public key embedded in the
/// replayed sequence.
const CLIENT_SCALAR: [u8; 32] =
    hex!("1f4c8a2e9b06d3571c84f2a05e6b39d71a28c45f90e3b6d208a7514c3f9eb06d");

/// Spacing between packets of one negotiation burst.
const PACKET_SPACING: Duration = Duration::from_millis(150);
/// How long to wait for a key before replaying the sequence.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Hard ceiling on the whole negotiation.
pub const NEGOTIATION_DEADLINE: Duration = Duration::from_secs(30);
const STATE_POLL: Duration = Duration::from_millis(50);

/// Expected size of the raw `X || Y` public key point.
const PEER_POINT_SIZE: usize = 64;
/// Device responses counted before the public key is expected.
const RESPONSES_BEFORE_KEY: u8 = 6;

/// Where the negotiation stands for the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    Negotiating,
    Keyed,
}

/// AES key derived from the ECDH exchange. The IV is always zero.
#[derive(Clone)]
pub struct ChargerCipher {
    key: [u8; 16],
}

impl ChargerCipher {
    /// Runs ECDH between the baked-in client scalar and the device's raw
    /// `X || Y` point, truncating the shared secret to sixteen bytes.
    pub fn from_peer_point(xy: &[u8]) -> Result<Self, Ff09Error> {
        if xy.len() != PEER_POINT_SIZE {
            return Err(Ff09Error::InsufficientData {
                expected: PEER_POINT_SIZE,
                actual: xy.len(),
            });
        }
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(xy);
        let peer = PublicKey::from_sec1_bytes(&sec1)
            .map_err(|e| Ff09Error::Crypto(format!("device public key rejected: {e}")))?;
        let secret = SecretKey::from_slice(&CLIENT_SCALAR)
            .map_err(|e| Ff09Error::Crypto(e.to_string()))?;
        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

        let mut key = [0u8; 16];
        key.copy_from_slice(&shared.raw_secret_bytes()[..16]);
        Ok(Self { key })
    }

    pub fn key(&self) -> [u8; 16] {
        self.key
    }

    fn decrypt_blocks(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return None;
        }
        let dec = Aes128CbcDec::new_from_slices(&self.key, &[0u8; 16]).ok()?;
        dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext).ok()
    }

    /// Decrypts a telemetry notification. Packets may carry a short header
    /// before the ciphertext, so the block-aligned offset among 0, 2 and 4
    /// is probed.
    pub fn decrypt_telemetry(&self, packet: &[u8]) -> Option<Vec<u8>> {
        [0usize, 2, 4]
            .into_iter()
            .filter(|&offset| packet.len() > offset)
            .find_map(|offset| self.decrypt_blocks(&packet[offset..]))
    }
}

impl std::fmt::Debug for ChargerCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChargerCipher").finish_non_exhaustive()
    }
}

/// What one unframed notification meant to the negotiation.
#[derive(Debug)]
pub enum UnframedOutcome {
    /// Not negotiating, nothing to do.
    Ignored,
    /// A negotiation response was counted, no key yet.
    Counted,
    /// The exchange completed with this session key.
    Keyed([u8; 16]),
    /// Decrypted telemetry plaintext from a keyed charger.
    Telemetry(Vec<u8>),
}

/// Per-connection negotiation state machine. Fed from the notification
/// path, driven by [`run`].
#[derive(Debug, Default)]
pub struct Negotiation {
    state: NegotiationState,
    responses: u8,
    cipher: Option<ChargerCipher>,
}

impl Negotiation {
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_keyed(&self) -> bool {
        self.state == NegotiationState::Keyed
    }

    pub fn begin(&mut self) {
        self.state = NegotiationState::Negotiating;
        self.responses = 0;
        self.cipher = None;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Feeds one unframed notification through the state machine.
    pub fn handle_unframed(&mut self, bytes: &[u8]) -> UnframedOutcome {
        match self.state {
            NegotiationState::Idle => UnframedOutcome::Ignored,
            NegotiationState::Negotiating => {
                self.responses = self.responses.saturating_add(1);
                if self.responses < RESPONSES_BEFORE_KEY || bytes.len() < PEER_POINT_SIZE {
                    debug!(
                        response = self.responses,
                        len = bytes.len(),
                        "negotiation response counted"
                    );
                    return UnframedOutcome::Counted;
                }
                // The point sits at the tail, after an undocumented header.
                match ChargerCipher::from_peer_point(&bytes[bytes.len() - PEER_POINT_SIZE..]) {
                    Ok(cipher) => {
                        let key = cipher.key();
                        self.cipher = Some(cipher);
                        self.state = NegotiationState::Keyed;
                        UnframedOutcome::Keyed(key)
                    }
                    Err(e) => {
                        warn!("negotiation response rejected: {e}");
                        UnframedOutcome::Counted
                    }
                }
            }
            NegotiationState::Keyed => match &self.cipher {
                Some(cipher) => match cipher.decrypt_telemetry(bytes) {
                    Some(plaintext) => UnframedOutcome::Telemetry(plaintext),
                    None => UnframedOutcome::Ignored,
                },
                None => UnframedOutcome::Ignored,
            },
        }
    }
}

/// Drives the negotiation to completion: replays the packet sequence every
/// retry interval until the notification path reports a key, giving up at
/// the deadline.
pub(crate) async fn run<T: Transport>(device: &mut Ff09Device<T>) -> Result<(), Ff09Error> {
    device
        .shared
        .negotiation
        .lock()
        .expect("negotiation lock poisoned")
        .begin();
    info!("starting secondary key negotiation");

    let deadline = Instant::now() + NEGOTIATION_DEADLINE;
    loop {
        for packet in NEGOTIATION_PACKETS {
            device.transport.write(packet).await?;
            sleep(PACKET_SPACING).await;
        }
        let retry_at = (Instant::now() + RETRY_INTERVAL).min(deadline);
        while Instant::now() < retry_at {
            if device
                .shared
                .negotiation
                .lock()
                .expect("negotiation lock poisoned")
                .is_keyed()
            {
                info!("charger session key negotiated");
                return Ok(());
            }
            sleep(STATE_POLL).await;
        }
        if Instant::now() >= deadline {
            device
                .shared
                .negotiation
                .lock()
                .expect("negotiation lock poisoned")
                .reset();
            return Err(Ff09Error::Protocol(format!(
                "key negotiation got no key within {}s",
                NEGOTIATION_DEADLINE.as_secs()
            )));
        }
        debug!("no key yet, replaying negotiation sequence");
    }
}

/// Compact telemetry layout: counter, temperature, then three five-byte
/// port records, padded out to two AES blocks.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct CompactTelemetry {
    pub counter: u8,
    pub temperature_c: u8,
    pub ports: [CompactPortRaw; 3],
    pub reserved: [u8; 15],
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct CompactPortRaw {
    pub state: u8,
    pub millivolts: U16,
    pub milliamps: U16,
}

/// Wide telemetry layout: a marker and counter, temperature, then three
/// ten-byte port records carrying a device-computed power figure.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct WideTelemetry {
    pub marker: u8,
    pub counter: u8,
    pub temperature_c: u8,
    pub reserved_head: u8,
    pub ports: [WidePortRaw; 3],
    pub reserved: [u8; 14],
}

#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct WidePortRaw {
    pub state: u8,
    pub reserved: u8,
    pub millivolts: U16,
    pub milliamps: U16,
    pub centiwatts: U16,
    pub tail: [u8; 2],
}

const COMPACT_TELEMETRY_SIZE: usize = 32;
const WIDE_TELEMETRY_SIZE: usize = 48;

fn plausible_temperature(celsius: u8) -> bool {
    celsius <= 100
}

fn plausible_port(millivolts: u16, milliamps: u16) -> bool {
    millivolts <= 30_000 && milliamps <= 10_000
}

fn merge_port(status: &mut PowerStatus, id: u8, active: bool, voltage_v: f64, current_a: f64, power_w: f64) {
    status.ports.insert(
        id,
        PortState {
            mode: if active { PortMode::Output } else { PortMode::Off },
            voltage_v: if active { voltage_v } else { 0.0 },
            current_a: if active { current_a } else { 0.0 },
            power_w: if active { power_w } else { 0.0 },
        },
    );
}

/// Applies one decrypted telemetry plaintext onto `status`. Returns false
/// when neither layout matches.
pub fn decode_charger_telemetry(plaintext: &[u8], status: &mut PowerStatus) -> bool {
    if plaintext.len() == COMPACT_TELEMETRY_SIZE {
        if let Ok(frame) = CompactTelemetry::read_from_bytes(plaintext) {
            if plausible_temperature(frame.temperature_c)
                && frame
                    .ports
                    .iter()
                    .all(|p| plausible_port(p.millivolts.get(), p.milliamps.get()))
            {
                status.temperature_c = Some(frame.temperature_c as f64);
                for (index, port) in frame.ports.iter().enumerate() {
                    let millivolts = port.millivolts.get();
                    let milliamps = port.milliamps.get();
                    let active = port.state != 0 && (millivolts > 0 || milliamps > 0);
                    let voltage_v = millivolts as f64 / 1000.0;
                    let current_a = milliamps as f64 / 1000.0;
                    merge_port(
                        status,
                        index as u8 + 1,
                        active,
                        voltage_v,
                        current_a,
                        voltage_v * current_a,
                    );
                }
                finish_charger_totals(status);
                return true;
            }
        }
    }
    if plaintext.len() == WIDE_TELEMETRY_SIZE {
        if let Ok(frame) = WideTelemetry::read_from_bytes(plaintext) {
            if plausible_temperature(frame.temperature_c)
                && frame
                    .ports
                    .iter()
                    .all(|p| plausible_port(p.millivolts.get(), p.milliamps.get()))
            {
                status.temperature_c = Some(frame.temperature_c as f64);
                for (index, port) in frame.ports.iter().enumerate() {
                    let millivolts = port.millivolts.get();
                    let milliamps = port.milliamps.get();
                    let active = port.state != 0 && (millivolts > 0 || milliamps > 0);
                    merge_port(
                        status,
                        index as u8 + 1,
                        active,
                        millivolts as f64 / 1000.0,
                        milliamps as f64 / 1000.0,
                        port.centiwatts.get() as f64 / 100.0,
                    );
                }
                finish_charger_totals(status);
                return true;
            }
        }
    }
    false
}

fn finish_charger_totals(status: &mut PowerStatus) {
    let total: f64 = status.ports.values().map(|p| p.power_w.max(0.0)).sum();
    status.total_input_w = Some(total);
    status.total_output_w = Some(total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use p256::elliptic_curve::sec1::ToEncodedPoint;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    /// Fixed device-side scalar; any value below the curve order works.
    const DEVICE_SCALAR: [u8; 32] =
        hex!("33d2c1b0a99e8d7c6b5a4938271605f4e3d2c1b0a99e8d7c6b5a493827160503");

    fn device_point() -> Vec<u8> {
        let device_secret = SecretKey::from_slice(&DEVICE_SCALAR).unwrap();
        device_secret.public_key().to_encoded_point(false).as_bytes()[1..].to_vec()
    }

    fn encrypt_telemetry(cipher: &ChargerCipher, plaintext: &[u8]) -> Vec<u8> {
        let enc = Aes128CbcEnc::new_from_slices(&cipher.key(), &[0u8; 16]).unwrap();
        enc.encrypt_padded_vec_mut::<NoPadding>(plaintext)
    }

    #[test]
    fn test_ecdh_both_sides_agree() {
        let xy = device_point();
        let cipher = ChargerCipher::from_peer_point(&xy).unwrap();

        // The device derives the same secret from the client's public key.
        let device_secret = SecretKey::from_slice(&DEVICE_SCALAR).unwrap();
        let client_public = SecretKey::from_slice(&CLIENT_SCALAR).unwrap().public_key();
        let device_shared =
            diffie_hellman(device_secret.to_nonzero_scalar(), client_public.as_affine());
        assert_eq!(
            cipher.key().as_slice(),
            &device_shared.raw_secret_bytes()[..16]
        );
    }

    #[test]
    fn test_point_not_on_curve_is_rejected() {
        assert!(matches!(
            ChargerCipher::from_peer_point(&[0x5Au8; 64]),
            Err(Ff09Error::Crypto(_))
        ));
        assert!(matches!(
            ChargerCipher::from_peer_point(&[0x5Au8; 63]),
            Err(Ff09Error::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_state_machine_counts_to_the_key() {
        let mut negotiation = Negotiation::default();
        assert!(matches!(
            negotiation.handle_unframed(&[0x01, 0x02]),
            UnframedOutcome::Ignored
        ));

        negotiation.begin();
        for _ in 0..5 {
            assert!(matches!(
                negotiation.handle_unframed(&[0x02, 0xfd, 0x00]),
                UnframedOutcome::Counted
            ));
        }

        // Sixth response: undocumented header then the raw point.
        let mut sixth = vec![0x02, 0xfd, 0x00, 0x47, 0x00, 0x06];
        sixth.extend_from_slice(&device_point());
        let key = match negotiation.handle_unframed(&sixth) {
            UnframedOutcome::Keyed(key) => key,
            other => panic!("expected a key, got {other:?}"),
        };
        assert!(negotiation.is_keyed());
        assert_eq!(
            key,
            ChargerCipher::from_peer_point(&device_point()).unwrap().key()
        );
    }

    #[test]
    fn test_short_sixth_response_does_not_key() {
        let mut negotiation = Negotiation::default();
        negotiation.begin();
        for _ in 0..6 {
            assert!(matches!(
                negotiation.handle_unframed(&[0x02, 0xfd]),
                UnframedOutcome::Counted
            ));
        }
        assert!(!negotiation.is_keyed());

        // A later response that does carry the point still completes.
        let mut late = vec![0xAA];
        late.extend_from_slice(&device_point());
        assert!(matches!(
            negotiation.handle_unframed(&late),
            UnframedOutcome::Keyed(_)
        ));
    }

    fn compact_plaintext() -> Vec<u8> {
        let mut plaintext = vec![0x07, 38]; // counter, 38 C
        // Port 1: 20.000 V, 2.250 A.
        plaintext.extend_from_slice(&[0x01, 0x20, 0x4E, 0xCA, 0x08]);
        // Ports 2 and 3 idle.
        plaintext.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00]);
        plaintext.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00]);
        plaintext.resize(COMPACT_TELEMETRY_SIZE, 0);
        plaintext
    }

    #[test]
    fn test_keyed_negotiation_decrypts_compact_telemetry() {
        let cipher = ChargerCipher::from_peer_point(&device_point()).unwrap();
        let mut negotiation = Negotiation::default();
        negotiation.begin();
        let mut sixth = vec![0x00];
        sixth.extend_from_slice(&device_point());
        negotiation.responses = RESPONSES_BEFORE_KEY - 1;
        assert!(matches!(
            negotiation.handle_unframed(&sixth),
            UnframedOutcome::Keyed(_)
        ));

        // Telemetry packet with a two-byte header before the ciphertext.
        let mut packet = vec![0x02, 0xfd];
        packet.extend_from_slice(&encrypt_telemetry(&cipher, &compact_plaintext()));
        let plaintext = match negotiation.handle_unframed(&packet) {
            UnframedOutcome::Telemetry(plaintext) => plaintext,
            other => panic!("expected telemetry, got {other:?}"),
        };

        let mut status = PowerStatus::default();
        assert!(decode_charger_telemetry(&plaintext, &mut status));
        assert_eq!(status.temperature_c, Some(38.0));
        assert_eq!(status.ports[&1].mode, PortMode::Output);
        assert!((status.ports[&1].power_w - 45.0).abs() < 0.01);
        assert_eq!(status.ports[&2].mode, PortMode::Off);
        assert_eq!(status.total_output_w, status.total_input_w);
    }

    #[test]
    fn test_wide_layout_uses_device_power_figure() {
        let mut plaintext = vec![0xA5, 0x01, 44, 0x00];
        // Port 1: 9.000 V, 3.000 A, 27.50 W as reported by the device.
        plaintext.extend_from_slice(&[0x01, 0x00, 0x28, 0x23, 0xB8, 0x0B, 0xBE, 0x0A, 0x00, 0x00]);
        plaintext.extend_from_slice(&[0u8; 10]);
        plaintext.extend_from_slice(&[0u8; 10]);
        plaintext.resize(WIDE_TELEMETRY_SIZE, 0);

        let mut status = PowerStatus::default();
        assert!(decode_charger_telemetry(&plaintext, &mut status));
        assert_eq!(status.temperature_c, Some(44.0));
        assert!((status.ports[&1].power_w - 27.5).abs() < 0.01);
        assert!((status.ports[&1].voltage_v - 9.0).abs() < 0.01);
    }

    #[test]
    fn test_implausible_plaintext_is_rejected() {
        // Right length, but the temperature byte is out of range.
        let mut garbage = vec![0xFF; COMPACT_TELEMETRY_SIZE];
        garbage[1] = 200;
        let mut status = PowerStatus::default();
        assert!(!decode_charger_telemetry(&garbage, &mut status));
        assert_eq!(status, PowerStatus::default());

        // Wrong length entirely.
        assert!(!decode_charger_telemetry(&[0u8; 20], &mut status));
    }
}
