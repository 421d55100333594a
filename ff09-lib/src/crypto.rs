//! Payload encryption for the FF09 protocol.
//!
//! Anker devices run a two-stage AES-128-CBC scheme on top of the frame
//! layer:
//!
//! 1. A bootstrap context built from a fixed key constant shared by the
//!    vendor apps, with the device serial number as IV. It protects exactly
//!    one exchange, the session key request.
//! 2. A session context using the 16-byte key the device hands back, under
//!    the same IV. All later encrypted traffic uses this one.
//!
//! The active context is an immutable snapshot behind an [`Arc`]: a decrypt
//! that is already running keeps the context it started with even if the
//! session key lands mid-flight. Device responses place their ciphertext at
//! either offset 5 or 6 of the frame payload depending on firmware, so
//! decryption probes both.

use std::sync::{Arc, Mutex};

use aes::Aes128;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::Ff09Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Key material baked into the vendor apps. The bootstrap key is the first
/// sixteen bytes; the session key request echoes the full constant back to
/// the device.
pub const KEY_MATERIAL: &[u8; 40] = b"2c377dfa09cdb7924889e4292a37f61c8c5ed52d";

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Offsets into a frame payload where response ciphertext may start.
const CIPHERTEXT_OFFSETS: [usize; 2] = [5, 6];

/// Lifecycle of the encryption layer for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
pub enum CryptoState {
    /// No key installed, all traffic is plaintext.
    #[default]
    #[strum(to_string = "inactive")]
    Inactive,
    /// Bootstrap key active, used only for the session key exchange.
    #[strum(to_string = "initial")]
    Initial,
    /// Device-issued session key active.
    #[strum(to_string = "session")]
    Session,
}

/// Derives the CBC IV from a device serial number: ASCII bytes, right-padded
/// with zeros to sixteen bytes, or truncated when longer.
pub fn derive_iv(serial: &str) -> [u8; 16] {
    let mut iv = [0u8; 16];
    let bytes = serial.as_bytes();
    let take = bytes.len().min(16);
    iv[..take].copy_from_slice(&bytes[..take]);
    iv
}

/// One immutable key+IV pairing. Contexts are replaced, never mutated.
#[derive(Debug, Clone)]
pub struct CryptoContext {
    state: CryptoState,
    key: [u8; 16],
    iv: [u8; 16],
}

impl CryptoContext {
    /// Bootstrap context: fixed key constant, serial-derived IV.
    pub fn bootstrap(serial: &str) -> Self {
        let mut key = [0u8; 16];
        key.copy_from_slice(&KEY_MATERIAL[..16]);
        Self {
            state: CryptoState::Initial,
            key,
            iv: derive_iv(serial),
        }
    }

    /// Session context continuing under this context's IV.
    pub fn with_session_key(&self, key: [u8; 16]) -> Self {
        Self {
            state: CryptoState::Session,
            key,
            iv: self.iv,
        }
    }

    /// Session context from a negotiated key with an all-zero IV. Used by
    /// the secondary key negotiation on chargers.
    pub fn negotiated(key: [u8; 16]) -> Self {
        Self {
            state: CryptoState::Session,
            key,
            iv: [0u8; 16],
        }
    }

    pub fn state(&self) -> CryptoState {
        self.state
    }

    /// AES-128-CBC with PKCS7 padding.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Ff09Error> {
        let enc = Aes128CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| Ff09Error::Crypto(e.to_string()))?;
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    /// Reverses [`CryptoContext::encrypt`]. The ciphertext must be a whole
    /// number of blocks and unpad cleanly.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Ff09Error> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(Ff09Error::Crypto(format!(
                "ciphertext length {} is not block-aligned",
                ciphertext.len()
            )));
        }
        let dec = Aes128CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| Ff09Error::Crypto(e.to_string()))?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Ff09Error::Crypto("invalid PKCS7 padding".to_string()))
    }
}

/// Holds the active context for one connection and hands out snapshots.
#[derive(Debug, Default)]
pub struct CryptoEngine {
    slot: Mutex<Option<Arc<CryptoContext>>>,
}

impl CryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CryptoState {
        self.snapshot()
            .map(|ctx| ctx.state())
            .unwrap_or(CryptoState::Inactive)
    }

    /// The context in effect right now, if any. Callers keep using their
    /// snapshot even if another task installs a replacement.
    pub fn snapshot(&self) -> Option<Arc<CryptoContext>> {
        self.slot.lock().expect("crypto lock poisoned").clone()
    }

    /// Replaces the active context outright.
    pub fn install(&self, ctx: CryptoContext) {
        *self.slot.lock().expect("crypto lock poisoned") = Some(Arc::new(ctx));
    }

    /// Drops the active context, returning the engine to `Inactive`.
    pub fn reset(&self) {
        *self.slot.lock().expect("crypto lock poisoned") = None;
    }

    /// Encrypts an outgoing TLV body under the active context.
    pub fn encrypt_body(&self, plaintext: &[u8]) -> Result<Vec<u8>, Ff09Error> {
        let ctx = self
            .snapshot()
            .ok_or_else(|| Ff09Error::Crypto("no active crypto context".to_string()))?;
        ctx.encrypt(plaintext)
    }

    /// Decrypts an encrypted response frame payload.
    ///
    /// The context is snapshotted once at entry. Both candidate ciphertext
    /// offsets are probed; the first one that is block-aligned and unpads
    /// cleanly wins. Returns the plaintext and the offset that matched.
    pub fn decrypt_response(&self, payload: &[u8]) -> Result<(Vec<u8>, usize), Ff09Error> {
        let ctx = self
            .snapshot()
            .ok_or_else(|| Ff09Error::Crypto("no active crypto context".to_string()))?;
        let mut last_err = Ff09Error::Crypto(format!(
            "payload of {} bytes holds no ciphertext",
            payload.len()
        ));
        for offset in CIPHERTEXT_OFFSETS {
            if payload.len() <= offset {
                continue;
            }
            match ctx.decrypt(&payload[offset..]) {
                Ok(plaintext) => return Ok((plaintext, offset)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv;

    #[test]
    fn test_iv_derivation() {
        let iv = derive_iv("ABC");
        assert_eq!(&iv[..3], b"ABC");
        assert_eq!(&iv[3..], &[0u8; 13]);

        let iv = derive_iv("0123456789ABCDEF");
        assert_eq!(&iv, b"0123456789ABCDEF");

        let iv = derive_iv("0123456789ABCDEF0123");
        assert_eq!(&iv, b"0123456789ABCDEF");
    }

    #[test]
    fn test_bootstrap_round_trip() {
        let ctx = CryptoContext::bootstrap("AK7P2J4T00112233");
        assert_eq!(ctx.state(), CryptoState::Initial);

        let body = tlv::encode(&[(tlv::tag::A1, &[0x01, 0x02, 0x03, 0x04])]);
        let ciphertext = ctx.encrypt(&body).unwrap();
        assert_eq!(ciphertext.len() % AES_BLOCK_SIZE, 0);
        assert_ne!(&ciphertext[..body.len().min(ciphertext.len())], &body[..]);
        assert_eq!(ctx.decrypt(&ciphertext).unwrap(), body.to_vec());
    }

    #[test]
    fn test_session_key_keeps_iv() {
        let bootstrap = CryptoContext::bootstrap("SERIAL01");
        let session = bootstrap.with_session_key([0x42; 16]);
        assert_eq!(session.state(), CryptoState::Session);

        let ciphertext = session.encrypt(b"ping").unwrap();
        // The bootstrap key must no longer open the traffic.
        assert_ne!(bootstrap.decrypt(&ciphertext).ok(), Some(b"ping".to_vec()));
        assert_eq!(session.decrypt(&ciphertext).unwrap(), b"ping");
    }

    #[test]
    fn test_decrypt_response_probes_both_offsets() {
        let engine = CryptoEngine::new();
        engine.install(CryptoContext::bootstrap("SERIAL01"));
        let ctx = engine.snapshot().unwrap();

        let plaintext = tlv::encode(&[(tlv::tag::A1, &[0x2A])]);
        let ciphertext = ctx.encrypt(&plaintext).unwrap();

        // Header (5 bytes) then ciphertext: matches at offset 5.
        let mut at5 = vec![0x03, 0x00, 0x11, 0x42, 0x00];
        at5.extend_from_slice(&ciphertext);
        let (out, offset) = engine.decrypt_response(&at5).unwrap();
        assert_eq!(offset, 5);
        assert_eq!(out, plaintext.to_vec());

        // One extra status byte after the header: offset 5 is misaligned,
        // offset 6 decrypts.
        let mut at6 = vec![0x03, 0x00, 0x11, 0x42, 0x00, 0x01];
        at6.extend_from_slice(&ciphertext);
        let (out, offset) = engine.decrypt_response(&at6).unwrap();
        assert_eq!(offset, 6);
        assert_eq!(out, plaintext.to_vec());
    }

    #[test]
    fn test_engine_state_transitions() {
        let engine = CryptoEngine::new();
        assert_eq!(engine.state(), CryptoState::Inactive);
        assert!(engine.encrypt_body(b"x").is_err());

        engine.install(CryptoContext::bootstrap("SERIAL01"));
        assert_eq!(engine.state(), CryptoState::Initial);

        let held = engine.snapshot().unwrap();
        let session = held.with_session_key([0x11; 16]);
        engine.install(session);
        assert_eq!(engine.state(), CryptoState::Session);
        // The earlier snapshot is unaffected by the swap.
        assert_eq!(held.state(), CryptoState::Initial);

        engine.reset();
        assert_eq!(engine.state(), CryptoState::Inactive);
    }
}
