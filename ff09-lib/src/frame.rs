//! Outer framing for the FF09 GATT transport.
//!
//! Every framed notification and command is `[0xFF, 0x09]` magic, a
//! little-endian total length (payload plus five bytes of overhead), the
//! payload itself, then a single XOR checksum over the length field and
//! payload. The magic bytes are excluded from the checksum. Notifications
//! that do not start with the magic are passed through untouched; the
//! secondary key negotiation talks in exactly such unframed packets.

use bytes::{BufMut, Bytes, BytesMut};

/// Magic bytes at the front of every framed packet.
pub const FRAME_MAGIC: [u8; 2] = [0xFF, 0x09];

/// Bytes added around a payload: magic (2) + length (2) + checksum (1).
pub const FRAME_OVERHEAD: usize = 5;

/// A single inbound notification, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed `FF 09` frame. `checksum_ok` is advisory: receive
    /// processing continues on a mismatch, the caller only logs it.
    Frame {
        payload: Bytes,
        declared_len: u16,
        checksum_ok: bool,
    },
    /// Anything that does not carry the magic, delivered verbatim.
    Unframed(Bytes),
}

fn xor_checksum(len_le: [u8; 2], payload: &[u8]) -> u8 {
    let mut acc = len_le[0] ^ len_le[1];
    for byte in payload {
        acc ^= byte;
    }
    acc
}

/// Wraps a payload in the outer frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let total = payload.len() + FRAME_OVERHEAD;
    let len_le = (total as u16).to_le_bytes();
    let mut out = BytesMut::with_capacity(total);
    out.put_slice(&FRAME_MAGIC);
    out.put_slice(&len_le);
    out.put_slice(payload);
    out.put_u8(xor_checksum(len_le, payload));
    out.freeze()
}

/// Classifies one notification. Frames too short to hold the overhead and
/// packets without the magic come back as [`Inbound::Unframed`].
pub fn decode(bytes: Bytes) -> Inbound {
    if bytes.len() < FRAME_OVERHEAD || bytes[..2] != FRAME_MAGIC {
        return Inbound::Unframed(bytes);
    }
    let declared_len = u16::from_le_bytes([bytes[2], bytes[3]]);
    let payload = bytes.slice(4..bytes.len() - 1);
    let checksum_ok = xor_checksum([bytes[2], bytes[3]], &payload) == bytes[bytes.len() - 1];
    Inbound::Frame {
        payload,
        declared_len,
        checksum_ok,
    }
}
