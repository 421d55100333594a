//! Type-length-value bodies carried after the command header.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

/// Field tags seen across handshake and status bodies. The meaning of a tag
/// depends on the command it travels with, so the names stay literal.
pub mod tag {
    pub const A1: u8 = 0xA1;
    pub const A2: u8 = 0xA2;
    pub const A3: u8 = 0xA3;
    pub const A4: u8 = 0xA4;
    pub const A5: u8 = 0xA5;
    pub const A6: u8 = 0xA6;
    pub const A7: u8 = 0xA7;
    pub const A8: u8 = 0xA8;
    pub const A9: u8 = 0xA9;
    pub const AE: u8 = 0xAE;
}

/// Decoded TLV fields, keyed by tag. Duplicate tags keep the last value;
/// duplicates have not been observed in captures, so nothing is lost.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TlvMap {
    fields: BTreeMap<u8, Vec<u8>>,
}

impl TlvMap {
    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.fields.get(&tag).map(Vec::as_slice)
    }

    /// Single-byte field, `None` when absent or not exactly one byte.
    pub fn byte(&self, tag: u8) -> Option<u8> {
        match self.get(tag) {
            Some([value]) => Some(*value),
            _ => None,
        }
    }

    /// Little-endian u16 read from the first two bytes of a field.
    pub fn u16_le(&self, tag: u8) -> Option<u16> {
        let value = self.get(tag)?;
        Some(u16::from_le_bytes([*value.first()?, *value.get(1)?]))
    }

    /// Field interpreted as ASCII text, with trailing NULs trimmed.
    pub fn ascii(&self, tag: u8) -> Option<String> {
        let value = self.get(tag)?;
        let trimmed = value
            .iter()
            .rposition(|&b| b != 0)
            .map_or(&value[..0], |end| &value[..=end]);
        String::from_utf8(trimmed.to_vec()).ok()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.fields.iter().map(|(tag, value)| (*tag, value.as_slice()))
    }

    fn insert(&mut self, tag: u8, value: &[u8]) {
        self.fields.insert(tag, value.to_vec());
    }
}

/// Parses `{tag, len, value}` records until the buffer runs out. A record
/// whose declared length overruns the remaining bytes ends the walk, fields
/// decoded before the truncation point are kept.
pub fn decode(bytes: &[u8]) -> TlvMap {
    let mut map = TlvMap::default();
    let mut offset = 0;
    while offset + 2 <= bytes.len() {
        let tag = bytes[offset];
        let len = bytes[offset + 1] as usize;
        let end = offset + 2 + len;
        if end > bytes.len() {
            break;
        }
        map.insert(tag, &bytes[offset + 2..end]);
        offset = end;
    }
    map
}

/// Decodes a decrypted body. Plaintexts sometimes carry a single leading
/// zero pad byte before the first record; skip it when present.
pub fn decode_decrypted(bytes: &[u8]) -> TlvMap {
    match bytes {
        [0x00, rest @ ..] => decode(rest),
        _ => decode(bytes),
    }
}

/// Serializes records in the order given. Values longer than 255 bytes do
/// not occur in this protocol.
pub fn encode(records: &[(u8, &[u8])]) -> Bytes {
    let mut out = BytesMut::new();
    for (tag, value) in records {
        assert!(value.len() <= u8::MAX as usize, "TLV value too long");
        out.put_u8(*tag);
        out.put_u8(value.len() as u8);
        out.put_slice(value);
    }
    out.freeze()
}
