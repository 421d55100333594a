use crate::error::Ff09Error;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

/// Every framed payload starts with these two bytes.
pub const PAYLOAD_PREFIX: [u8; 2] = [0x03, 0x00];

/// Size of the command header at the front of a frame payload:
/// prefix (2) + group (1) + cmd_high (1) + cmd_low (1).
pub const COMMAND_HEADER_SIZE: usize = 5;

/// `cmd_high` flag bit: the TLV body that follows the header is AES-encrypted.
pub const FLAG_ENCRYPTED: u8 = 0x40;
/// `cmd_high` flag bit: the frame acknowledges an earlier command.
pub const FLAG_ACK: u8 = 0x08;

/// Command groups observed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Group {
    Handshake = 0x01,
    Action = 0x0F,
    Status = 0x11,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Normalized command identifiers: `(cmd_high & !(FLAG_ENCRYPTED | FLAG_ACK)) << 8 | cmd_low`.
///
/// Stripping the flag bits folds request, response and acknowledgement forms of
/// a command onto a single identifier, so `0x0D00` on the wire decodes as
/// [`Command::ChargerStatus`] (`0x0500` with the ack bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u16)]
pub enum Command {
    Hello = 0x0001,
    Capabilities = 0x0003,
    CryptoSetup = 0x0005,
    SessionKey = 0x0022,
    DeviceInfo = 0x0029,
    ComprehensiveStatus = 0x0200,
    PortSwitch = 0x0207,
    LiveStatus = 0x020A,
    BatteryDetail = 0x0300,
    ChargerStatus = 0x0500,
    ChargerExtra = 0x050E,

    #[num_enum(catch_all)]
    Unknown(u16),
}

/// The five-byte header at the front of every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub group: Group,
    pub cmd_high: u8,
    pub cmd_low: u8,
}

impl CommandHeader {
    pub fn new(group: Group, command: Command) -> Self {
        let id: u16 = command.into();
        Self {
            group,
            cmd_high: (id >> 8) as u8,
            cmd_low: id as u8,
        }
    }

    /// Marks the header as carrying an encrypted body.
    pub fn encrypted(mut self) -> Self {
        self.cmd_high |= FLAG_ENCRYPTED;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.cmd_high & FLAG_ENCRYPTED != 0
    }

    pub fn is_ack(&self) -> bool {
        self.cmd_high & FLAG_ACK != 0
    }

    /// The raw 16-bit command exactly as it appears on the wire, flags included.
    pub fn wire_command(&self) -> u16 {
        ((self.cmd_high as u16) << 8) | self.cmd_low as u16
    }

    /// The command with the flag bits stripped out of `cmd_high`.
    pub fn command(&self) -> Command {
        let high = self.cmd_high & !(FLAG_ENCRYPTED | FLAG_ACK);
        Command::from_primitive(((high as u16) << 8) | self.cmd_low as u16)
    }

    /// Splits a frame payload into its header and the body that follows.
    pub fn parse(payload: &[u8]) -> Result<(Self, &[u8]), Ff09Error> {
        if payload.len() < COMMAND_HEADER_SIZE {
            return Err(Ff09Error::InsufficientData {
                expected: COMMAND_HEADER_SIZE,
                actual: payload.len(),
            });
        }
        if payload[..2] != PAYLOAD_PREFIX {
            return Err(Ff09Error::MalformedFrame(format!(
                "unexpected payload prefix {:02x}{:02x}",
                payload[0], payload[1]
            )));
        }
        let header = Self {
            group: Group::from_primitive(payload[2]),
            cmd_high: payload[3],
            cmd_low: payload[4],
        };
        Ok((header, &payload[COMMAND_HEADER_SIZE..]))
    }

    /// Builds a full frame payload: prefix, group, command and body.
    pub fn encode_payload(&self, body: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(COMMAND_HEADER_SIZE + body.len());
        out.put_slice(&PAYLOAD_PREFIX);
        out.put_u8(self.group.into());
        out.put_u8(self.cmd_high);
        out.put_u8(self.cmd_low);
        out.put_slice(body);
        out.freeze()
    }
}
