//! Power telemetry decoding.
//!
//! Status responses are TLV bodies whose tag assignments shift between
//! device families and between commands of the same family. A power bank
//! answering the comprehensive poll (`0x0200`) puts battery under `0xA1`
//! and ports under `0xA4..0xA6`; the same physical quantities in a live
//! push (`0x020A`) move to `0xA6` and `0xA3..0xA5`. Chargers answer their
//! own command (`0x0500`) with fixed-layout port records instead.
//!
//! Decoding therefore runs off a `(variant, command)` table picked once per
//! connection. Every decoded body patches the previous [`PowerStatus`] in
//! place: tags absent from a response leave their fields untouched, so
//! partial updates and acknowledgement-only bodies never wipe known state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::command::Command;
use crate::error::Ff09Error;
use crate::tlv::{TlvMap, tag};

/// Device families with distinct status wire layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum DeviceVariant {
    /// Battery packs reporting over the comprehensive status command.
    #[strum(to_string = "power-bank")]
    PowerBank,
    /// Newer packs that push live status frames with shifted tags.
    #[strum(to_string = "power-bank-pro")]
    PowerBankPro,
    /// Wall chargers: no battery, port records in charger layout.
    #[strum(to_string = "charger")]
    Charger,
}

impl FromStr for DeviceVariant {
    type Err = Ff09Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power-bank" | "powerbank" | "bank" => Ok(Self::PowerBank),
            "power-bank-pro" | "pro" => Ok(Self::PowerBankPro),
            "charger" => Ok(Self::Charger),
            other => Err(Ff09Error::Protocol(format!(
                "unknown device variant '{other}'"
            ))),
        }
    }
}

/// Tag assignments for one TLV status layout.
#[derive(Debug, Clone, Copy)]
pub struct TagLayout {
    pub battery: u8,
    pub temperature: u8,
    pub totals: u8,
    /// Tags for ports 1..=3, in port order.
    pub ports: [u8; 3],
}

/// Comprehensive status (`0x0200`) and battery detail responses.
pub const COMPREHENSIVE_TAGS: TagLayout = TagLayout {
    battery: tag::A1,
    temperature: tag::A2,
    totals: tag::A3,
    ports: [tag::A4, tag::A5, tag::A6],
};

/// Live status pushes (`0x020A`): same quantities, shifted tags.
pub const LIVE_TAGS: TagLayout = TagLayout {
    battery: tag::A6,
    temperature: tag::A7,
    totals: tag::A2,
    ports: [tag::A3, tag::A4, tag::A5],
};

/// How to decode the body of one status command.
#[derive(Debug, Clone, Copy)]
pub enum StatusParser {
    Fields(TagLayout),
    ChargerPorts,
}

impl DeviceVariant {
    /// Decode table: which parser handles `command` for this variant.
    pub fn parser_for(self, command: Command) -> Option<StatusParser> {
        match (self, command) {
            (Self::Charger, Command::ChargerStatus | Command::ChargerExtra) => {
                Some(StatusParser::ChargerPorts)
            }
            (Self::Charger, _) => None,
            (_, Command::ComprehensiveStatus | Command::BatteryDetail) => {
                Some(StatusParser::Fields(COMPREHENSIVE_TAGS))
            }
            (_, Command::LiveStatus) => Some(StatusParser::Fields(LIVE_TAGS)),
            _ => None,
        }
    }

    /// Commands polled for this variant, in request order.
    pub fn status_commands(self) -> &'static [Command] {
        match self {
            Self::PowerBank => &[Command::ComprehensiveStatus, Command::BatteryDetail],
            Self::PowerBankPro => &[Command::LiveStatus, Command::BatteryDetail],
            Self::Charger => &[Command::ChargerStatus, Command::ChargerExtra],
        }
    }
}

/// Direction a port is working in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PortMode {
    #[strum(to_string = "off")]
    Off = 0,
    #[strum(to_string = "input")]
    Input = 1,
    #[strum(to_string = "output")]
    Output = 2,

    #[num_enum(catch_all)]
    #[strum(to_string = "unknown")]
    Unknown(u8),
}

/// Live readings for one physical port.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortState {
    pub mode: PortMode,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
}

/// Accumulated device telemetry. Updated by patch-merge: each decoded
/// response overwrites only the fields it carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerStatus {
    pub battery_percent: Option<f64>,
    pub temperature_c: Option<f64>,
    pub total_input_w: Option<f64>,
    pub total_output_w: Option<f64>,
    /// Port readings keyed by port number, starting at 1.
    pub ports: BTreeMap<u8, PortState>,
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(battery) = self.battery_percent {
            writeln!(f, "Battery: {battery:.1} %")?;
        }
        if let Some(temp) = self.temperature_c {
            writeln!(f, "Temperature: {temp:.0} C")?;
        }
        match (self.total_input_w, self.total_output_w) {
            (Some(input), Some(output)) => {
                writeln!(f, "Power: {input:.1} W in, {output:.1} W out")?
            }
            (Some(input), None) => writeln!(f, "Power: {input:.1} W in")?,
            (None, Some(output)) => writeln!(f, "Power: {output:.1} W out")?,
            (None, None) => {}
        }
        for (id, port) in &self.ports {
            writeln!(
                f,
                "Port {id}: {} {:.2} V {:.2} A {:.1} W",
                port.mode, port.voltage_v, port.current_a, port.power_w
            )?;
        }
        Ok(())
    }
}

/// Port record inside power bank status bodies: two reserved bytes, the
/// mode, then decivolts and deciamps.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct PortFieldRaw {
    pub reserved: [u8; 2],
    pub mode: u8,
    pub decivolts: U16,
    pub deciamps: U16,
}

/// Port record inside charger status bodies.
#[derive(FromBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
#[repr(C)]
pub struct ChargerPortRaw {
    pub marker: u8,
    pub enabled: u8,
    pub millivolts: U16,
    pub milliamps: U16,
}

/// A body whose only record is a one-byte `0xA1` is a bare acknowledgement
/// and carries no telemetry.
pub fn is_ack_only(fields: &TlvMap) -> bool {
    fields.len() == 1 && matches!(fields.get(tag::A1), Some([_]))
}

/// Applies one decoded status body onto `status`. Returns whether any field
/// changed. Unknown commands and acknowledgement-only bodies are ignored.
pub fn apply_status(
    variant: DeviceVariant,
    command: Command,
    fields: &TlvMap,
    status: &mut PowerStatus,
) -> bool {
    if is_ack_only(fields) {
        return false;
    }
    match variant.parser_for(command) {
        Some(StatusParser::Fields(layout)) => apply_fields(&layout, fields, status),
        Some(StatusParser::ChargerPorts) => apply_charger_ports(fields, status),
        None => false,
    }
}

fn apply_fields(layout: &TagLayout, fields: &TlvMap, status: &mut PowerStatus) -> bool {
    let mut changed = false;

    if let Some(value) = fields.get(layout.battery) {
        // Whole percent plus tenths in the second byte.
        if let Some(&whole) = value.first() {
            let tenths = value.get(1).copied().unwrap_or(0);
            status.battery_percent = Some(whole as f64 + tenths as f64 / 10.0);
            changed = true;
        }
    }
    if let Some(value) = fields.get(layout.temperature) {
        if let Some(&celsius) = value.get(1) {
            status.temperature_c = Some(celsius as f64);
            changed = true;
        }
    }
    if let Some(value) = fields.get(layout.totals) {
        // Status byte, then input and output in tenths of a watt.
        if value.len() >= 5 {
            let input = u16::from_le_bytes([value[1], value[2]]);
            let output = u16::from_le_bytes([value[3], value[4]]);
            status.total_input_w = Some(input as f64 / 10.0);
            status.total_output_w = Some(output as f64 / 10.0);
            changed = true;
        }
    }
    for (index, port_tag) in layout.ports.iter().enumerate() {
        let Some(value) = fields.get(*port_tag) else {
            continue;
        };
        let Ok((raw, _rest)) = PortFieldRaw::ref_from_prefix(value) else {
            continue;
        };
        let voltage_v = raw.decivolts.get() as f64 / 10.0;
        let current_a = raw.deciamps.get() as f64 / 10.0;
        status.ports.insert(
            index as u8 + 1,
            PortState {
                mode: PortMode::from_primitive(raw.mode),
                voltage_v,
                current_a,
                power_w: voltage_v * current_a,
            },
        );
        changed = true;
    }
    changed
}

fn apply_charger_ports(fields: &TlvMap, status: &mut PowerStatus) -> bool {
    const PORT_TAGS: [u8; 3] = [tag::A2, tag::A3, tag::A4];

    let mut changed = false;
    for (index, port_tag) in PORT_TAGS.iter().enumerate() {
        let Some(value) = fields.get(*port_tag) else {
            continue;
        };
        let Ok((raw, _rest)) = ChargerPortRaw::ref_from_prefix(value) else {
            continue;
        };
        let millivolts = raw.millivolts.get();
        let milliamps = raw.milliamps.get();
        // Idle ports report a live enabled flag with zeroed readings, or a
        // cleared flag outright. Both mean nothing is drawing power.
        let active = raw.enabled != 0 && (millivolts > 0 || milliamps > 0);
        let voltage_v = millivolts as f64 / 1000.0;
        let current_a = milliamps as f64 / 1000.0;
        status.ports.insert(
            index as u8 + 1,
            PortState {
                mode: if active { PortMode::Output } else { PortMode::Off },
                voltage_v: if active { voltage_v } else { 0.0 },
                current_a: if active { current_a } else { 0.0 },
                power_w: if active { voltage_v * current_a } else { 0.0 },
            },
        );
        changed = true;
    }
    if changed {
        // Chargers pass wall power straight through, so the port sum stands
        // in for both directions.
        let total: f64 = status.ports.values().map(|p| p.power_w.max(0.0)).sum();
        status.total_input_w = Some(total);
        status.total_output_w = Some(total);
    }
    changed
}
