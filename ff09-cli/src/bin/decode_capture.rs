//! Offline decoder for captured FF09 traffic.
//!
//! Input is one packet per line: either a bare hex string or a JSONL row
//! with a `value_hex` field, which is what the btsnoop extraction tooling
//! emits. Each packet runs through the framing and TLV codecs; encrypted
//! bodies are decrypted when key material is supplied.
//!
//! Key material options:
//!   --serial S           bootstrap context (fixed key, IV from the serial)
//!   --serial S --key K   session context under the serial-derived IV
//!   --key K              zero-IV context, as negotiated charger sessions use

use std::error::Error;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use clap::Parser;

use ff09_lib::command::CommandHeader;
use ff09_lib::crypto::{CryptoContext, CryptoEngine};
use ff09_lib::frame::{self, Inbound};
use ff09_lib::tlv;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Capture file: hex lines or btsnoop JSONL.
    input: PathBuf,
    /// Device serial number, for the bootstrap key and IV derivation.
    #[arg(short, long)]
    serial: Option<String>,
    /// 16-byte AES key as hex. With --serial it replaces the bootstrap
    /// key; alone it is used with an all-zero IV.
    #[arg(short, long)]
    key: Option<String>,
    /// Skip packets that decode to no TLV fields.
    #[arg(long)]
    tlv_only: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let engine = build_engine(&cli)?;

    let reader = BufReader::new(File::open(&cli.input)?);
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let Some(hex_str) = extract_hex(&line) else {
            continue;
        };
        let packet = match hex::decode(&hex_str) {
            Ok(packet) => packet,
            Err(e) => {
                eprintln!("line {}: bad hex ({e})", number + 1);
                continue;
            }
        };
        let report = describe_packet(&packet, engine.as_ref());
        if cli.tlv_only && !report.contains('=') {
            continue;
        }
        println!("#{} {}", number + 1, report);
    }
    Ok(())
}

fn build_engine(cli: &Cli) -> Result<Option<CryptoEngine>, Box<dyn Error>> {
    let key = match &cli.key {
        Some(hex_key) => {
            let bytes = hex::decode(hex_key)?;
            let key: [u8; 16] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| format!("--key must be 16 bytes, got {}", bytes.len()))?;
            Some(key)
        }
        None => None,
    };
    let ctx = match (&cli.serial, key) {
        (Some(serial), Some(key)) => Some(CryptoContext::bootstrap(serial).with_session_key(key)),
        (Some(serial), None) => Some(CryptoContext::bootstrap(serial)),
        (None, Some(key)) => Some(CryptoContext::negotiated(key)),
        (None, None) => None,
    };
    Ok(ctx.map(|ctx| {
        let engine = CryptoEngine::new();
        engine.install(ctx);
        engine
    }))
}

/// Pulls the packet hex out of one input line. JSONL rows contribute their
/// `value_hex` field; anything else is taken as hex directly. Blank lines
/// and `#` comments yield nothing.
fn extract_hex(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    if trimmed.starts_with('{') {
        let row: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        return row
            .get("value_hex")
            .and_then(|v| v.as_str())
            .map(|s| s.replace(':', ""));
    }
    Some(trimmed.replace([':', ' '], ""))
}

fn describe_packet(packet: &[u8], engine: Option<&CryptoEngine>) -> String {
    match frame::decode(bytes::Bytes::copy_from_slice(packet)) {
        Inbound::Unframed(data) => format!("unframed {} bytes: {}", data.len(), hex::encode(&data)),
        Inbound::Frame {
            payload,
            declared_len,
            checksum_ok,
        } => {
            let mut out = format!(
                "frame len {declared_len}{}",
                if checksum_ok { "" } else { " CHECKSUM-BAD" }
            );
            let (header, body) = match CommandHeader::parse(&payload) {
                Ok(parsed) => parsed,
                Err(e) => return format!("{out} ({e})"),
            };
            out.push_str(&format!(
                " {:?}/{:?}{}{}",
                header.group,
                header.command(),
                if header.is_encrypted() { " enc" } else { "" },
                if header.is_ack() { " ack" } else { "" },
            ));
            if header.is_encrypted() {
                match engine {
                    Some(engine) => match engine.decrypt_response(&payload) {
                        Ok((plaintext, offset)) => {
                            out.push_str(&format!(" (ciphertext at +{offset})"));
                            out.push_str(&render_fields(&tlv::decode_decrypted(&plaintext)));
                        }
                        Err(e) => out.push_str(&format!(" (decrypt failed: {e})")),
                    },
                    None => out.push_str(" (no key material)"),
                }
            } else {
                out.push_str(&render_fields(&tlv::decode(body)));
            }
            out
        }
    }
}

fn render_fields(fields: &tlv::TlvMap) -> String {
    let mut out = String::new();
    for (tag, value) in fields.iter() {
        out.push_str(&format!(" {tag:#04x}={}", hex::encode(value)));
    }
    out
}
