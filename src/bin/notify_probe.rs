// src/bin/notify_probe.rs

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::time::{Duration, timeout};
use tracing::{error, info, warn};
use tracing_subscriber;

use ff09_lib::command::CommandHeader;
use ff09_lib::frame::{self, Inbound};
use ff09_lib::transport::{BleTransport, Transport};

/// Connects to an Anker FF09 device and hex-dumps every notification it
/// sends, classified at the frame level. Sends nothing itself, which makes
/// it safe to run alongside capture tooling.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Advertised device name; the first device exposing the FF09 service
    /// wins when omitted.
    #[arg(short, long)]
    name: Option<String>,
    /// How long to listen before disconnecting, in seconds.
    #[arg(short, long, default_value_t = 60)]
    duration: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_target(false).init();
    if let Err(e) = run(cli).await {
        error!("Probe failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut transport = BleTransport::new(cli.name);
    transport
        .connect()
        .await
        .context("Failed to connect to the device")?;
    let mut notifications = transport
        .subscribe()
        .await
        .context("Failed to subscribe to notifications")?;
    info!("Connected, listening for {}s...", cli.duration);

    let listen = async {
        let mut count = 0u32;
        while let Some(packet) = notifications.recv().await {
            count += 1;
            describe(count, &packet);
        }
        count
    };
    match timeout(Duration::from_secs(cli.duration), listen).await {
        Ok(count) => warn!("Notification stream ended after {} packets", count),
        Err(_) => info!("Listen window over"),
    }

    transport
        .disconnect()
        .await
        .context("Failed to disconnect")?;
    Ok(())
}

fn describe(count: u32, packet: &[u8]) {
    info!("#{}: {} bytes: {}", count, packet.len(), hex::encode(packet));
    match frame::decode(Bytes::copy_from_slice(packet)) {
        Inbound::Frame {
            payload,
            declared_len,
            checksum_ok,
        } => {
            info!(
                "  framed: declared length {}, checksum {}",
                declared_len,
                if checksum_ok { "ok" } else { "BAD" }
            );
            match CommandHeader::parse(&payload) {
                Ok((header, body)) => info!(
                    "  {:?} command {:?} (wire {:#06x}){}{}, {} body bytes",
                    header.group,
                    header.command(),
                    header.wire_command(),
                    if header.is_encrypted() {
                        ", encrypted"
                    } else {
                        ""
                    },
                    if header.is_ack() { ", ack" } else { "" },
                    body.len()
                ),
                Err(e) => warn!("  {}", e),
            }
        }
        Inbound::Unframed(data) => {
            info!("  unframed passthrough ({} bytes)", data.len());
        }
    }
}
