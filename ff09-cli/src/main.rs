use clap::Parser;
use std::collections::VecDeque;
use std::error::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, interval};
use tracing::{debug, warn};

use ff09_lib::Ff09Device;
use ff09_lib::dispatch::DeviceEvent;
use ff09_lib::status::{DeviceVariant, PowerStatus};
use ff09_lib::transport::BleTransport;

/// Snapshots kept for the session summary printed on exit.
const HISTORY_WINDOW: usize = 120;

/// Live telemetry monitor for Anker FF09 power banks and chargers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Advertised device name; the first device exposing the FF09 service
    /// wins when omitted.
    #[arg(short, long)]
    name: Option<String>,
    /// Device family: power-bank, power-bank-pro or charger.
    #[arg(short, long, default_value = "power-bank")]
    variant: DeviceVariant,
    /// Seconds between status polls.
    #[arg(short, long, default_value_t = 5)]
    interval: u64,
    /// Number of polls before exiting; 0 polls until Ctrl+C.
    #[arg(short, long, default_value_t = 0)]
    count: u32,
    /// Print each snapshot as a JSON line instead of text.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut device = Ff09Device::ble(cli.name.clone(), cli.variant);
    let mut events = device.events();

    device.connect().await?;
    match device.device_info() {
        Some(info) => println!("Connected to {info}"),
        None => println!("Connected ({} session, no TLV identity)", cli.variant),
    }

    // Faults and crypto transitions surface in the log while the loop
    // below owns stdout.
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Fault(fault)) => warn!("{fault}"),
                Ok(DeviceEvent::Crypto(state)) => debug!("crypto layer now {state}"),
                Ok(_) => {}
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    });

    let mut history = VecDeque::with_capacity(HISTORY_WINDOW);
    tokio::select! {
        result = poll_loop(&mut device, &cli, &mut history) => result?,
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }

    watcher.abort();
    device.disconnect().await;
    print_summary(&history);
    Ok(())
}

async fn poll_loop(
    device: &mut Ff09Device<BleTransport>,
    cli: &Cli,
    history: &mut VecDeque<PowerStatus>,
) -> Result<(), Box<dyn Error>> {
    let mut ticker = interval(Duration::from_secs(cli.interval.max(1)));
    let mut polls = 0u32;
    loop {
        ticker.tick().await;
        if let Err(e) = device.request_status().await {
            warn!("status poll failed: {e}");
        }
        let status = device.status();
        if cli.json {
            println!("{}", serde_json::to_string(&status)?);
        } else {
            print!("{status}");
            println!("---");
        }
        if history.len() == HISTORY_WINDOW {
            history.pop_front();
        }
        history.push_back(status);
        polls += 1;
        if cli.count != 0 && polls >= cli.count {
            return Ok(());
        }
    }
}

/// Output power over the retained snapshots.
fn print_summary(history: &VecDeque<PowerStatus>) {
    let watts: Vec<f64> = history.iter().filter_map(|s| s.total_output_w).collect();
    if watts.is_empty() {
        return;
    }
    let min = watts.iter().copied().fold(f64::INFINITY, f64::min);
    let max = watts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = watts.iter().sum::<f64>() / watts.len() as f64;
    println!(
        "Session: {} samples, output {min:.1}..{max:.1} W (mean {mean:.1} W)",
        watts.len()
    );
}
