use bluest::Adapter;
use futures_util::StreamExt;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::info;
use tracing_subscriber;

use ff09_lib::transport::SERVICE_UUID;

const SCAN_WINDOW: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize tracing (optional, but good for debugging)
    tracing_subscriber::fmt::init();

    info!("Scanning for Anker FF09 devices...\n");

    let Some(adapter) = Adapter::default().await else {
        eprintln!("No default Bluetooth adapter available.");
        return;
    };
    if let Err(e) = adapter.wait_available().await {
        eprintln!("Bluetooth adapter did not become available: {:?}", e);
        return;
    }

    match adapter.scan(&[SERVICE_UUID]).await {
        Ok(mut scan) => {
            let deadline = Instant::now() + SCAN_WINDOW;
            let mut seen = Vec::new();
            let mut count = 0;
            while let Ok(Some(found)) = timeout_at(deadline, scan.next()).await {
                let name = found.device.name_async().await.unwrap_or_default();
                // Devices advertise continuously, report each one once.
                if seen.contains(&name) {
                    continue;
                }
                seen.push(name.clone());
                count += 1;
                info!(
                    "Device #{}: '{}', RSSI: {:?}",
                    count,
                    if name.is_empty() { "<no name>" } else { &name },
                    found.rssi
                );
                info!("  Advertised services: {:?}", found.adv_data.services);
                info!("  Connectable: {:?}", found.adv_data.is_connectable);
                info!("---");
            }
            if count == 0 {
                info!("No FF09 devices found within {}s.", SCAN_WINDOW.as_secs());
            }
        }
        Err(e) => {
            eprintln!("Error scanning for devices: {:?}", e);
        }
    }
}
