//! Byte transport under the protocol engine.
//!
//! The engine only needs four things from a link: connect, disconnect,
//! write a packet, and a stream of notifications. Keeping that behind a
//! trait lets the whole session run against an in-memory transport in
//! tests, with [`BleTransport`] as the real thing.

use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, warn};

use crate::error::Ff09Error;

/// GATT service the FF09 protocol lives on.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff09_0000_1000_8000_00805f9b34fb);
/// Commands go out over this characteristic, write-without-response.
pub const WRITE_UUID: Uuid = Uuid::from_u128(0x0000ff0a_0000_1000_8000_00805f9b34fb);
/// All device traffic comes back as notifications on this one.
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000ff0b_0000_1000_8000_00805f9b34fb);

const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
/// Buffered notifications before back-pressure on the pump task.
const NOTIFICATION_QUEUE: usize = 64;

/// A bidirectional packet link to one device.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<(), Ff09Error>;

    async fn disconnect(&mut self) -> Result<(), Ff09Error>;

    /// Sends one packet. Framing is the caller's business.
    async fn write(&mut self, packet: &[u8]) -> Result<(), Ff09Error>;

    /// Starts notification delivery and returns the receiving end.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, Ff09Error>;
}

/// BLE transport over the FF09 GATT service.
pub struct BleTransport {
    /// Advertised name to look for; `None` takes the first device exposing
    /// the service.
    name: Option<String>,
    adapter: Option<Adapter>,
    device: Option<Device>,
    write: Option<Characteristic>,
    notify: Option<Characteristic>,
    pump: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            adapter: None,
            device: None,
            write: None,
            notify: None,
            pump: None,
        }
    }

    async fn discover_device(
        &self,
        adapter: &Adapter,
    ) -> Result<AdvertisingDevice, Ff09Error> {
        let mut scan = adapter.scan(&[SERVICE_UUID]).await?;
        loop {
            let found = timeout(SCAN_TIMEOUT, scan.next())
                .await
                .map_err(|_| Ff09Error::DeviceNotFound)?
                .ok_or(Ff09Error::DeviceNotFound)?;
            match &self.name {
                None => return Ok(found),
                Some(wanted) => {
                    let name = found.device.name_async().await.unwrap_or_default();
                    debug!("advertisement from '{name}'");
                    if &name == wanted {
                        return Ok(found);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<(), Ff09Error> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| Ff09Error::Protocol("no default Bluetooth adapter".to_string()))?;
        adapter.wait_available().await?;

        let found = self.discover_device(&adapter).await?;
        adapter.connect_device(&found.device).await?;

        let service = found
            .device
            .discover_services_with_uuid(SERVICE_UUID)
            .await?
            .first()
            .ok_or_else(|| Ff09Error::Protocol("device lacks the FF09 service".to_string()))?
            .clone();
        let write = service
            .discover_characteristics_with_uuid(WRITE_UUID)
            .await?
            .first()
            .ok_or_else(|| Ff09Error::Protocol("device lacks the write characteristic".to_string()))?
            .clone();
        let notify = service
            .discover_characteristics_with_uuid(NOTIFY_UUID)
            .await?
            .first()
            .ok_or_else(|| {
                Ff09Error::Protocol("device lacks the notify characteristic".to_string())
            })?
            .clone();

        self.adapter = Some(adapter);
        self.device = Some(found.device);
        self.write = Some(write);
        self.notify = Some(notify);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Ff09Error> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.write = None;
        self.notify = None;
        if let (Some(adapter), Some(device)) = (self.adapter.take(), self.device.take()) {
            adapter.disconnect_device(&device).await?;
        }
        Ok(())
    }

    async fn write(&mut self, packet: &[u8]) -> Result<(), Ff09Error> {
        let characteristic = self.write.as_ref().ok_or(Ff09Error::NotConnected)?;
        characteristic.write_without_response(packet).await?;
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, Ff09Error> {
        let characteristic = self.notify.clone().ok_or(Ff09Error::NotConnected)?;
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE);
        self.pump = Some(tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("could not subscribe to notifications: {e}");
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                match item {
                    Ok(data) => {
                        if tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("notification stream error: {e}"),
                }
            }
            debug!("notification stream ended");
        }));
        Ok(rx)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
