use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::command::{COMMAND_HEADER_SIZE, Command, CommandHeader, Group};
use crate::crypto::{CryptoContext, CryptoEngine, CryptoState};
use crate::dispatch::{Correlator, DeviceEvent, EventBus};
use crate::error::Ff09Error;
use crate::frame::{self, Inbound};
use crate::handshake::{self, DeviceInfo};
use crate::negotiate::{self, Negotiation, UnframedOutcome};
use crate::status::{self, DeviceVariant, PowerStatus};
use crate::tlv::{self, tag};
use crate::transport::{BleTransport, Transport};

/// Matches the per-step handshake ceiling; plain requests get the same.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = handshake::HANDSHAKE_STEP_TIMEOUT;

/// Pause after subscribing before the first write, so the notification
/// registration lands first.
const SUBSCRIBE_SETTLE: Duration = Duration::from_millis(200);

/// State shared between the device handle and the notification task.
pub(crate) struct Shared {
    pub(crate) crypto: CryptoEngine,
    pub(crate) correlator: Correlator,
    pub(crate) events: EventBus,
    pub(crate) negotiation: Mutex<Negotiation>,
    pub(crate) status: Mutex<PowerStatus>,
    pub(crate) info: Mutex<Option<DeviceInfo>>,
    pub(crate) variant: DeviceVariant,
}

/// One Anker device session: transport, crypto lifecycle, request
/// correlation and telemetry accumulation.
pub struct Ff09Device<T: Transport> {
    pub(crate) transport: T,
    pub(crate) shared: Arc<Shared>,
    pub(crate) response_timeout: Duration,
    process_task: Option<JoinHandle<()>>,
}

impl Ff09Device<BleTransport> {
    /// Session over BLE, discovering the device by advertised name.
    /// `None` takes the first device carrying the FF09 service.
    pub fn ble(name: Option<String>, variant: DeviceVariant) -> Self {
        Self::with_transport(BleTransport::new(name), variant)
    }
}

impl<T: Transport> Ff09Device<T> {
    pub fn with_transport(transport: T, variant: DeviceVariant) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                crypto: CryptoEngine::new(),
                correlator: Correlator::new(),
                events: EventBus::default(),
                negotiation: Mutex::new(Negotiation::default()),
                status: Mutex::new(PowerStatus::default()),
                info: Mutex::new(None),
                variant,
            }),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            process_task: None,
        }
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Subscribes to session events. Safe to call before connecting.
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// Latest accumulated telemetry.
    pub fn status(&self) -> PowerStatus {
        self.shared.status.lock().expect("status lock poisoned").clone()
    }

    /// Identity learned during the handshake, if any.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.info.lock().expect("info lock poisoned").clone()
    }

    pub fn crypto_state(&self) -> CryptoState {
        self.shared.crypto.state()
    }

    pub fn variant(&self) -> DeviceVariant {
        self.shared.variant
    }

    /// Connects the transport, establishes a session and primes telemetry.
    ///
    /// Power banks run the TLV handshake. Chargers try it too and fall back
    /// to the secondary key negotiation when the device never answers.
    pub async fn connect(&mut self) -> Result<(), Ff09Error> {
        self.transport.connect().await?;
        let notifications = self.transport.subscribe().await?;
        sleep(SUBSCRIBE_SETTLE).await;

        let shared = self.shared.clone();
        self.process_task = Some(tokio::spawn(async move {
            let mut notifications = notifications;
            while let Some(packet) = notifications.recv().await {
                process_notification(&shared, packet);
            }
            debug!("notification channel closed");
        }));
        self.shared.events.emit(DeviceEvent::Connection(true));

        if let Err(handshake_err) = handshake::run(self).await {
            if self.shared.variant == DeviceVariant::Charger {
                warn!("TLV handshake failed ({handshake_err}), trying secondary negotiation");
                if let Err(e) = negotiate::run(self).await {
                    self.teardown().await;
                    return Err(e);
                }
            } else {
                self.teardown().await;
                return Err(handshake_err);
            }
        }

        if let Err(e) = self.request_status().await {
            warn!("initial status poll incomplete: {e}");
        }
        info!("session established");
        Ok(())
    }

    /// Tears the session down. In-flight waiters resolve with an error and
    /// all per-connection state is dropped.
    pub async fn disconnect(&mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
        self.shared.correlator.clear();
        self.shared.crypto.reset();
        self.shared
            .negotiation
            .lock()
            .expect("negotiation lock poisoned")
            .reset();
        *self.shared.status.lock().expect("status lock poisoned") = PowerStatus::default();
        *self.shared.info.lock().expect("info lock poisoned") = None;
        if let Err(e) = self.transport.disconnect().await {
            debug!("transport disconnect: {e}");
        }
        self.shared.events.emit(DeviceEvent::Connection(false));
    }

    /// Polls every status command for this device's variant. A command the
    /// device does not answer is skipped; responses land in [`Self::status`]
    /// as they arrive.
    pub async fn request_status(&mut self) -> Result<(), Ff09Error> {
        for &command in self.shared.variant.status_commands() {
            let body = tlv::encode(&[(tag::A1, &handshake::unix_time_le())]);
            let result = if self.shared.crypto.state() == CryptoState::Inactive {
                self.request_plain(Group::Status, command, &body).await
            } else {
                self.request_encrypted(Group::Status, command, &body).await
            };
            match result {
                Ok(_) => {}
                Err(Ff09Error::ResponseTimeout) => {
                    debug!("no reply to {command:?}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Switches an output port on or off.
    ///
    /// Best effort: the reply to this command has only been observed as a
    /// bare acknowledgement, success is not otherwise confirmed.
    pub async fn set_port(&mut self, port: u8, enable: bool) -> Result<(), Ff09Error> {
        let body = tlv::encode(&[(tag::A1, &[port, enable as u8])]);
        let response = if self.shared.crypto.state() == CryptoState::Inactive {
            self.request_plain(Group::Action, Command::PortSwitch, &body)
                .await?
        } else {
            self.request_encrypted(Group::Action, Command::PortSwitch, &body)
                .await?
        };
        debug!("port switch reply: {}", hex::encode(&response));
        Ok(())
    }

    pub(crate) fn store_device_info(&self, device_info: DeviceInfo) {
        *self.shared.info.lock().expect("info lock poisoned") = Some(device_info.clone());
        self.shared.events.emit(DeviceEvent::Info(device_info));
    }

    pub(crate) async fn request_plain(
        &mut self,
        group: Group,
        command: Command,
        body: &[u8],
    ) -> Result<Bytes, Ff09Error> {
        let payload = CommandHeader::new(group, command).encode_payload(body);
        self.send_payload_and_await(payload).await
    }

    pub(crate) async fn request_encrypted(
        &mut self,
        group: Group,
        command: Command,
        body: &[u8],
    ) -> Result<Bytes, Ff09Error> {
        let ciphertext = self.shared.crypto.encrypt_body(body)?;
        let payload = CommandHeader::new(group, command)
            .encrypted()
            .encode_payload(&ciphertext);
        self.send_payload_and_await(payload).await
    }

    /// Frames and writes a payload without awaiting any reply.
    pub(crate) async fn write_payload(&mut self, payload: &[u8]) -> Result<(), Ff09Error> {
        let frame = frame::encode(payload);
        trace!("TX {}", hex::encode(&frame));
        self.transport.write(&frame).await
    }

    /// Sends one command and waits for whatever resolves the pending slot:
    /// the frame payload for plaintext replies, the decrypted body for
    /// encrypted ones. Times out after [`Self::set_response_timeout`]'s
    /// setting and clears the slot so a late reply cannot reach a waiter
    /// that gave up.
    pub(crate) async fn send_payload_and_await(
        &mut self,
        payload: Bytes,
    ) -> Result<Bytes, Ff09Error> {
        let rx = self.shared.correlator.register()?;
        if let Err(e) = self.write_payload(&payload).await {
            self.shared.correlator.clear();
            return Err(e);
        }
        match timeout(self.response_timeout, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(Ff09Error::NotConnected),
            Err(_) => {
                self.shared.correlator.clear();
                Err(Ff09Error::ResponseTimeout)
            }
        }
    }
}

impl<T: Transport> Drop for Ff09Device<T> {
    fn drop(&mut self) {
        if let Some(task) = self.process_task.take() {
            task.abort();
        }
    }
}

/// Handles one raw notification. Runs on the notification task; everything
/// here is synchronous and lock-scoped.
fn process_notification(shared: &Shared, packet: Vec<u8>) {
    trace!("RX {}", hex::encode(&packet));
    match frame::decode(Bytes::from(packet)) {
        Inbound::Unframed(data) => {
            let outcome = shared
                .negotiation
                .lock()
                .expect("negotiation lock poisoned")
                .handle_unframed(&data);
            match outcome {
                UnframedOutcome::Keyed(key) => {
                    shared.crypto.install(CryptoContext::negotiated(key));
                    shared.events.emit(DeviceEvent::Crypto(CryptoState::Session));
                }
                UnframedOutcome::Telemetry(plaintext) => {
                    apply_charger_telemetry(shared, &plaintext);
                }
                UnframedOutcome::Counted => {}
                UnframedOutcome::Ignored => {
                    trace!("ignoring {} unframed bytes", data.len());
                }
            }
            shared.correlator.resolve(data);
        }
        Inbound::Frame {
            payload,
            declared_len,
            checksum_ok,
        } => {
            if !checksum_ok {
                warn!("frame checksum mismatch (declared length {declared_len}), continuing");
            }
            handle_frame(shared, payload);
        }
    }
}

fn handle_frame(shared: &Shared, payload: Bytes) {
    if payload.len() < COMMAND_HEADER_SIZE {
        // Heartbeat-sized frames still settle a waiting command.
        shared.correlator.resolve(payload);
        return;
    }
    let header = match CommandHeader::parse(&payload) {
        Ok((header, _)) => header,
        Err(e) => {
            warn!("{e}");
            shared.correlator.resolve(payload);
            return;
        }
    };

    if header.is_encrypted() {
        match shared.crypto.decrypt_response(&payload) {
            Ok((plaintext, offset)) => {
                trace!(offset, "decrypted {} body bytes", plaintext.len());
                let fields = tlv::decode_decrypted(&plaintext);
                dispatch_fields(shared, header.command(), &fields);
                shared.correlator.resolve(Bytes::from(plaintext));
            }
            Err(e) => {
                warn!("dropping encrypted {:?} frame: {e}", header.command());
                shared
                    .events
                    .emit(DeviceEvent::Fault(format!("decrypt failed: {e}")));
                shared.correlator.resolve(payload);
            }
        }
    } else {
        let fields = tlv::decode(&payload[COMMAND_HEADER_SIZE..]);
        dispatch_fields(shared, header.command(), &fields);
        shared.correlator.resolve(payload);
    }
}

fn dispatch_fields(shared: &Shared, command: Command, fields: &tlv::TlvMap) {
    match command {
        Command::SessionKey => {
            let Some(value) = fields.get(tag::A1) else {
                debug!("session key push without a key field");
                return;
            };
            let Ok(key) = <[u8; 16]>::try_from(value) else {
                warn!("session key field has {} bytes, expected 16", value.len());
                return;
            };
            let Some(ctx) = shared.crypto.snapshot() else {
                warn!("session key arrived with no bootstrap context");
                return;
            };
            shared.crypto.install(ctx.with_session_key(key));
            shared.events.emit(DeviceEvent::Crypto(CryptoState::Session));
        }
        Command::Hello | Command::Capabilities | Command::CryptoSetup | Command::DeviceInfo => {
            // Handshake replies are consumed by the driver awaiting them.
            trace!("{command:?} reply with {} fields", fields.len());
        }
        other => {
            let mut status = shared.status.lock().expect("status lock poisoned");
            if status::apply_status(shared.variant, other, fields, &mut status) {
                let snapshot = status.clone();
                drop(status);
                shared.events.emit(DeviceEvent::Status(snapshot));
            }
        }
    }
}

fn apply_charger_telemetry(shared: &Shared, plaintext: &[u8]) {
    let mut status = shared.status.lock().expect("status lock poisoned");
    if negotiate::decode_charger_telemetry(plaintext, &mut status) {
        let snapshot = status.clone();
        drop(status);
        shared.events.emit(DeviceEvent::Status(snapshot));
    } else {
        debug!(
            "unrecognized charger telemetry layout ({} bytes)",
            plaintext.len()
        );
    }
}
