//! Shared session-test harness: a scripted in-memory transport and
//! builders for the device side of the conversation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use ff09_lib::command::{Command, CommandHeader, FLAG_ACK, Group};
use ff09_lib::crypto::CryptoContext;
use ff09_lib::dispatch::DeviceEvent;
use ff09_lib::error::Ff09Error;
use ff09_lib::frame;
use ff09_lib::tlv::{self, tag};
use ff09_lib::transport::Transport;

#[allow(dead_code)]
pub const SERIAL: &str = "A1790H11C2240061";
#[allow(dead_code)]
pub const SESSION_KEY: [u8; 16] = *b"0123456789abcdef";

type Script = Arc<Mutex<VecDeque<Vec<Vec<u8>>>>>;

/// In-memory transport: every write pops the next scripted batch of
/// notifications and feeds it back, which keeps reply ordering identical
/// to a real device. Responses can only arrive after the request that
/// caused them.
pub struct MockTransport {
    script: Script,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    notify_tx: mpsc::Sender<Vec<u8>>,
    notify_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Test-side handle: extends the script, injects unsolicited pushes and
/// inspects what the driver wrote.
pub struct MockHandle {
    script: Script,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    notify_tx: mpsc::Sender<Vec<u8>>,
}

pub fn mock_pair() -> (MockTransport, MockHandle) {
    let (notify_tx, notify_rx) = mpsc::channel(64);
    let script: Script = Arc::default();
    let written = Arc::new(Mutex::new(Vec::new()));
    (
        MockTransport {
            script: script.clone(),
            written: written.clone(),
            notify_tx: notify_tx.clone(),
            notify_rx: Some(notify_rx),
        },
        MockHandle {
            script,
            written,
            notify_tx,
        },
    )
}

impl MockHandle {
    /// Queues the notifications answering the next write.
    pub fn reply_with(&self, notifications: Vec<Vec<u8>>) {
        self.script.lock().unwrap().push_back(notifications);
    }

    /// Delivers a notification right now, tied to no write.
    #[allow(dead_code)]
    pub async fn push(&self, notification: Vec<u8>) {
        self.notify_tx.send(notification).await.unwrap();
    }

    #[allow(dead_code)]
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<(), Ff09Error> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Ff09Error> {
        Ok(())
    }

    async fn write(&mut self, packet: &[u8]) -> Result<(), Ff09Error> {
        self.written.lock().unwrap().push(packet.to_vec());
        let replies = self.script.lock().unwrap().pop_front();
        if let Some(replies) = replies {
            for reply in replies {
                self.notify_tx
                    .send(reply)
                    .await
                    .map_err(|_| Ff09Error::NotConnected)?;
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, Ff09Error> {
        self.notify_rx.take().ok_or(Ff09Error::NotConnected)
    }
}

/// A plain acknowledgement frame for `command`: ack flag set, body `A1=01`.
#[allow(dead_code)]
pub fn ack_frame(group: Group, command: Command) -> Vec<u8> {
    let mut header = CommandHeader::new(group, command);
    header.cmd_high |= FLAG_ACK;
    let payload = header.encode_payload(&tlv::encode(&[(tag::A1, &[0x01])]));
    frame::encode(&payload).to_vec()
}

/// A device info response carrying firmware, serial and MAC.
#[allow(dead_code)]
pub fn device_info_frame() -> Vec<u8> {
    let mut header = CommandHeader::new(Group::Handshake, Command::DeviceInfo);
    header.cmd_high |= FLAG_ACK;
    let body = tlv::encode(&[
        (tag::A3, b"01.82".as_slice()),
        (tag::A4, SERIAL.as_bytes()),
        (tag::A5, &[0xC8, 0x7F, 0x54, 0xA0, 0xB1, 0xC2]),
    ]);
    frame::encode(&header.encode_payload(&body)).to_vec()
}

/// A response frame whose body is encrypted under `ctx`.
#[allow(dead_code)]
pub fn encrypted_frame(ctx: &CryptoContext, group: Group, command: Command, body: &[u8]) -> Vec<u8> {
    let mut header = CommandHeader::new(group, command).encrypted();
    header.cmd_high |= FLAG_ACK;
    let ciphertext = ctx.encrypt(body).unwrap();
    frame::encode(&header.encode_payload(&ciphertext)).to_vec()
}

/// The out-of-band session key push, encrypted under the bootstrap key.
#[allow(dead_code)]
pub fn session_key_push() -> Vec<u8> {
    let bootstrap = CryptoContext::bootstrap(SERIAL);
    encrypted_frame(
        &bootstrap,
        Group::Handshake,
        Command::SessionKey,
        &tlv::encode(&[(tag::A1, &SESSION_KEY)]),
    )
}

/// A comprehensive status body: 87.5 % battery, 31 C, port 1 at
/// 19.9 V / 2.3 A. Carries the leading pad byte decrypted bodies have.
#[allow(dead_code)]
pub fn comprehensive_status_body() -> Vec<u8> {
    let mut body = vec![0x00];
    body.extend_from_slice(&tlv::encode(&[
        (tag::A1, &[87, 5]),
        (tag::A2, &[0x00, 31]),
        (tag::A3, &[0x01, 0x00, 0x00, 0xC4, 0x01]),
        (tag::A4, &[0, 0, 2, 0xC7, 0x00, 0x17, 0x00]),
    ]));
    body
}

/// Scripts every reply of a complete power bank session: the four
/// handshake steps, the session key push, and both priming status polls.
#[allow(dead_code)]
pub fn script_full_handshake(handle: &MockHandle) {
    let session = CryptoContext::bootstrap(SERIAL).with_session_key(SESSION_KEY);
    handle.reply_with(vec![ack_frame(Group::Handshake, Command::Hello)]);
    handle.reply_with(vec![ack_frame(Group::Handshake, Command::Capabilities)]);
    handle.reply_with(vec![device_info_frame()]);
    handle.reply_with(vec![ack_frame(Group::Handshake, Command::CryptoSetup)]);
    handle.reply_with(vec![session_key_push()]);
    handle.reply_with(vec![encrypted_frame(
        &session,
        Group::Status,
        Command::ComprehensiveStatus,
        &comprehensive_status_body(),
    )]);
    handle.reply_with(vec![encrypted_frame(
        &session,
        Group::Status,
        Command::BatteryDetail,
        &tlv::encode(&[(tag::A1, &[0x01])]),
    )]);
}

#[allow(dead_code)]
pub fn drain_events(rx: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Strips the outer frame from a recorded write and returns its payload.
#[allow(dead_code)]
pub fn written_payload(written: &[u8]) -> &[u8] {
    assert_eq!(&written[..2], &[0xFF, 0x09], "writes must be framed");
    &written[4..written.len() - 1]
}
