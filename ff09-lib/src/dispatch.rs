//! Request correlation and event fan-out.
//!
//! The protocol has no sequence numbers: the device simply answers the last
//! command it was sent, and pushes unsolicited frames on the same
//! characteristic. Correlation is therefore a single pending slot. Whatever
//! notification arrives next resolves the waiter, which holds as long as
//! commands are serialized, and unsolicited traffic while nothing is
//! pending just flows through the decode path.

use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};

use crate::crypto::CryptoState;
use crate::error::Ff09Error;
use crate::handshake::DeviceInfo;
use crate::status::PowerStatus;

/// Session happenings pushed to subscribers.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Link established (`true`) or torn down (`false`).
    Connection(bool),
    /// Device identity learned during the handshake.
    Info(DeviceInfo),
    /// Telemetry snapshot taken after a status body was applied.
    Status(PowerStatus),
    /// The encryption layer moved to a new state.
    Crypto(CryptoState),
    /// A non-fatal protocol problem worth surfacing to the application.
    Fault(String),
}

/// Broadcast channel wrapper. Emitting with no subscribers is a no-op.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DeviceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}

/// The single pending-response slot.
#[derive(Debug, Default)]
pub struct Correlator {
    slot: Mutex<Option<oneshot::Sender<Bytes>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for an outgoing command. Fails when a response is
    /// already being awaited; callers serialize commands.
    pub fn register(&self) -> Result<oneshot::Receiver<Bytes>, Ff09Error> {
        let mut slot = self.slot.lock().expect("correlator lock poisoned");
        if slot.is_some() {
            return Err(Ff09Error::Protocol(
                "a command is already awaiting its response".to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(rx)
    }

    /// Hands `bytes` to the waiter, if one exists. Returns whether a waiter
    /// was resolved; a slot cleared by timeout stays empty, so late frames
    /// cannot reach a stale waiter.
    pub fn resolve(&self, bytes: Bytes) -> bool {
        let waiter = self.slot.lock().expect("correlator lock poisoned").take();
        match waiter {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Abandons the pending response, dropping the waiter's sender.
    pub fn clear(&self) {
        self.slot.lock().expect("correlator lock poisoned").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_resolve() {
        let correlator = Correlator::new();
        let rx = correlator.register().unwrap();
        assert!(correlator.resolve(Bytes::from_static(b"pong")));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[test]
    fn test_second_register_is_rejected() {
        let correlator = Correlator::new();
        let _rx = correlator.register().unwrap();
        assert!(matches!(
            correlator.register(),
            Err(Ff09Error::Protocol(_))
        ));
    }

    #[test]
    fn test_resolve_without_waiter_reports_unclaimed() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(Bytes::from_static(b"stray")));
    }

    #[tokio::test]
    async fn test_cleared_slot_rejects_late_frames() {
        let correlator = Correlator::new();
        let rx = correlator.register().unwrap();
        correlator.clear();

        // The waiter learns its sender is gone.
        assert!(rx.await.is_err());
        // A frame arriving after the clear resolves nothing, and the slot
        // is free for the next command.
        assert!(!correlator.resolve(Bytes::from_static(b"late")));
        let rx = correlator.register().unwrap();
        assert!(correlator.resolve(Bytes::from_static(b"fresh")));
        assert_eq!(rx.await.unwrap(), Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_event_bus_fan_out() {
        let bus = EventBus::default();
        // No subscribers yet: emit must not fail.
        bus.emit(DeviceEvent::Connection(true));

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(DeviceEvent::Crypto(CryptoState::Initial));
        assert!(matches!(
            a.recv().await.unwrap(),
            DeviceEvent::Crypto(CryptoState::Initial)
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            DeviceEvent::Crypto(CryptoState::Initial)
        ));
    }
}
