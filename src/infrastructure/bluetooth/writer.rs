//! Write Serializer
//!
//! At most one write is issued to the command characteristic at a time.
//! The gate is held only while a write is being *issued*; completions come
//! back later through the session's [`CompletionSlot`].

use crate::infrastructure::bluetooth::error::{GattStatus, LinkError};
use crate::infrastructure::bluetooth::platform::{
    CommandCharacteristic, GattPlatform, SessionId, WriteType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::trace;

/// Single-slot completion channel. A newer status overwrites one that has
/// not been consumed yet.
#[derive(Debug)]
pub struct CompletionSlot {
    tx: watch::Sender<Option<GattStatus>>,
}

#[derive(Debug)]
pub struct CompletionReceiver {
    rx: watch::Receiver<Option<GattStatus>>,
}

impl CompletionSlot {
    pub fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, CompletionReceiver { rx })
    }

    pub fn complete(&self, status: GattStatus) {
        self.tx.send_replace(Some(status));
    }
}

impl CompletionReceiver {
    /// Wait for the next completion. `None` once the slot is gone.
    pub async fn next(&mut self) -> Option<GattStatus> {
        self.rx.changed().await.ok()?;
        *self.rx.borrow_and_update()
    }
}

/// A connected session as seen by the writers: the negotiated
/// characteristic plus a liveness flag that the state machine revokes.
#[derive(Debug)]
pub struct SessionLink {
    pub id: SessionId,
    pub characteristic: CommandCharacteristic,
    completions: CompletionSlot,
    live: AtomicBool,
}

impl SessionLink {
    pub fn new(id: SessionId, characteristic: CommandCharacteristic) -> (Self, CompletionReceiver) {
        let (completions, rx) = CompletionSlot::new();
        let link = Self {
            id,
            characteristic,
            completions,
            live: AtomicBool::new(true),
        };
        (link, rx)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Deliver a platform write completion
    pub fn complete(&self, status: GattStatus) {
        self.completions.complete(status);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIssue {
    Issued,
    /// The session was revoked; nothing was sent
    Revoked,
}

pub struct WriteSerializer {
    platform: Arc<dyn GattPlatform>,
    bound: Mutex<Option<Arc<SessionLink>>>,
}

impl WriteSerializer {
    pub fn new(platform: Arc<dyn GattPlatform>) -> Self {
        Self {
            platform,
            bound: Mutex::new(None),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Option<Arc<SessionLink>>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `link` the session that [`revoke`](Self::revoke) acts on
    pub fn bind(&self, link: Arc<SessionLink>) {
        let mut bound = self.gate();
        if let Some(previous) = bound.replace(link) {
            previous.live.store(false, Ordering::Release);
        }
    }

    /// Revoke the bound session. Once this returns no further write can be
    /// issued for it; a write already handed to the platform is not retracted.
    pub fn revoke(&self) {
        let mut bound = self.gate();
        if let Some(link) = bound.take() {
            link.live.store(false, Ordering::Release);
        }
    }

    /// Issue one write. Failure to queue is reported as `WriteNotIssued`.
    pub fn write(&self, link: &SessionLink, payload: &[u8]) -> Result<WriteIssue, LinkError> {
        let _gate = self.gate();
        if !link.is_live() {
            return Ok(WriteIssue::Revoked);
        }

        trace!("Issuing write on session {}: {:02X?}", link.id, payload);
        self.platform.write(link.id, &link.characteristic, payload)?;

        if link.characteristic.write_type == WriteType::WithoutResponse {
            link.complete(GattStatus::SUCCESS);
        }
        Ok(WriteIssue::Issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceAddress;
    use crate::infrastructure::bluetooth::protocol::SessionConfig;
    use crate::infrastructure::bluetooth::simulator::{SimulatedDispenser, SimulatorConfig};
    use std::time::Duration;

    fn characteristic(write_type: WriteType) -> CommandCharacteristic {
        let config = SessionConfig::default();
        CommandCharacteristic {
            service_uuid: config.service_uuid,
            uuid: config.command_char_uuid,
            write_type,
        }
    }

    async fn linked_simulator(session: SessionId) -> Arc<SimulatedDispenser> {
        let sim = Arc::new(SimulatedDispenser::new(SimulatorConfig::default()));
        sim.connect(session, DeviceAddress::parse("AA:BB:CC:DD:EE:FF").unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sim.linked_session(), Some(session));
        sim
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_write_completes_locally() {
        let sim = linked_simulator(SessionId(1)).await;
        let writer = WriteSerializer::new(sim.clone());
        let (link, mut completions) =
            SessionLink::new(SessionId(1), characteristic(WriteType::WithoutResponse));

        assert_eq!(writer.write(&link, b"$R"), Ok(WriteIssue::Issued));
        assert_eq!(completions.next().await, Some(GattStatus::SUCCESS));
        assert_eq!(sim.written_tokens(), vec![b"$R".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_failure_is_an_error() {
        let sim = linked_simulator(SessionId(1)).await;
        let writer = WriteSerializer::new(sim.clone());
        let (stale, _completions) =
            SessionLink::new(SessionId(7), characteristic(WriteType::WithResponse));

        assert!(matches!(
            writer.write(&stale, b"$H"),
            Err(LinkError::WriteNotIssued(_))
        ));
        assert!(sim.written_tokens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_link_writes_nothing() {
        let sim = linked_simulator(SessionId(1)).await;
        let writer = WriteSerializer::new(sim.clone());
        let (link, _completions) =
            SessionLink::new(SessionId(1), characteristic(WriteType::WithResponse));
        let link = Arc::new(link);

        writer.bind(link.clone());
        writer.revoke();

        assert!(!link.is_live());
        assert_eq!(writer.write(&link, b"$H"), Ok(WriteIssue::Revoked));
        assert!(sim.written_tokens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_completion_wins() {
        let (slot, mut rx) = CompletionSlot::new();
        slot.complete(GattStatus::SUCCESS);
        slot.complete(GattStatus(0x85));
        assert_eq!(rx.next().await, Some(GattStatus(0x85)));
        drop(slot);
        assert_eq!(rx.next().await, None);
    }
}
