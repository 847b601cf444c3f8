//! Simulated Dispenser
//!
//! An in-process [`GattPlatform`] that behaves like a dispenser exposing a
//! Nordic UART Service. Latencies run on tokio timers, so the whole link can
//! be driven under a paused clock. Failure modes are chosen up front through
//! [`SimulatorConfig`].

use crate::domain::{DeviceAddress, DispenserCommand};
use crate::infrastructure::bluetooth::error::{GattStatus, LinkError};
use crate::infrastructure::bluetooth::platform::{
    CharacteristicProperties, CommandCharacteristic, DiscoveredCharacteristic, DiscoveredService,
    GattPlatform, PlatformEvent, PlatformEventKind, PlatformEventSender, SessionId, WriteType,
};
use crate::infrastructure::bluetooth::protocol::SessionConfig;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// What service discovery reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// NUS with its RX characteristic
    CommandChannel,
    /// NUS without the RX characteristic
    MissingCharacteristic,
    /// Only unrelated services
    MissingService,
    /// Discovery completes with a non-success status
    Fail(GattStatus),
    /// Discovery never completes
    Hang,
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Delay before connect, discovery and disconnect outcomes are reported
    pub link_latency: Duration,
    /// Delay before an acknowledged write completes
    pub write_latency: Duration,
    pub discovery: DiscoveryOutcome,
    /// RX advertises acknowledged writes; otherwise write-without-response only
    pub acknowledged_writes: bool,
    /// Zero-based index of a write that completes with `GattStatus::FAILURE`
    pub fail_write_at: Option<usize>,
    /// Zero-based index of a write that cannot be queued at all
    pub reject_write_at: Option<usize>,
    /// Report `ConnectFailed` with this reason instead of linking
    pub connect_error: Option<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            link_latency: Duration::from_millis(50),
            write_latency: Duration::from_millis(20),
            discovery: DiscoveryOutcome::CommandChannel,
            acknowledged_writes: true,
            fail_write_at: None,
            reject_write_at: None,
            connect_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub session: SessionId,
    pub payload: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct SimState {
    events: Option<PlatformEventSender>,
    linked: Option<SessionId>,
    // Connects still in progress, and those among them already disconnected
    connecting: HashSet<SessionId>,
    closed: HashSet<SessionId>,
    writes: Vec<WriteRecord>,
    in_flight: usize,
    max_in_flight: usize,
    applied: DispenserCommand,
    connect_requests: Vec<SessionId>,
    discovery_requests: Vec<SessionId>,
    disconnect_requests: Vec<SessionId>,
}

impl SimState {
    fn emit(&self, session: SessionId, kind: PlatformEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(PlatformEvent::new(session, kind));
        }
    }

    fn apply(&mut self, payload: &[u8]) {
        if let Some(command) = DispenserCommand::from_token(payload) {
            if command != self.applied {
                info!(target: "simulator", "Dispenser now {}", command);
            }
            self.applied = command;
        }
    }
}

#[derive(Clone)]
pub struct SimulatedDispenser {
    config: SimulatorConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDispenser {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        lock_state(&self.state)
    }

    fn services(&self) -> Vec<DiscoveredService> {
        let gatt = SessionConfig::default();
        let generic_access = DiscoveredService {
            uuid: 0x00001800_0000_1000_8000_00805f9b34fb,
            characteristics: vec![],
        };
        let rx = DiscoveredCharacteristic {
            uuid: gatt.command_char_uuid,
            properties: CharacteristicProperties {
                write: self.config.acknowledged_writes,
                write_without_response: true,
            },
        };
        let tx = DiscoveredCharacteristic {
            uuid: 0x6e400003_b5a3_f393_e0a9_e50e24dcca9e,
            properties: CharacteristicProperties::default(),
        };

        match self.config.discovery {
            DiscoveryOutcome::MissingService => vec![generic_access],
            DiscoveryOutcome::MissingCharacteristic => vec![
                generic_access,
                DiscoveredService {
                    uuid: gatt.service_uuid,
                    characteristics: vec![tx],
                },
            ],
            _ => vec![
                generic_access,
                DiscoveredService {
                    uuid: gatt.service_uuid,
                    characteristics: vec![rx, tx],
                },
            ],
        }
    }

    /// Drop the current link from the dispenser side
    pub fn drop_link(&self) {
        let mut state = self.lock();
        if let Some(session) = state.linked.take() {
            debug!(target: "simulator", "Dropping link for session {}", session);
            state.emit(session, PlatformEventKind::Disconnected);
        }
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn written_tokens(&self) -> Vec<Vec<u8>> {
        self.lock().writes.iter().map(|w| w.payload.clone()).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Last command the dispenser acted on
    pub fn applied_command(&self) -> DispenserCommand {
        self.lock().applied
    }

    pub fn linked_session(&self) -> Option<SessionId> {
        self.lock().linked
    }

    pub fn connect_requests(&self) -> Vec<SessionId> {
        self.lock().connect_requests.clone()
    }

    pub fn discovery_requests(&self) -> Vec<SessionId> {
        self.lock().discovery_requests.clone()
    }

    pub fn disconnect_requests(&self) -> Vec<SessionId> {
        self.lock().disconnect_requests.clone()
    }
}

fn lock_state(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GattPlatform for SimulatedDispenser {
    fn attach(&self, events: PlatformEventSender) {
        self.lock().events = Some(events);
    }

    fn connect(&self, session: SessionId, address: DeviceAddress) -> Result<(), LinkError> {
        debug!(target: "simulator", "Connect {} as session {}", address, session);
        {
            let mut state = self.lock();
            state.connect_requests.push(session);
            state.connecting.insert(session);
        }

        let state = self.state.clone();
        let latency = self.config.link_latency;
        let failure = self.config.connect_error.clone();
        tokio::spawn(async move {
            sleep(latency).await;
            let mut state = lock_state(&state);
            state.connecting.remove(&session);
            if state.closed.remove(&session) {
                return;
            }
            match failure {
                Some(reason) => state.emit(session, PlatformEventKind::ConnectFailed(reason)),
                None => {
                    state.linked = Some(session);
                    state.emit(session, PlatformEventKind::Connected);
                }
            }
        });
        Ok(())
    }

    fn discover_services(&self, session: SessionId) -> Result<(), LinkError> {
        {
            let mut state = self.lock();
            if state.linked != Some(session) {
                return Err(LinkError::ConnectFailed("not connected".to_string()));
            }
            state.discovery_requests.push(session);
        }

        let result = match self.config.discovery {
            DiscoveryOutcome::Hang => return Ok(()),
            DiscoveryOutcome::Fail(status) => Err(status),
            _ => Ok(self.services()),
        };
        let state = self.state.clone();
        let latency = self.config.link_latency;
        tokio::spawn(async move {
            sleep(latency).await;
            let state = lock_state(&state);
            if state.linked == Some(session) {
                state.emit(session, PlatformEventKind::ServicesDiscovered(result));
            }
        });
        Ok(())
    }

    fn write(
        &self,
        session: SessionId,
        characteristic: &CommandCharacteristic,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let mut state = self.lock();
        if state.linked != Some(session) {
            return Err(LinkError::WriteNotIssued("not connected".to_string()));
        }

        let index = state.writes.len();
        if self.config.reject_write_at == Some(index) {
            return Err(LinkError::WriteNotIssued("write queue full".to_string()));
        }
        state.writes.push(WriteRecord {
            session,
            payload: payload.to_vec(),
            at: Instant::now(),
        });

        if characteristic.write_type == WriteType::WithoutResponse {
            state.apply(payload);
            return Ok(());
        }

        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        drop(state);

        let status = if self.config.fail_write_at == Some(index) {
            GattStatus::FAILURE
        } else {
            GattStatus::SUCCESS
        };
        let payload = payload.to_vec();
        let shared = self.state.clone();
        let latency = self.config.write_latency;
        tokio::spawn(async move {
            sleep(latency).await;
            let mut state = lock_state(&shared);
            state.in_flight -= 1;
            if status.is_success() {
                state.apply(&payload);
            }
            state.emit(session, PlatformEventKind::CharacteristicWritten(status));
        });
        Ok(())
    }

    fn disconnect(&self, session: SessionId) {
        {
            let mut state = self.lock();
            state.disconnect_requests.push(session);
            if state.connecting.contains(&session) {
                state.closed.insert(session);
            }
        }

        let state = self.state.clone();
        let latency = self.config.link_latency;
        tokio::spawn(async move {
            sleep(latency).await;
            let mut state = lock_state(&state);
            if state.linked == Some(session) {
                state.linked = None;
            }
            state.emit(session, PlatformEventKind::Disconnected);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connect_is_forgotten_once_settled() {
        let sim = SimulatedDispenser::new(SimulatorConfig::default());
        let (events, mut received) = tokio::sync::mpsc::unbounded_channel();
        sim.attach(events);

        let address = DeviceAddress::parse(ADDRESS).unwrap();
        sim.connect(SessionId(1), address).unwrap();
        sim.disconnect(SessionId(1));
        assert_eq!(sim.lock().closed.len(), 1);

        sleep(Duration::from_secs(1)).await;
        assert!(sim.lock().closed.is_empty());
        assert!(sim.lock().connecting.is_empty());
        assert_eq!(sim.linked_session(), None);

        let event = received.try_recv().unwrap();
        assert_eq!(event.kind, PlatformEventKind::Disconnected);
        assert!(received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_linked_sessions_leaves_nothing_behind() {
        let sim = SimulatedDispenser::new(SimulatorConfig::default());
        let (events, _received) = tokio::sync::mpsc::unbounded_channel();
        sim.attach(events);
        let address = DeviceAddress::parse(ADDRESS).unwrap();

        for id in 1..=50 {
            sim.connect(SessionId(id), address).unwrap();
            sleep(Duration::from_secs(1)).await;
            assert_eq!(sim.linked_session(), Some(SessionId(id)));
            sim.disconnect(SessionId(id));
            sleep(Duration::from_secs(1)).await;
        }

        assert!(sim.lock().closed.is_empty());
        assert!(sim.lock().connecting.is_empty());
        assert_eq!(sim.disconnect_requests().len(), 50);
    }
}
