//! Link State Machine
//!
//! Owns the one live session and the published [`ConnectionState`]. Every
//! input (user requests, platform callbacks, heartbeat failures, timers) is
//! a [`LinkMessage`] applied by [`LinkStateMachine::handle`] on a single task,
//! so transitions happen in one total order.
//!
//! ```text
//!                connect(ok)             discovery ok
//! Disconnected ─────────────▶ Connecting ─────────────▶ Connected
//!      ▲                          │                         │
//!      │ link closed              │ any failure             │ write failure
//!      │ (unless Error)           ▼                         ▼
//!      └────────────────────── Error ◀──────────────────────┘
//! ```

use crate::domain::{ActiveCommand, ConnectionState, DeviceAddress};
use crate::infrastructure::address_store::AddressStore;
use crate::infrastructure::bluetooth::error::{GattStatus, LinkError};
use crate::infrastructure::bluetooth::heartbeat::Heartbeat;
use crate::infrastructure::bluetooth::platform::{
    select_command_characteristic, DiscoveredService, GattPlatform, PlatformEvent,
    PlatformEventKind, SessionId,
};
use crate::infrastructure::bluetooth::protocol::SessionConfig;
use crate::infrastructure::bluetooth::writer::{SessionLink, WriteSerializer};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum LinkMessage {
    Connect(String),
    Disconnect,
    Platform(PlatformEvent),
    WriteFailed {
        session: SessionId,
        error: LinkError,
    },
    DiscoveryTimedOut(SessionId),
    CloseTimedOut(SessionId),
    Shutdown,
}

struct LiveSession {
    id: SessionId,
    address: DeviceAddress,
    link: Option<Arc<SessionLink>>,
    heartbeat: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    /// Platform disconnect already requested
    closing: bool,
}

impl LiveSession {
    fn new(id: SessionId, address: DeviceAddress) -> Self {
        Self {
            id,
            address,
            link: None,
            heartbeat: None,
            timer: None,
            closing: false,
        }
    }

    fn stop_tasks(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct LinkStateMachine {
    platform: Arc<dyn GattPlatform>,
    writer: Arc<WriteSerializer>,
    store: Arc<dyn AddressStore>,
    intent: ActiveCommand,
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    last_error: Arc<Mutex<Option<LinkError>>>,
    inbox: mpsc::UnboundedSender<LinkMessage>,
    session: Option<LiveSession>,
    next_session: u64,
}

impl LinkStateMachine {
    pub fn new(
        platform: Arc<dyn GattPlatform>,
        writer: Arc<WriteSerializer>,
        store: Arc<dyn AddressStore>,
        intent: ActiveCommand,
        config: SessionConfig,
        inbox: mpsc::UnboundedSender<LinkMessage>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            platform,
            writer,
            store,
            intent,
            config,
            state,
            last_error: Arc::new(Mutex::new(None)),
            inbox,
            session: None,
            next_session: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn error_slot(&self) -> Arc<Mutex<Option<LinkError>>> {
        self.last_error.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Drive the machine until `Shutdown`
    pub async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<LinkMessage>,
        mut events: mpsc::UnboundedReceiver<PlatformEvent>,
    ) {
        loop {
            let message = tokio::select! {
                Some(message) = inbox.recv() => message,
                Some(event) = events.recv() => LinkMessage::Platform(event),
                else => break,
            };
            if matches!(message, LinkMessage::Shutdown) {
                break;
            }
            self.handle(message);
        }
        self.shutdown();
    }

    pub fn handle(&mut self, message: LinkMessage) {
        match message {
            LinkMessage::Connect(address) => self.connect(&address),
            LinkMessage::Disconnect => self.disconnect(),
            LinkMessage::Platform(event) => self.on_platform_event(event),
            LinkMessage::WriteFailed { session, error } => {
                if self.is_current(session) {
                    self.escalate(error);
                }
            }
            LinkMessage::DiscoveryTimedOut(session) => {
                if self.is_current(session) && self.state() == ConnectionState::Connecting {
                    self.escalate(LinkError::DiscoveryTimeout);
                }
            }
            LinkMessage::CloseTimedOut(session) => {
                if self.is_current(session) {
                    warn!("Platform never confirmed disconnect of session {}", session);
                    self.on_link_closed();
                }
            }
            LinkMessage::Shutdown => self.shutdown(),
        }
    }

    fn connect(&mut self, text: &str) {
        self.set_last_error(None);
        self.abandon_session();

        let address = match DeviceAddress::parse(text) {
            Ok(address) => address,
            Err(e) => return self.escalate(e.into()),
        };

        self.next_session += 1;
        let id = SessionId(self.next_session);
        info!("Connecting to {} (session {})", address, id);

        let mut session = LiveSession::new(id, address);
        session.timer = Some(schedule(
            &self.inbox,
            self.config.discovery_timeout,
            LinkMessage::DiscoveryTimedOut(id),
        ));
        self.session = Some(session);
        self.publish(ConnectionState::Connecting);

        if let Err(e) = self.platform.connect(id, address) {
            self.escalate(e);
        }
    }

    fn disconnect(&mut self) {
        self.writer.revoke();

        let Some(session) = self.session.as_mut() else {
            if self.state() != ConnectionState::Error {
                self.publish(ConnectionState::Disconnected);
            }
            return;
        };
        if session.closing {
            return;
        }

        info!("Disconnecting session {}", session.id);
        session.stop_tasks();
        session.closing = true;
        session.timer = Some(schedule(
            &self.inbox,
            self.config.discovery_timeout,
            LinkMessage::CloseTimedOut(session.id),
        ));
        self.platform.disconnect(session.id);
    }

    fn on_platform_event(&mut self, event: PlatformEvent) {
        let Some(session) = self.session.as_ref().filter(|s| s.id == event.session) else {
            return self.on_stale_event(event);
        };
        let id = session.id;
        let closing = session.closing;
        let discovered = session.link.is_some();

        match event.kind {
            PlatformEventKind::Connected => {
                if closing {
                    // The link came up after its teardown was requested
                    self.platform.disconnect(id);
                    return;
                }
                if discovered {
                    return;
                }
                info!("Link up on session {}, discovering services", id);
                if let Err(e) = self.platform.discover_services(id) {
                    self.escalate(e);
                }
            }
            PlatformEventKind::ConnectFailed(reason) => {
                if !closing {
                    self.escalate(LinkError::ConnectFailed(reason));
                }
            }
            PlatformEventKind::ServicesDiscovered(result) => {
                if !closing && !discovered {
                    self.on_services_discovered(result);
                }
            }
            PlatformEventKind::CharacteristicWritten(status) => {
                if let Some(link) = &session.link {
                    link.complete(status);
                }
            }
            PlatformEventKind::Disconnected => self.on_link_closed(),
        }
    }

    /// Events from a session that is no longer current. A link that comes up
    /// after being superseded still holds the device and must be closed.
    fn on_stale_event(&self, event: PlatformEvent) {
        match event.kind {
            PlatformEventKind::Connected | PlatformEventKind::ServicesDiscovered(_) => {
                warn!("Stale session {} came up late, closing it", event.session);
                self.platform.disconnect(event.session);
            }
            kind => debug!("Ignoring {:?} from stale session {}", kind, event.session),
        }
    }

    fn on_services_discovered(&mut self, result: Result<Vec<DiscoveredService>, GattStatus>) {
        let services = match result {
            Ok(services) => services,
            Err(status) => return self.escalate(LinkError::DiscoveryFailed(status)),
        };
        let characteristic = match select_command_characteristic(&services, &self.config) {
            Ok(characteristic) => characteristic,
            Err(e) => return self.escalate(e),
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let Some(timer) = session.timer.take() {
            timer.abort();
        }
        let (link, completions) = SessionLink::new(session.id, characteristic);
        let link = Arc::new(link);
        self.writer.bind(link.clone());
        session.link = Some(link.clone());
        let address = session.address;
        info!("Session {} connected to {}", session.id, address);

        let heartbeat = Heartbeat::new(
            link,
            completions,
            self.writer.clone(),
            self.intent.clone(),
            self.config.heartbeat_interval,
            self.inbox.clone(),
        );
        session.heartbeat = Some(heartbeat.spawn());

        self.publish(ConnectionState::Connected);
        self.persist(address);
    }

    fn on_link_closed(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop_tasks();
            info!("Link closed for session {}", session.id);
        }
        self.writer.revoke();

        if self.state() == ConnectionState::Error {
            debug!("Keeping Error state after link close");
        } else {
            self.publish(ConnectionState::Disconnected);
        }
    }

    /// Single failure path: stop the heartbeat, request a platform
    /// disconnect, publish `Error`.
    fn escalate(&mut self, error: LinkError) {
        error!("Link error: {}", error);
        self.writer.revoke();
        if let Some(session) = self.session.as_mut() {
            session.stop_tasks();
            if !session.closing {
                session.closing = true;
                self.platform.disconnect(session.id);
            }
        }
        self.set_last_error(Some(error));
        self.publish(ConnectionState::Error);
    }

    /// Drop the current session without touching the published state. Late
    /// callbacks from it no longer match and are ignored.
    fn abandon_session(&mut self) {
        self.writer.revoke();
        if let Some(mut session) = self.session.take() {
            debug!("Superseding session {}", session.id);
            session.stop_tasks();
            if !session.closing {
                self.platform.disconnect(session.id);
            }
        }
    }

    fn shutdown(&mut self) {
        self.abandon_session();
        if self.state() != ConnectionState::Error {
            self.publish(ConnectionState::Disconnected);
        }
    }

    fn persist(&self, address: DeviceAddress) {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || match store.save(&address) {
            Ok(()) => debug!("Persisted address {}", address),
            Err(e) => warn!("Could not persist address {}: {:#}", address, e),
        });
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session)
    }

    fn set_last_error(&self, error: Option<LinkError>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn publish(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("Connection state: {} -> {}", current, next);
            *current = next;
            true
        });
    }
}

fn schedule(
    inbox: &mpsc::UnboundedSender<LinkMessage>,
    after: Duration,
    message: LinkMessage,
) -> JoinHandle<()> {
    let inbox = inbox.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = inbox.send(message);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::address_store::MemoryAddressStore;
    use crate::infrastructure::bluetooth::simulator::{
        DiscoveryOutcome, SimulatedDispenser, SimulatorConfig,
    };

    use crate::infrastructure::bluetooth::platform::{CommandCharacteristic, PlatformEventSender};
    use std::time::Duration;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    /// Confirms a disconnect at once, even while the open is still running,
    /// and lets that open finish afterwards. Session 1 links after 200ms,
    /// later sessions after 50ms.
    #[derive(Default)]
    struct LateLinkPlatform {
        events: Mutex<Option<PlatformEventSender>>,
        disconnects: Mutex<Vec<SessionId>>,
    }

    impl LateLinkPlatform {
        fn disconnects(&self) -> Vec<SessionId> {
            self.disconnects.lock().unwrap().clone()
        }
    }

    impl GattPlatform for LateLinkPlatform {
        fn attach(&self, events: PlatformEventSender) {
            *self.events.lock().unwrap() = Some(events);
        }

        fn connect(&self, session: SessionId, _address: DeviceAddress) -> Result<(), LinkError> {
            let events = self.events.lock().unwrap().clone();
            let delay = if session == SessionId(1) { 200 } else { 50 };
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if let Some(events) = events {
                    let _ = events.send(PlatformEvent::new(session, PlatformEventKind::Connected));
                }
            });
            Ok(())
        }

        fn discover_services(&self, _session: SessionId) -> Result<(), LinkError> {
            Ok(())
        }

        fn write(
            &self,
            _session: SessionId,
            _characteristic: &CommandCharacteristic,
            _payload: &[u8],
        ) -> Result<(), LinkError> {
            Ok(())
        }

        fn disconnect(&self, session: SessionId) {
            self.disconnects.lock().unwrap().push(session);
            if let Some(events) = self.events.lock().unwrap().as_ref() {
                let _ = events.send(PlatformEvent::new(session, PlatformEventKind::Disconnected));
            }
        }
    }

    fn late_link_machine() -> (
        LinkStateMachine,
        Arc<LateLinkPlatform>,
        mpsc::UnboundedReceiver<PlatformEvent>,
    ) {
        let platform = Arc::new(LateLinkPlatform::default());
        let (events_tx, events) = mpsc::unbounded_channel();
        platform.attach(events_tx);
        let (inbox_tx, _) = mpsc::unbounded_channel();
        let machine = LinkStateMachine::new(
            platform.clone(),
            Arc::new(WriteSerializer::new(platform.clone())),
            Arc::new(MemoryAddressStore::new(None)),
            ActiveCommand::new(),
            SessionConfig::default(),
            inbox_tx,
        );
        (machine, platform, events)
    }

    struct Harness {
        machine: LinkStateMachine,
        sim: Arc<SimulatedDispenser>,
        events: mpsc::UnboundedReceiver<PlatformEvent>,
        inbox: mpsc::UnboundedReceiver<LinkMessage>,
    }

    impl Harness {
        fn new(config: SimulatorConfig) -> Self {
            let sim = Arc::new(SimulatedDispenser::new(config));
            let (events_tx, events) = mpsc::unbounded_channel();
            sim.attach(events_tx);
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let machine = LinkStateMachine::new(
                sim.clone(),
                Arc::new(WriteSerializer::new(sim.clone())),
                Arc::new(MemoryAddressStore::new(None)),
                ActiveCommand::new(),
                SessionConfig::default(),
                inbox_tx,
            );
            Self {
                machine,
                sim,
                events,
                inbox,
            }
        }

        /// Feed the next platform event into the machine
        async fn pump(&mut self) -> PlatformEventKind {
            let event = self.events.recv().await.expect("platform event");
            let kind = event.kind.clone();
            self.machine.handle(LinkMessage::Platform(event));
            kind
        }

        fn last_error(&self) -> Option<LinkError> {
            self.machine.error_slot().lock().unwrap().clone()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_address_goes_straight_to_error() {
        let mut h = Harness::new(SimulatorConfig::default());
        let mut states = h.machine.subscribe();

        h.machine.handle(LinkMessage::Connect("not-a-mac".to_string()));

        assert_eq!(h.machine.state(), ConnectionState::Error);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Error);
        assert!(h.sim.connect_requests().is_empty());
        assert_eq!(
            h.last_error(),
            Some(LinkError::InvalidAddress("not-a-mac".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_reaches_connected() {
        let mut h = Harness::new(SimulatorConfig::default());

        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        assert_eq!(h.machine.state(), ConnectionState::Connecting);

        assert_eq!(h.pump().await, PlatformEventKind::Connected);
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
        assert_eq!(h.sim.discovery_requests(), vec![SessionId(1)]);

        assert!(matches!(
            h.pump().await,
            PlatformEventKind::ServicesDiscovered(Ok(_))
        ));
        assert_eq!(h.machine.state(), ConnectionState::Connected);
        assert_eq!(h.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_an_error() {
        let mut h = Harness::new(SimulatorConfig {
            discovery: DiscoveryOutcome::MissingCharacteristic,
            ..Default::default()
        });

        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        h.pump().await;
        h.pump().await;

        assert_eq!(h.machine.state(), ConnectionState::Error);
        assert_eq!(h.last_error(), Some(LinkError::CharacteristicNotFound));
        assert_eq!(h.sim.disconnect_requests(), vec![SessionId(1)]);
        assert!(h.sim.written_tokens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_callback_does_not_clear_error() {
        let mut h = Harness::new(SimulatorConfig {
            discovery: DiscoveryOutcome::Fail(GattStatus(0x81)),
            ..Default::default()
        });

        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        h.pump().await;
        h.pump().await;
        assert_eq!(h.machine.state(), ConnectionState::Error);
        assert_eq!(
            h.last_error(),
            Some(LinkError::DiscoveryFailed(GattStatus(0x81)))
        );

        assert_eq!(h.pump().await, PlatformEventKind::Disconnected);
        assert_eq!(h.machine.state(), ConnectionState::Error);

        // A user disconnect with nothing left to close keeps Error as well
        h.machine.handle(LinkMessage::Disconnect);
        assert_eq!(h.machine.state(), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_events_are_ignored() {
        let mut h = Harness::new(SimulatorConfig::default());

        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        assert_eq!(h.sim.disconnect_requests(), vec![SessionId(1)]);

        // Same address, older session: must not move the machine
        h.machine.handle(LinkMessage::Platform(PlatformEvent::new(
            SessionId(1),
            PlatformEventKind::Disconnected,
        )));
        assert_eq!(h.machine.state(), ConnectionState::Connecting);
        h.machine.handle(LinkMessage::WriteFailed {
            session: SessionId(1),
            error: LinkError::WriteFailed(GattStatus::FAILURE),
        });
        assert_eq!(h.machine.state(), ConnectionState::Connecting);

        loop {
            h.pump().await;
            if h.machine.state() != ConnectionState::Connecting {
                break;
            }
        }
        assert_eq!(h.machine.state(), ConnectionState::Connected);
        assert_eq!(h.sim.discovery_requests(), vec![SessionId(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_discovery_times_out() {
        let mut h = Harness::new(SimulatorConfig {
            discovery: DiscoveryOutcome::Hang,
            ..Default::default()
        });

        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        h.pump().await;
        assert_eq!(h.machine.state(), ConnectionState::Connecting);

        let timed_out = h.inbox.recv().await.unwrap();
        assert!(matches!(timed_out, LinkMessage::DiscoveryTimedOut(SessionId(1))));
        h.machine.handle(timed_out);

        assert_eq!(h.machine.state(), ConnectionState::Error);
        assert_eq!(h.last_error(), Some(LinkError::DiscoveryTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_an_error() {
        let mut h = Harness::new(SimulatorConfig {
            connect_error: Some("device unreachable".to_string()),
            ..Default::default()
        });

        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        h.pump().await;

        assert_eq!(h.machine.state(), ConnectionState::Error);
        assert_eq!(
            h.last_error(),
            Some(LinkError::ConnectFailed("device unreachable".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_waits_for_platform() {
        let mut h = Harness::new(SimulatorConfig::default());

        h.machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        h.pump().await;
        h.pump().await;
        assert_eq!(h.machine.state(), ConnectionState::Connected);

        h.machine.handle(LinkMessage::Disconnect);
        assert_eq!(h.machine.state(), ConnectionState::Connected);

        loop {
            if h.pump().await == PlatformEventKind::Disconnected {
                break;
            }
        }
        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_session_is_a_no_op() {
        let mut h = Harness::new(SimulatorConfig::default());
        let states = h.machine.subscribe();

        h.machine.handle(LinkMessage::Disconnect);
        h.machine.handle(LinkMessage::Disconnect);

        assert_eq!(h.machine.state(), ConnectionState::Disconnected);
        assert!(!states.has_changed().unwrap());
        assert!(h.sim.disconnect_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_session_that_links_late_is_closed() {
        let (mut machine, platform, mut events) = late_link_machine();

        machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        assert_eq!(platform.disconnects(), vec![SessionId(1)]);

        // Disconnected(1) at once, Connected(2) at 50ms, Connected(1) at 200ms
        for _ in 0..3 {
            let event = events.recv().await.unwrap();
            machine.handle(LinkMessage::Platform(event));
        }

        assert_eq!(platform.disconnects(), vec![SessionId(1), SessionId(1)]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_up_after_user_disconnect_is_closed() {
        let (mut machine, platform, _events) = late_link_machine();

        machine.handle(LinkMessage::Connect(ADDRESS.to_string()));
        machine.handle(LinkMessage::Disconnect);
        assert_eq!(platform.disconnects(), vec![SessionId(1)]);

        // Link-up delivered before the disconnect confirmation is handled
        machine.handle(LinkMessage::Platform(PlatformEvent::new(
            SessionId(1),
            PlatformEventKind::Connected,
        )));
        assert_eq!(platform.disconnects(), vec![SessionId(1), SessionId(1)]);
    }
}
