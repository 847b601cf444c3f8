//! Dispenser Service
//!
//! Public surface of the session core. Requests are forwarded to the link
//! state machine running on its own task; `press`/`release` only touch the
//! shared [`ActiveCommand`] and never wait on Bluetooth I/O.

use crate::domain::{ActiveCommand, ConnectionState, DeviceAddress, DispenserCommand};
use crate::infrastructure::address_store::AddressStore;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::link::{LinkMessage, LinkStateMachine};
use crate::infrastructure::bluetooth::platform::GattPlatform;
use crate::infrastructure::bluetooth::protocol::SessionConfig;
use crate::infrastructure::bluetooth::writer::WriteSerializer;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Session façade for one dispenser
pub struct DispenserService {
    inbox: mpsc::UnboundedSender<LinkMessage>,
    state: watch::Receiver<ConnectionState>,
    last_error: Arc<Mutex<Option<LinkError>>>,
    intent: ActiveCommand,
    writer: Arc<WriteSerializer>,
    store: Arc<dyn AddressStore>,
    task: Option<JoinHandle<()>>,
}

impl DispenserService {
    /// Start the link task on the current tokio runtime
    pub fn new(
        platform: Arc<dyn GattPlatform>,
        store: Arc<dyn AddressStore>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        platform.attach(events_tx);

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let intent = ActiveCommand::new();
        let writer = Arc::new(WriteSerializer::new(platform.clone()));
        let machine = LinkStateMachine::new(
            platform,
            writer.clone(),
            store.clone(),
            intent.clone(),
            config,
            inbox.clone(),
        );
        let state = machine.subscribe();
        let last_error = machine.error_slot();
        let task = tokio::spawn(machine.run(inbox_rx, events_rx));

        Self {
            inbox,
            state,
            last_error,
            intent,
            writer,
            store,
            task: Some(task),
        }
    }

    /// Open a session. The outcome is observed through the state stream.
    pub fn connect(&self, address: &str) {
        // A new link starts from the safe command
        self.intent.reset();
        self.send(LinkMessage::Connect(address.to_string()));
    }

    /// Close the session. No heartbeat write is issued after this returns.
    pub fn disconnect(&self) {
        self.writer.revoke();
        self.send(LinkMessage::Disconnect);
    }

    /// Assert `command` on the next heartbeat. Never blocks.
    pub fn press(&self, command: DispenserCommand) {
        self.intent.set(command);
    }

    /// Assert the safe command on the next heartbeat. Never blocks.
    pub fn release(&self) {
        self.intent.reset();
    }

    /// True when the active command is `Release`
    pub fn is_safe(&self) -> bool {
        self.intent.is_safe()
    }

    pub fn active_command(&self) -> DispenserCommand {
        self.intent.get()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// State stream. The current value is reported by the first
    /// `changed()`, then every change after it.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        let mut rx = self.state.clone();
        rx.mark_changed();
        rx
    }

    /// Wait until the state satisfies `accept`
    pub async fn wait_for(&self, accept: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.state.clone();
        let result = rx.wait_for(|state| accept(*state)).await.map(|state| *state);
        result.unwrap_or(ConnectionState::Disconnected)
    }

    /// Detail of the failure behind the current `Error` state
    pub fn last_error(&self) -> Option<LinkError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Address of the last successful session, for pre-filling
    pub fn stored_address(&self) -> Option<DeviceAddress> {
        match self.store.load() {
            Ok(address) => address,
            Err(e) => {
                warn!("Could not read stored address: {:#}", e);
                None
            }
        }
    }

    /// Stop the link task, tearing down any live session
    pub async fn shutdown(mut self) {
        info!("Shutting down dispenser service");
        self.writer.revoke();
        self.send(LinkMessage::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, message: LinkMessage) {
        if self.inbox.send(message).is_err() {
            warn!("Link task is gone; request dropped");
        }
    }
}

impl Drop for DispenserService {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.writer.revoke();
            let _ = self.inbox.send(LinkMessage::Shutdown);
        }
    }
}
