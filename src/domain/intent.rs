use crate::domain::command::DispenserCommand;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// The command the user currently wants asserted.
///
/// Written by input handling, read by the heartbeat on every cycle. Never
/// blocks either side.
#[derive(Debug, Clone)]
pub struct ActiveCommand(Arc<AtomicU8>);

impl ActiveCommand {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(DispenserCommand::Release as u8)))
    }

    pub fn get(&self) -> DispenserCommand {
        DispenserCommand::from_repr(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, command: DispenserCommand) {
        self.0.store(command as u8, Ordering::Release);
    }

    pub fn reset(&self) {
        self.set(DispenserCommand::Release);
    }

    pub fn is_safe(&self) -> bool {
        self.get().is_safe()
    }
}

impl Default for ActiveCommand {
    fn default() -> Self {
        Self::new()
    }
}
