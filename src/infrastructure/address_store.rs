//! Persisted device address
//!
//! The last address that produced a working session, read once to pre-fill
//! the next one. Writes are best effort.

use crate::domain::settings::SettingsService;
use crate::domain::DeviceAddress;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::warn;

pub trait AddressStore: Send + Sync {
    fn load(&self) -> Result<Option<DeviceAddress>>;
    fn save(&self, address: &DeviceAddress) -> Result<()>;
}

/// Stores the address in the application settings file
pub struct SettingsAddressStore {
    settings: Arc<Mutex<SettingsService>>,
}

impl SettingsAddressStore {
    pub fn new(settings: Arc<Mutex<SettingsService>>) -> Self {
        Self { settings }
    }
}

impl AddressStore for SettingsAddressStore {
    fn load(&self) -> Result<Option<DeviceAddress>> {
        let settings = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        let Some(stored) = settings.get().last_connected_address.as_deref() else {
            return Ok(None);
        };
        match DeviceAddress::parse(stored) {
            Ok(address) => Ok(Some(address)),
            Err(e) => {
                warn!("Ignoring stored address: {}", e);
                Ok(None)
            }
        }
    }

    fn save(&self, address: &DeviceAddress) -> Result<()> {
        let mut settings = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("Lock error"))?;
        settings.update_last_address(address.to_string())
    }
}

/// Keeps the address in memory; observable so callers can wait for a save
pub struct MemoryAddressStore {
    value: watch::Sender<Option<DeviceAddress>>,
    fail_saves: bool,
}

impl MemoryAddressStore {
    pub fn new(initial: Option<DeviceAddress>) -> Self {
        let (value, _) = watch::channel(initial);
        Self {
            value,
            fail_saves: false,
        }
    }

    /// A store whose writes always fail
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::new(None)
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DeviceAddress>> {
        self.value.subscribe()
    }
}

impl AddressStore for MemoryAddressStore {
    fn load(&self) -> Result<Option<DeviceAddress>> {
        Ok(*self.value.borrow())
    }

    fn save(&self, address: &DeviceAddress) -> Result<()> {
        if self.fail_saves {
            anyhow::bail!("address store is read-only");
        }
        self.value.send_replace(Some(*address));
        Ok(())
    }
}
