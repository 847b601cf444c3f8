use crate::domain::InvalidAddress;
use std::fmt;

/// GATT status code as reported by the platform stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Every way the link can fail. All of them end in `ConnectionState::Error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("invalid Bluetooth address: {0:?}")]
    InvalidAddress(String),
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("service discovery failed with status {0}")]
    DiscoveryFailed(GattStatus),
    #[error("service discovery timed out")]
    DiscoveryTimeout,
    #[error("command service not found")]
    ServiceNotFound,
    #[error("command characteristic not found")]
    CharacteristicNotFound,
    #[error("write could not be issued: {0}")]
    WriteNotIssued(String),
    #[error("write failed with status {0}")]
    WriteFailed(GattStatus),
}

impl From<InvalidAddress> for LinkError {
    fn from(e: InvalidAddress) -> Self {
        LinkError::InvalidAddress(e.0)
    }
}
