//! Platform GATT seam
//!
//! A platform only *issues* operations. Every outcome (link up, link down,
//! discovery result, write completion) is reported later as a
//! [`PlatformEvent`] tagged with the [`SessionId`] the operation belonged to,
//! so late events from a superseded session can be told apart from current
//! ones.

use crate::domain::DeviceAddress;
use crate::infrastructure::bluetooth::error::{GattStatus, LinkError};
use crate::infrastructure::bluetooth::protocol::{format_uuid, SessionConfig};
use std::fmt;
use tokio::sync::mpsc;

/// Identity of one connection attempt. Strictly increasing per state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub write: bool,
    pub write_without_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: u128,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: u128,
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Peer acknowledges; completion arrives as a platform event
    WithResponse,
    /// No acknowledgement; completion is synthesized locally
    WithoutResponse,
}

/// The negotiated command characteristic of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCharacteristic {
    pub service_uuid: u128,
    pub uuid: u128,
    pub write_type: WriteType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEventKind {
    Connected,
    ConnectFailed(String),
    Disconnected,
    ServicesDiscovered(Result<Vec<DiscoveredService>, GattStatus>),
    CharacteristicWritten(GattStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEvent {
    pub session: SessionId,
    pub kind: PlatformEventKind,
}

impl PlatformEvent {
    pub fn new(session: SessionId, kind: PlatformEventKind) -> Self {
        Self { session, kind }
    }
}

pub type PlatformEventSender = mpsc::UnboundedSender<PlatformEvent>;

/// Platform GATT stack
pub trait GattPlatform: Send + Sync + 'static {
    /// Register the channel all platform events are delivered to
    fn attach(&self, events: PlatformEventSender);

    /// Open a link. Reports `Connected` or `ConnectFailed`.
    fn connect(&self, session: SessionId, address: DeviceAddress) -> Result<(), LinkError>;

    /// Enumerate services. Reports `ServicesDiscovered`.
    fn discover_services(&self, session: SessionId) -> Result<(), LinkError>;

    /// Queue one write. Acknowledged writes report `CharacteristicWritten`.
    fn write(
        &self,
        session: SessionId,
        characteristic: &CommandCharacteristic,
        payload: &[u8],
    ) -> Result<(), LinkError>;

    /// Tear the link down. Reports `Disconnected`.
    fn disconnect(&self, session: SessionId);
}

/// Locate the command characteristic in a discovery result.
///
/// The acknowledged write type is used whenever the characteristic
/// advertises it; a characteristic advertising neither write property
/// still gets acknowledged writes and fails at write time.
pub fn select_command_characteristic(
    services: &[DiscoveredService],
    config: &SessionConfig,
) -> Result<CommandCharacteristic, LinkError> {
    let service = services
        .iter()
        .find(|s| s.uuid == config.service_uuid)
        .ok_or(LinkError::ServiceNotFound)?;

    let characteristic = service
        .characteristics
        .iter()
        .find(|c| c.uuid == config.command_char_uuid)
        .ok_or(LinkError::CharacteristicNotFound)?;

    let props = characteristic.properties;
    let write_type = if !props.write && props.write_without_response {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    };

    tracing::debug!(
        "Command characteristic {} selected ({:?})",
        format_uuid(characteristic.uuid),
        write_type
    );

    Ok(CommandCharacteristic {
        service_uuid: service.uuid,
        uuid: characteristic.uuid,
        write_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nus(props: CharacteristicProperties) -> Vec<DiscoveredService> {
        let config = SessionConfig::default();
        vec![
            DiscoveredService {
                uuid: 0x1800,
                characteristics: vec![],
            },
            DiscoveredService {
                uuid: config.service_uuid,
                characteristics: vec![DiscoveredCharacteristic {
                    uuid: config.command_char_uuid,
                    properties: props,
                }],
            },
        ]
    }

    #[test]
    fn test_prefers_acknowledged_writes() {
        let services = nus(CharacteristicProperties {
            write: true,
            write_without_response: true,
        });
        let ch = select_command_characteristic(&services, &SessionConfig::default()).unwrap();
        assert_eq!(ch.write_type, WriteType::WithResponse);
    }

    #[test]
    fn test_falls_back_to_unacknowledged_writes() {
        let services = nus(CharacteristicProperties {
            write: false,
            write_without_response: true,
        });
        let ch = select_command_characteristic(&services, &SessionConfig::default()).unwrap();
        assert_eq!(ch.write_type, WriteType::WithoutResponse);
    }

    #[test]
    fn test_missing_service_and_characteristic() {
        let config = SessionConfig::default();
        assert_eq!(
            select_command_characteristic(&[], &config),
            Err(LinkError::ServiceNotFound)
        );

        let services = vec![DiscoveredService {
            uuid: config.service_uuid,
            characteristics: vec![DiscoveredCharacteristic {
                uuid: 0x6e400003_b5a3_f393_e0a9_e50e24dcca9e,
                properties: CharacteristicProperties::default(),
            }],
        }];
        assert_eq!(
            select_command_characteristic(&services, &config),
            Err(LinkError::CharacteristicNotFound)
        );
    }
}
