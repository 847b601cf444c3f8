//! Dispenser Protocol
//!
//! GATT identity of the command channel and link timing. The dispenser
//! exposes a Nordic UART Service; commands go to its RX characteristic.

use crate::domain::settings::BleSettings;
use anyhow::Result;
use std::time::Duration;

/// Nordic UART Service UUID
pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// NUS RX Characteristic UUID - where commands are sent
pub const COMMAND_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Delay between a confirmed write and the next heartbeat write
pub const HEARTBEAT_INTERVAL_MS: u64 = 400;

/// Upper bound on connect + discovery before the attempt is abandoned
pub const DISCOVERY_TIMEOUT_MS: u64 = 10_000;

/// Runtime configuration of a dispenser session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub service_uuid: u128,
    pub command_char_uuid: u128,
    pub heartbeat_interval: Duration,
    pub discovery_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: 0x6e400001_b5a3_f393_e0a9_e50e24dcca9e,
            command_char_uuid: 0x6e400002_b5a3_f393_e0a9_e50e24dcca9e,
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            discovery_timeout: Duration::from_millis(DISCOVERY_TIMEOUT_MS),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &BleSettings) -> Result<Self> {
        Ok(Self {
            service_uuid: parse_uuid(&settings.service_uuid)?,
            command_char_uuid: parse_uuid(&settings.command_char_uuid)?,
            heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
            discovery_timeout: Duration::from_millis(settings.discovery_timeout_ms),
        })
    }
}

/// Parse a hyphenated 128-bit UUID string
pub fn parse_uuid(uuid_str: &str) -> Result<u128> {
    let hex = uuid_str.replace('-', "");

    if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(anyhow::anyhow!("Invalid UUID format: {}", uuid_str));
    }

    Ok(u128::from_str_radix(&hex, 16)?)
}

/// Render a 128-bit UUID in the usual 8-4-4-4-12 form
pub fn format_uuid(uuid: u128) -> String {
    let hex = format!("{:032x}", uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
