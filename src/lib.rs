//! Session core for a BLE water dispenser
//!
//! The dispenser is driven by re-asserting the currently active command over
//! a Nordic UART Service characteristic. [`DispenserService`] owns the link
//! lifecycle; `press`/`release` only change what the next heartbeat sends.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::{ConnectionState, DeviceAddress, DispenserCommand};
pub use infrastructure::bluetooth::{DispenserService, GattStatus, LinkError};
