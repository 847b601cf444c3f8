//! Bluetooth Module
//!
//! Session core for the water dispenser's BLE command channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     DispenserService                     │
//! │ (connect / disconnect / press / release / state stream)  │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ LinkMessage
//!                              ▼
//!                    ┌──────────────────┐  PlatformEvent  ┌──────────────┐
//!                    │ LinkStateMachine │◀────────────────│ GattPlatform │
//!                    └────────┬─────────┘                 │ (WinRT/sim)  │
//!                             │ spawns                    └──────▲───────┘
//!                             ▼                                  │
//!                    ┌──────────────────┐   write()   ┌──────────┴──────┐
//!                    │    Heartbeat     │────────────▶│ WriteSerializer │
//!                    └──────────────────┘             └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service/characteristic identity and link timing
//! - [`platform`] - The platform seam and discovery types
//! - [`writer`] - Serialized writes and the completion slot
//! - [`heartbeat`] - Completion-paced re-assertion of the active command
//! - [`link`] - Connection lifecycle state machine
//! - [`service`] - Public façade
//! - [`simulator`] - In-process dispenser
//! - `winrt` - Windows GATT stack (Windows only)

pub mod error;
pub mod heartbeat;
pub mod link;
pub mod platform;
pub mod protocol;
pub mod service;
pub mod simulator;
#[cfg(windows)]
pub mod winrt;
pub mod writer;

// Re-export main service for convenience
pub use error::{GattStatus, LinkError};
pub use service::DispenserService;
