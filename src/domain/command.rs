//! Dispenser command model
//!
//! The dispenser understands exactly four two-byte ASCII tokens on its
//! command characteristic. `Release` is the safe/idle command.

use std::fmt;
use std::str::FromStr;

/// Commands accepted by the dispenser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DispenserCommand {
    /// Dispense hot water
    Hot = 0,
    /// Dispense cold water
    Cold = 1,
    /// Dispense ambient temperature water
    Ambient = 2,
    /// Stop all actuation
    #[default]
    Release = 3,
}

impl DispenserCommand {
    pub const ALL: [DispenserCommand; 4] = [Self::Hot, Self::Cold, Self::Ambient, Self::Release];

    /// Wire token written to the command characteristic
    pub fn token(self) -> &'static [u8; 2] {
        match self {
            Self::Hot => b"$H",
            Self::Cold => b"$C",
            Self::Ambient => b"$A",
            Self::Release => b"$R",
        }
    }

    pub fn is_safe(self) -> bool {
        self == Self::Release
    }

    /// Inverse of `as u8`; out-of-range values fall back to `Release`.
    pub fn from_repr(value: u8) -> Self {
        match value {
            0 => Self::Hot,
            1 => Self::Cold,
            2 => Self::Ambient,
            _ => Self::Release,
        }
    }

    /// Decode a wire token, as the dispenser firmware does
    pub fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.token().as_slice() == token)
    }
}

impl fmt::Display for DispenserCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hot => "hot",
            Self::Cold => "cold",
            Self::Ambient => "ambient",
            Self::Release => "release",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dispenser command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for DispenserCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" | "h" => Ok(Self::Hot),
            "cold" | "c" => Ok(Self::Cold),
            "ambient" | "a" => Ok(Self::Ambient),
            "release" | "r" => Ok(Self::Release),
            _ => Err(UnknownCommand(s.to_string())),
        }
    }
}
