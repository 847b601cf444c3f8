//! Bluetooth device address
//!
//! Accepts the colon-separated six-octet form (`AA:BB:CC:DD:EE:FF`),
//! case-insensitive, and normalises to upper case.

use std::fmt;
use std::str::FromStr;

/// Text that is not a six-octet colon-separated address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: {0:?}")]
pub struct InvalidAddress(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub fn parse(text: &str) -> Result<Self, InvalidAddress> {
        let invalid = || InvalidAddress(text.to_string());

        let mut octets = [0u8; 6];
        let mut parts = text.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// 48-bit integer form, most significant octet first
    pub fn as_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[2..8]);
        Self(octets)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for DeviceAddress {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_address() {
        let addr = DeviceAddress::parse("aa:BB:cc:01:23:ef").unwrap();
        assert_eq!(addr.octets(), [0xAA, 0xBB, 0xCC, 0x01, 0x23, 0xEF]);
        assert_eq!(addr.to_string(), "AA:BB:CC:01:23:EF");
    }

    #[test]
    fn test_reject_malformed_addresses() {
        for bad in [
            "",
            "not-a-mac",
            "AA:BB:CC:DD:EE",
            "AA:BB:CC:DD:EE:FF:00",
            "AA-BB-CC-DD-EE-FF",
            "AAB:BC:CD:DE:EF:F0",
            "A:BB:CC:DD:EE:FF",
            "GG:BB:CC:DD:EE:FF",
            "+A:BB:CC:DD:EE:FF",
            " AA:BB:CC:DD:EE:FF",
            "AA:BB:CC:DD:EE:FF:",
        ] {
            assert!(
                DeviceAddress::parse(bad) == Err(InvalidAddress(bad.to_string())),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_u64_form() {
        let addr = DeviceAddress::parse("00:11:22:33:44:55").unwrap();
        assert_eq!(addr.as_u64(), 0x0011_2233_4455);
        assert_eq!(DeviceAddress::from_u64(0x0011_2233_4455), addr);
    }
}
