//! 48-bit Bluetooth device addresses

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ADDRESS_MASK: u64 = 0xFFFF_FFFF_FFFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid device address: {0}")]
    Malformed(String),
    #[error("Device address out of range: {0:#x}")]
    OutOfRange(u64),
}

/// A MAC address held in the low 48 bits of a `u64`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// Wrap a raw value. Zero and anything wider than 48 bits are rejected.
    pub fn new(raw: u64) -> Result<Self, AddressError> {
        if raw == 0 || raw > ADDRESS_MASK {
            return Err(AddressError::OutOfRange(raw));
        }
        Ok(Self(raw))
    }

    pub fn from_bytes(bytes: [u8; 6]) -> Result<Self, AddressError> {
        let raw = bytes
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        Self::new(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Most significant byte first, as printed
    pub fn to_bytes(&self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (self.0 >> (8 * (5 - i))) as u8;
        }
        bytes
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::Malformed(s.to_string()));
        }
        let raw =
            u64::from_str_radix(&digits, 16).map_err(|_| AddressError::Malformed(s.to_string()))?;
        Self::new(raw)
    }
}

impl TryFrom<u64> for DeviceAddress {
    type Error = AddressError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

impl From<DeviceAddress> for u64 {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}
