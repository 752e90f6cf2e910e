/// 48-bit node addresses and their on-air packing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of bytes an address occupies on every wire format
pub const ADDRESS_LEN: usize = 6;

const ADDRESS_MASK: u64 = 0xFFFF_FFFF_FFFF;
const CLEAR_BYTES_MASK: u64 = 0xFF_FFFF;

/// Errors produced when parsing an address from text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address must be 12 hex digits, got {0} digits")]
    WrongLength(usize),
    #[error("Address contains non-hex character")]
    InvalidHex,
}

/// A 48-bit node identifier.
///
/// Addresses are packed little-endian on every transport. Two values are
/// reserved: [`Address::BASE`] names the base station at the far end of the
/// serial link, [`Address::BROADCAST`] names every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(u64);

impl Address {
    /// Base station address
    pub const BASE: Address = Address(0);
    /// Broadcast address
    pub const BROADCAST: Address = Address(ADDRESS_MASK);

    /// Build an address from the low 48 bits of `value`
    pub const fn new(value: u64) -> Self {
        Address(value & ADDRESS_MASK)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_base(&self) -> bool {
        *self == Self::BASE
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Pack into the 6-byte little-endian wire form
    pub fn pack(&self) -> [u8; ADDRESS_LEN] {
        let bytes = self.0.to_le_bytes();
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&bytes[..ADDRESS_LEN]);
        out
    }

    /// Unpack from the 6-byte little-endian wire form
    pub fn unpack(bytes: &[u8; ADDRESS_LEN]) -> Self {
        let mut wide = [0u8; 8];
        wide[..ADDRESS_LEN].copy_from_slice(bytes);
        Address(u64::from_le_bytes(wide))
    }

    /// Unpack from the front of a slice, if it is long enough
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let head: &[u8; ADDRESS_LEN] = bytes.get(..ADDRESS_LEN)?.try_into().ok()?;
        Some(Self::unpack(head))
    }

    /// Compare only the three bytes that BLE encryption never overwrites.
    ///
    /// On an encrypted advertisement the upper three address bytes are
    /// ciphertext, so multi-packet continuity can only rely on the rest.
    pub fn matches_clear_bytes(&self, other: &Address) -> bool {
        (self.0 & CLEAR_BYTES_MASK) == (other.0 & CLEAR_BYTES_MASK)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address::new(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Accepts `0123456789AB`, `01:23:45:67:89:AB` and an optional `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let digits: String = trimmed.chars().filter(|c| *c != ':' && *c != '-').collect();
        if digits.len() != 12 {
            return Err(AddressError::WrongLength(digits.len()));
        }
        u64::from_str_radix(&digits, 16)
            .map(Address)
            .map_err(|_| AddressError::InvalidHex)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}
