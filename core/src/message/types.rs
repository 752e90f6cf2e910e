// Message types shared by every interface

use super::address::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic kind carried in the low three bits of a payload type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadKind {
    /// Typed telemetry records
    Tdf3 = 0,
    Oti = 1,
    Vti = 2,
    /// Remote procedure call request
    Rpc = 3,
    /// Remote procedure call response
    RpcResponse = 4,
    /// Telemetry relayed towards the base station, prefixed by a route stack
    Incoming = 5,
    /// Forwarding instruction from the base station, prefixed by a route stack
    Outgoing = 6,
    Reserved = 7,
}

impl PayloadKind {
    pub fn from_bits(bits: u8) -> Self {
        match bits & PayloadType::KIND_MASK {
            0 => PayloadKind::Tdf3,
            1 => PayloadKind::Oti,
            2 => PayloadKind::Vti,
            3 => PayloadKind::Rpc,
            4 => PayloadKind::RpcResponse,
            5 => PayloadKind::Incoming,
            6 => PayloadKind::Outgoing,
            _ => PayloadKind::Reserved,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Payload descriptor byte: `[0 0 ENCRYPTED BROADCAST RESERVED KIND:3]`.
///
/// The two high bits are never set; the BLE transport packs the descriptor
/// behind an ASCII offset and relies on them being clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const KIND_MASK: u8 = 0b0000_0111;
    pub const BROADCAST: u8 = 0b0001_0000;
    pub const ENCRYPTED: u8 = 0b0010_0000;
    /// Bits that no transport may carry
    pub const RESERVED_HIGH_MASK: u8 = 0b1100_0000;

    pub const TDF3: PayloadType = PayloadType(0);
    pub const INCOMING: PayloadType = PayloadType(5);
    pub const OUTGOING: PayloadType = PayloadType(6);

    /// Wrap a raw descriptor byte, clearing the two reserved high bits
    pub const fn from_u8(raw: u8) -> Self {
        PayloadType(raw & !Self::RESERVED_HIGH_MASK)
    }

    pub fn from_kind(kind: PayloadKind) -> Self {
        PayloadType(kind.as_u8())
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn kind(&self) -> PayloadKind {
        PayloadKind::from_bits(self.0)
    }

    pub fn is_encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 & Self::BROADCAST != 0
    }

    pub fn with_encrypted(self, encrypted: bool) -> Self {
        self.with_flag(Self::ENCRYPTED, encrypted)
    }

    pub fn with_broadcast(self, broadcast: bool) -> Self {
        self.with_flag(Self::BROADCAST, broadcast)
    }

    /// Kind bits only, all flags cleared
    pub fn without_flags(self) -> Self {
        PayloadType(self.0 & Self::KIND_MASK)
    }

    fn with_flag(self, flag: u8, set: bool) -> Self {
        if set {
            PayloadType(self.0 | flag)
        } else {
            PayloadType(self.0 & !flag)
        }
    }
}

impl From<PayloadKind> for PayloadType {
    fn from(kind: PayloadKind) -> Self {
        PayloadType::from_kind(kind)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind())?;
        if self.is_broadcast() {
            write!(f, "|BROADCAST")?;
        }
        if self.is_encrypted() {
            write!(f, "|ENCRYPTED")?;
        }
        Ok(())
    }
}

/// A message as seen by application code, independent of transport.
///
/// Created per send or receive call and owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub source: Address,
    pub destination: Address,
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        source: Address,
        destination: Address,
        payload_type: impl Into<PayloadType>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            source,
            destination,
            payload_type: payload_type.into(),
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload_type.kind()
    }
}
