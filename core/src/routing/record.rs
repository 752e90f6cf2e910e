/// Per-hop route records, packed exactly as deployed nodes expect

use super::RouteError;
use crate::message::{Address, ADDRESS_LEN};
use crate::transport::{Channel, InterfaceKind};
use serde::{Deserialize, Serialize};

/// `[hop address 6 LE][interface << 4 | channel]`
pub const ROUTE_RECORD_LEN: usize = 7;
/// `[age ms u16 LE][sequence][rssi]`
pub const ROUTE_METADATA_LEN: usize = 4;
pub const INCOMING_ROUTE_LEN: usize = ROUTE_RECORD_LEN + ROUTE_METADATA_LEN;

/// One hop: the neighbouring node and the interface/channel that reaches it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub hop: Address,
    pub interface: InterfaceKind,
    pub channel: Channel,
}

impl RouteRecord {
    pub fn new(hop: Address, interface: InterfaceKind, channel: Channel) -> Self {
        Self { hop, interface, channel }
    }

    pub fn interface_and_channel(&self) -> u8 {
        (self.interface.id() << 4) | self.channel.as_u8()
    }

    pub fn to_bytes(&self) -> [u8; ROUTE_RECORD_LEN] {
        let mut out = [0u8; ROUTE_RECORD_LEN];
        out[..ADDRESS_LEN].copy_from_slice(&self.hop.pack());
        out[ADDRESS_LEN] = self.interface_and_channel();
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RouteError> {
        if data.len() < ROUTE_RECORD_LEN {
            return Err(RouteError::Truncated {
                need: ROUTE_RECORD_LEN,
                got: data.len(),
            });
        }
        let hop = Address::from_slice(data).ok_or(RouteError::Truncated {
            need: ADDRESS_LEN,
            got: data.len(),
        })?;
        let packed = data[ADDRESS_LEN];
        Ok(Self {
            hop,
            interface: InterfaceKind::from_id(packed >> 4)?,
            channel: Channel::new(packed),
        })
    }
}

/// Receive-side details of a hop; travels one hop further at most
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteMetadata {
    /// Time between reception and forwarding
    pub age_ms: u16,
    /// Sequence number of the interface that received the packet
    pub sequence: u8,
    /// Encoded as `30 - rssi_dbm`
    pub rssi: u8,
}

impl RouteMetadata {
    pub fn to_bytes(&self) -> [u8; ROUTE_METADATA_LEN] {
        let age = self.age_ms.to_le_bytes();
        [age[0], age[1], self.sequence, self.rssi]
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RouteError> {
        if data.len() < ROUTE_METADATA_LEN {
            return Err(RouteError::Truncated {
                need: ROUTE_METADATA_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            age_ms: u16::from_le_bytes([data[0], data[1]]),
            sequence: data[2],
            rssi: data[3],
        })
    }

    /// Convert a measured RSSI in dBm to the on-wire byte
    pub fn encode_rssi(rssi_dbm: i8) -> u8 {
        (30i16 - rssi_dbm as i16) as u8
    }

    /// Recover dBm from the on-wire byte
    pub fn rssi_dbm(&self) -> i16 {
        30 - self.rssi as i16
    }
}

/// The route a message arrived on, handed to receive handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRoute {
    pub record: RouteRecord,
    pub metadata: RouteMetadata,
}

impl IncomingRoute {
    pub fn new(record: RouteRecord, metadata: RouteMetadata) -> Self {
        Self { record, metadata }
    }

    pub fn to_bytes(&self) -> [u8; INCOMING_ROUTE_LEN] {
        let mut out = [0u8; INCOMING_ROUTE_LEN];
        out[..ROUTE_RECORD_LEN].copy_from_slice(&self.record.to_bytes());
        out[ROUTE_RECORD_LEN..].copy_from_slice(&self.metadata.to_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RouteError> {
        if data.len() < INCOMING_ROUTE_LEN {
            return Err(RouteError::Truncated {
                need: INCOMING_ROUTE_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            record: RouteRecord::from_bytes(&data[..ROUTE_RECORD_LEN])?,
            metadata: RouteMetadata::from_bytes(&data[ROUTE_RECORD_LEN..INCOMING_ROUTE_LEN])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = RouteRecord::new(
            Address::new(0x0605_0403_0201),
            InterfaceKind::Gatt,
            Channel::GATT_NACKED,
        );
        assert_eq!(record.to_bytes(), [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x21]);
        assert_eq!(RouteRecord::from_bytes(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn test_record_rejects_unknown_interface() {
        let bytes = [0, 0, 0, 0, 0, 0, 0x70];
        assert_eq!(
            RouteRecord::from_bytes(&bytes),
            Err(RouteError::UnknownInterface(7))
        );
    }

    #[test]
    fn test_metadata_layout() {
        let metadata = RouteMetadata {
            age_ms: 0x0102,
            sequence: 9,
            rssi: RouteMetadata::encode_rssi(-70),
        };
        assert_eq!(metadata.to_bytes(), [0x02, 0x01, 9, 100]);
        assert_eq!(metadata.rssi_dbm(), -70);
    }

    #[test]
    fn test_incoming_route_truncated() {
        assert_eq!(
            IncomingRoute::from_bytes(&[0u8; 10]),
            Err(RouteError::Truncated { need: 11, got: 10 })
        );
    }
}
