/// Routable header stacks carried by OUTGOING and INCOMING payloads
///
/// ```text
/// OUTGOING = [num_hops][RouteRecord x (num_hops-1)][total_len][type][RouteRecord][payload]
/// INCOMING = [num_hops][IncomingRoute x (num_hops-1)][total_len][type][IncomingRoute][payload]
/// ```
///
/// `total_len` counts the terminal hop struct plus its payload. Anything
/// after that (BLE delivers whole packets, zero padded) is ignored.

use super::record::{IncomingRoute, RouteRecord, INCOMING_ROUTE_LEN, ROUTE_RECORD_LEN};
use super::RouteError;
use crate::message::{Message, PayloadKind, PayloadType};
use serde::{Deserialize, Serialize};

/// Largest routing packet a node will build
pub const MAX_ROUTING_PACKET_SIZE: usize = 256;

const HOP_COUNT_LEN: usize = 1;
/// `[total_len][type][RouteRecord]`
const OUTGOING_LAST_HOP_LEN: usize = 2 + ROUTE_RECORD_LEN;
/// `[total_len][type][IncomingRoute]`
const INCOMING_FIRST_HOP_LEN: usize = 2 + INCOMING_ROUTE_LEN;

/// What a node does with an OUTGOING payload addressed to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingStep<'a> {
    /// More hops remain: send `stack` (still OUTGOING) to `next`
    Forward { next: RouteRecord, stack: Vec<u8> },
    /// Terminal hop: send the final payload to `record`
    LastHop {
        record: RouteRecord,
        payload_type: PayloadType,
        payload: &'a [u8],
    },
}

impl<'a> OutgoingStep<'a> {
    /// Peel the next record from an OUTGOING payload
    pub fn peel(payload: &'a [u8]) -> Result<Self, RouteError> {
        let num_hops = *payload.first().ok_or(RouteError::Truncated {
            need: HOP_COUNT_LEN,
            got: 0,
        })?;
        match num_hops {
            0 => Err(RouteError::ZeroHops),
            1 => {
                let (record, payload_type, payload) = parse_outgoing_last_hop(&payload[HOP_COUNT_LEN..])?;
                Ok(OutgoingStep::LastHop {
                    record,
                    payload_type,
                    payload,
                })
            }
            _ => {
                let rest = &payload[HOP_COUNT_LEN..];
                let next = RouteRecord::from_bytes(rest)?;
                let mut stack = Vec::with_capacity(payload.len() - ROUTE_RECORD_LEN);
                stack.push(num_hops - 1);
                stack.extend_from_slice(&rest[ROUTE_RECORD_LEN..]);
                Ok(OutgoingStep::Forward { next, stack })
            }
        }
    }
}

fn parse_outgoing_last_hop(data: &[u8]) -> Result<(RouteRecord, PayloadType, &[u8]), RouteError> {
    if data.len() < OUTGOING_LAST_HOP_LEN {
        return Err(RouteError::Truncated {
            need: OUTGOING_LAST_HOP_LEN,
            got: data.len(),
        });
    }
    let total_len = data[0] as usize;
    if total_len < OUTGOING_LAST_HOP_LEN || total_len > data.len() {
        return Err(RouteError::LengthMismatch {
            declared: total_len,
            available: data.len(),
        });
    }
    let payload_type = PayloadType::from_u8(data[1]);
    let record = RouteRecord::from_bytes(&data[2..OUTGOING_LAST_HOP_LEN])?;
    Ok((record, payload_type, &data[OUTGOING_LAST_HOP_LEN..total_len]))
}

/// A complete forwarding instruction, as built by a base station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRoute {
    /// Hops in forwarding order; the last one delivers the payload
    pub hops: Vec<RouteRecord>,
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
}

impl OutgoingRoute {
    pub fn new(payload_type: impl Into<PayloadType>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            hops: Vec::new(),
            payload_type: payload_type.into(),
            payload: payload.into(),
        }
    }

    /// Append a hop to the path
    pub fn via(mut self, record: RouteRecord) -> Self {
        self.hops.push(record);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RouteError> {
        let (last, intermediate) = self.hops.split_last().ok_or(RouteError::ZeroHops)?;
        let num_hops = u8::try_from(self.hops.len()).map_err(|_| RouteError::TooManyHops(self.hops.len()))?;
        let total_len = OUTGOING_LAST_HOP_LEN + self.payload.len();
        let total_len_byte = u8::try_from(total_len).map_err(|_| RouteError::TooLarge(total_len))?;

        let packet_len = HOP_COUNT_LEN + intermediate.len() * ROUTE_RECORD_LEN + total_len;
        if packet_len > MAX_ROUTING_PACKET_SIZE {
            return Err(RouteError::TooLarge(packet_len));
        }

        let mut out = Vec::with_capacity(packet_len);
        out.push(num_hops);
        for hop in intermediate {
            out.extend_from_slice(&hop.to_bytes());
        }
        out.push(total_len_byte);
        out.push(self.payload_type.as_u8());
        out.extend_from_slice(&last.to_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RouteError> {
        let num_hops = *data.first().ok_or(RouteError::Truncated { need: 1, got: 0 })? as usize;
        if num_hops == 0 {
            return Err(RouteError::ZeroHops);
        }
        let mut hops = Vec::with_capacity(num_hops);
        let mut offset = HOP_COUNT_LEN;
        for _ in 1..num_hops {
            let end = offset + ROUTE_RECORD_LEN;
            let chunk = data.get(offset..end).ok_or(RouteError::Truncated {
                need: end,
                got: data.len(),
            })?;
            hops.push(RouteRecord::from_bytes(chunk)?);
            offset = end;
        }
        let (last, payload_type, payload) = parse_outgoing_last_hop(&data[offset..])?;
        hops.push(last);
        Ok(Self {
            hops,
            payload_type,
            payload: payload.to_vec(),
        })
    }
}

/// The path a relayed message took, as seen by the base station
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingPath {
    /// Relay hops, most recent (closest to the base) first
    pub relays: Vec<IncomingRoute>,
    /// The hop on which the original message was first heard
    pub first_hop: IncomingRoute,
    /// Original payload type, flags included
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
}

impl IncomingPath {
    pub fn num_hops(&self) -> usize {
        self.relays.len() + 1
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RouteError> {
        let num_hops = *data.first().ok_or(RouteError::Truncated { need: 1, got: 0 })? as usize;
        if num_hops == 0 {
            return Err(RouteError::ZeroHops);
        }
        let mut relays = Vec::with_capacity(num_hops - 1);
        let mut offset = HOP_COUNT_LEN;
        for _ in 1..num_hops {
            let end = offset + INCOMING_ROUTE_LEN;
            let chunk = data.get(offset..end).ok_or(RouteError::Truncated {
                need: end,
                got: data.len(),
            })?;
            relays.push(IncomingRoute::from_bytes(chunk)?);
            offset = end;
        }

        let first = &data[offset..];
        if first.len() < INCOMING_FIRST_HOP_LEN {
            return Err(RouteError::Truncated {
                need: offset + INCOMING_FIRST_HOP_LEN,
                got: data.len(),
            });
        }
        let total_len = first[0] as usize;
        if total_len < INCOMING_FIRST_HOP_LEN || total_len > first.len() {
            return Err(RouteError::LengthMismatch {
                declared: total_len,
                available: first.len(),
            });
        }
        Ok(Self {
            relays,
            first_hop: IncomingRoute::from_bytes(&first[2..INCOMING_FIRST_HOP_LEN])?,
            payload_type: PayloadType::from_u8(first[1]),
            payload: first[INCOMING_FIRST_HOP_LEN..total_len].to_vec(),
        })
    }
}

/// Wrap a received message for the trip up the serial link.
///
/// An INCOMING message gains one more relay record; anything else becomes a
/// fresh one-hop INCOMING stack whose first hop records `route`.
pub fn push_incoming_hop(route: &IncomingRoute, message: &Message) -> Result<Vec<u8>, RouteError> {
    let out = if message.kind() == PayloadKind::Incoming {
        let num_hops = *message.payload.first().ok_or(RouteError::Truncated { need: 1, got: 0 })?;
        if num_hops == 0 {
            return Err(RouteError::ZeroHops);
        }
        let num_hops = num_hops
            .checked_add(1)
            .ok_or(RouteError::TooManyHops(num_hops as usize + 1))?;
        let mut out = Vec::with_capacity(message.payload.len() + INCOMING_ROUTE_LEN);
        out.push(num_hops);
        out.extend_from_slice(&route.to_bytes());
        out.extend_from_slice(&message.payload[HOP_COUNT_LEN..]);
        out
    } else {
        let total_len = INCOMING_FIRST_HOP_LEN + message.payload.len();
        let total_len_byte = u8::try_from(total_len).map_err(|_| RouteError::TooLarge(total_len))?;
        let mut out = Vec::with_capacity(HOP_COUNT_LEN + total_len);
        out.push(1);
        out.push(total_len_byte);
        out.push(message.payload_type.as_u8());
        out.extend_from_slice(&route.to_bytes());
        out.extend_from_slice(&message.payload);
        out
    };
    if out.len() > MAX_ROUTING_PACKET_SIZE {
        return Err(RouteError::TooLarge(out.len()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Address;
    use crate::routing::RouteMetadata;
    use crate::transport::{Channel, InterfaceKind};

    fn ble_hop(address: u64) -> RouteRecord {
        RouteRecord::new(Address::new(address), InterfaceKind::Bluetooth, Channel::DEFAULT)
    }

    #[test]
    fn test_outgoing_single_hop_layout() {
        let route = OutgoingRoute::new(PayloadKind::Rpc, vec![0xAA, 0xBB]).via(ble_hop(0x0A));
        let bytes = route.to_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![1, 11, 3, 0x0A, 0, 0, 0, 0, 0, 0x10, 0xAA, 0xBB]
        );
        assert_eq!(OutgoingRoute::from_bytes(&bytes).unwrap(), route);
    }

    #[test]
    fn test_peel_forward_then_last_hop() {
        let route = OutgoingRoute::new(PayloadKind::Tdf3, vec![1, 2, 3])
            .via(ble_hop(0x0A))
            .via(ble_hop(0x0B));
        let bytes = route.to_bytes().unwrap();

        let stack = match OutgoingStep::peel(&bytes).unwrap() {
            OutgoingStep::Forward { next, stack } => {
                assert_eq!(next.hop, Address::new(0x0A));
                assert_eq!(stack[0], 1);
                assert_eq!(stack.len(), bytes.len() - ROUTE_RECORD_LEN);
                stack
            }
            other => panic!("expected forward, got {:?}", other),
        };

        match OutgoingStep::peel(&stack).unwrap() {
            OutgoingStep::LastHop {
                record,
                payload_type,
                payload,
            } => {
                assert_eq!(record.hop, Address::new(0x0B));
                assert_eq!(payload_type.kind(), PayloadKind::Tdf3);
                assert_eq!(payload, &[1, 2, 3]);
            }
            other => panic!("expected last hop, got {:?}", other),
        }
    }

    #[test]
    fn test_last_hop_ignores_padding() {
        let route = OutgoingRoute::new(PayloadKind::Tdf3, vec![7]).via(ble_hop(1));
        let mut bytes = route.to_bytes().unwrap();
        bytes.extend_from_slice(&[0u8; 6]);
        assert_eq!(OutgoingRoute::from_bytes(&bytes).unwrap().payload, vec![7]);
    }

    #[test]
    fn test_peel_rejects_malformed() {
        assert_eq!(OutgoingStep::peel(&[]), Err(RouteError::Truncated { need: 1, got: 0 }));
        assert_eq!(OutgoingStep::peel(&[0, 1, 2]), Err(RouteError::ZeroHops));
        assert!(matches!(
            OutgoingStep::peel(&[2, 1, 2, 3]),
            Err(RouteError::Truncated { .. })
        ));
        // declared length runs past the buffer
        assert!(matches!(
            OutgoingStep::peel(&[1, 40, 0, 1, 0, 0, 0, 0, 0, 0x10]),
            Err(RouteError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_outgoing_too_large() {
        let route = OutgoingRoute::new(PayloadKind::Tdf3, vec![0u8; 247]).via(ble_hop(1));
        assert_eq!(route.to_bytes(), Err(RouteError::TooLarge(256)));
        assert_eq!(
            OutgoingRoute::new(PayloadKind::Tdf3, vec![]).to_bytes(),
            Err(RouteError::ZeroHops)
        );
    }

    #[test]
    fn test_push_incoming_hops() {
        let first = IncomingRoute::new(
            ble_hop(0x0C),
            RouteMetadata {
                age_ms: 0,
                sequence: 4,
                rssi: 90,
            },
        );
        let relay = IncomingRoute::new(
            RouteRecord::new(Address::new(0x0D), InterfaceKind::Gatt, Channel::GATT_NACKED),
            RouteMetadata {
                age_ms: 0,
                sequence: 0,
                rssi: 30,
            },
        );
        let original = Message::new(
            Address::new(0x0C),
            Address::BROADCAST,
            PayloadType::TDF3.with_encrypted(true),
            vec![9, 8, 7],
        );

        let once = push_incoming_hop(&first, &original).unwrap();
        assert_eq!(once[0], 1);
        assert_eq!(once[1] as usize, INCOMING_FIRST_HOP_LEN + 3);
        assert_eq!(once.len(), 1 + INCOMING_FIRST_HOP_LEN + 3);

        let relayed = Message::new(Address::new(0x0D), Address::BROADCAST, PayloadType::INCOMING, once);
        let twice = push_incoming_hop(&relay, &relayed).unwrap();
        assert_eq!(twice[0], 2);

        let path = IncomingPath::from_bytes(&twice).unwrap();
        assert_eq!(path.num_hops(), 2);
        assert_eq!(path.relays, vec![relay]);
        assert_eq!(path.first_hop, first);
        assert!(path.payload_type.is_encrypted());
        assert_eq!(path.payload, vec![9, 8, 7]);
    }

    #[test]
    fn test_push_incoming_rejects_empty_stack() {
        let route = IncomingRoute::new(ble_hop(1), RouteMetadata::default());
        let message = Message::new(Address::new(1), Address::BROADCAST, PayloadType::INCOMING, vec![]);
        assert!(matches!(
            push_incoming_hop(&route, &message),
            Err(RouteError::Truncated { .. })
        ));
    }
}
