/// Fragment bookkeeping for multi-packet advertisements
///
/// A message larger than one advertisement is split across up to four
/// packets. Each packet carries a sequence byte:
///
/// | bits 7..4        | bits 3..2         | bits 1..0    |
/// |------------------|-------------------|--------------|
/// | message sequence | packet count - 1  | packet index |

use super::advertising::DecodedPacket;
use crate::message::{Address, Message};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Most packets one message may span
pub const MAX_PACKETS: u8 = 4;
/// Fragments older than this no longer continue a message
pub const MULTI_PACKET_TIMEOUT: Duration = Duration::from_millis(300);

const SEQUENCE_MASK: u8 = 0b1111_0000;
const NUM_PACKETS_MASK: u8 = 0b0000_1100;
const INDEX_MASK: u8 = 0b0000_0011;

/// Decoded form of the sequence byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceByte {
    /// Free-running 4-bit message counter
    pub sequence: u8,
    /// Packets in this message, 1 to 4
    pub num_packets: u8,
    /// Position of this packet, 0 to `num_packets - 1`
    pub index: u8,
}

impl SequenceByte {
    pub fn new(sequence: u8, num_packets: u8, index: u8) -> Self {
        Self {
            sequence: sequence & 0x0F,
            num_packets,
            index,
        }
    }

    pub fn encode(&self) -> u8 {
        ((self.sequence << 4) & SEQUENCE_MASK)
            | ((self.num_packets.wrapping_sub(1) << 2) & NUM_PACKETS_MASK)
            | (self.index & INDEX_MASK)
    }

    pub fn decode(byte: u8) -> Self {
        Self {
            sequence: (byte & SEQUENCE_MASK) >> 4,
            num_packets: ((byte & NUM_PACKETS_MASK) >> 2) + 1,
            index: byte & INDEX_MASK,
        }
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.num_packets
    }
}

#[derive(Debug)]
struct InProgress {
    buffer: Vec<u8>,
    last_seen: Instant,
    source: Address,
    destination: Address,
    sequence: u8,
    num_packets: u8,
    next_index: u8,
}

impl InProgress {
    fn continues(&self, packet: &DecodedPacket, now: Instant, timeout: Duration) -> bool {
        let header = &packet.sequence;
        now.saturating_duration_since(self.last_seen) <= timeout
            && packet.source == self.source
            && header.sequence == self.sequence
            && header.num_packets == self.num_packets
            && header.index == self.next_index
            // The cipher block starts at the fourth on-air address byte, so the
            // upper 24 bits of an encrypted destination are ciphertext that
            // changes per packet. The lower 24 bits also seed the IV and are
            // always sent in the clear.
            && packet.destination.matches_clear_bytes(&self.destination)
            && (packet.destination == self.destination || packet.encrypted_on_air)
    }
}

/// Rebuilds messages from in-order advertisement fragments.
///
/// Only one message is assembled at a time. Any break in continuity drops
/// the partial message; a fragment that is not the first of its message is
/// ignored unless it continues the one in progress.
#[derive(Debug)]
pub struct Reassembler {
    timeout: Duration,
    state: Option<InProgress>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MULTI_PACKET_TIMEOUT)
    }
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.state.is_some()
    }

    pub fn reset(&mut self) {
        self.state = None;
    }

    /// Offer a decoded packet received at `now`; returns a message once complete
    pub fn accept(&mut self, packet: DecodedPacket, now: Instant) -> Option<Message> {
        let header = packet.sequence;
        if header.num_packets == 1 {
            return Some(packet.into_message());
        }

        if let Some(state) = &self.state {
            if !state.continues(&packet, now, self.timeout) {
                warn!(
                    "BLE multi-packet from {} broken at index {} (seq {}), discarding {} bytes",
                    packet.source,
                    header.index,
                    header.sequence,
                    state.buffer.len()
                );
                self.state = None;
            }
        }

        match self.state.as_mut() {
            Some(state) => {
                state.buffer.extend_from_slice(&packet.payload);
                state.last_seen = now;
                state.destination = packet.destination;
                state.next_index = header.index + 1;
            }
            None if header.index == 0 => {
                debug!(
                    "BLE multi-packet start from {} seq {} ({} packets)",
                    packet.source, header.sequence, header.num_packets
                );
                self.state = Some(InProgress {
                    buffer: packet.payload.clone(),
                    last_seen: now,
                    source: packet.source,
                    destination: packet.destination,
                    sequence: header.sequence,
                    num_packets: header.num_packets,
                    next_index: 1,
                });
            }
            None => {
                debug!(
                    "BLE fragment {} from {} without a start, ignored",
                    header.index, packet.source
                );
                return None;
            }
        }

        if !header.is_last() {
            return None;
        }
        let state = self.state.take()?;
        Some(Message {
            source: packet.source,
            destination: packet.destination,
            payload_type: packet.payload_type,
            payload: state.buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PayloadType;
    use proptest::prelude::*;

    fn packet(sequence: u8, num_packets: u8, index: u8, fill: u8) -> DecodedPacket {
        DecodedPacket {
            source: Address::new(0xA1),
            destination: Address::BROADCAST,
            payload_type: PayloadType::TDF3,
            sequence: SequenceByte::new(sequence, num_packets, index),
            payload: vec![fill; 13],
            encrypted_on_air: false,
        }
    }

    #[test]
    fn test_sequence_byte_layout() {
        let byte = SequenceByte::new(0xA, 3, 2).encode();
        assert_eq!(byte, 0b1010_1010);
        assert_eq!(SequenceByte::decode(byte), SequenceByte::new(0xA, 3, 2));
    }

    proptest! {
        #[test]
        fn prop_sequence_byte_bijection(seq in 0u8..16, count in 1u8..=4, index_seed in 0u8..4) {
            let index = index_seed % count;
            let decoded = SequenceByte::decode(SequenceByte::new(seq, count, index).encode());
            prop_assert_eq!(decoded, SequenceByte { sequence: seq, num_packets: count, index });
        }
    }

    #[test]
    fn test_single_packet_passes_through() {
        let mut reassembler = Reassembler::default();
        let message = reassembler
            .accept(packet(1, 1, 0, 7), Instant::now())
            .expect("delivered");
        assert_eq!(message.payload, vec![7; 13]);
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn test_in_order_fragments() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        assert!(reassembler.accept(packet(2, 3, 0, 1), now).is_none());
        assert!(reassembler.accept(packet(2, 3, 1, 2), now).is_none());
        let message = reassembler.accept(packet(2, 3, 2, 3), now).expect("complete");
        assert_eq!(message.payload.len(), 39);
        assert_eq!(&message.payload[..13], &[1; 13]);
        assert_eq!(&message.payload[26..], &[3; 13]);
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn test_lone_late_fragment_is_ignored() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.accept(packet(2, 3, 2, 3), Instant::now()).is_none());
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn test_timeout_breaks_message() {
        let mut reassembler = Reassembler::default();
        let start = Instant::now();
        assert!(reassembler.accept(packet(2, 2, 0, 1), start).is_none());
        let late = start + Duration::from_millis(301);
        assert!(reassembler.accept(packet(2, 2, 1, 2), late).is_none());
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn test_new_start_replaces_broken_message() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        assert!(reassembler.accept(packet(2, 2, 0, 1), now).is_none());
        // different sequence, index 0: restarts
        assert!(reassembler.accept(packet(3, 2, 0, 4), now).is_none());
        let message = reassembler.accept(packet(3, 2, 1, 5), now).expect("complete");
        assert_eq!(&message.payload[..13], &[4; 13]);
    }

    #[test]
    fn test_other_source_aborts() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        assert!(reassembler.accept(packet(2, 2, 0, 1), now).is_none());
        let mut intruder = packet(2, 2, 1, 9);
        intruder.source = Address::new(0xB2);
        assert!(reassembler.accept(intruder, now).is_none());
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn test_encrypted_destination_only_needs_clear_bytes() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let mut first = packet(4, 2, 0, 1);
        first.destination = Address::new(0x1111_1100_0042);
        first.encrypted_on_air = true;
        let mut second = packet(4, 2, 1, 2);
        second.destination = Address::new(0x2222_2200_0042);
        second.encrypted_on_air = true;
        assert!(reassembler.accept(first, now).is_none());
        assert!(reassembler.accept(second.clone(), now).is_some());

        // same mismatch in the clear aborts
        let mut first = packet(5, 2, 0, 1);
        first.destination = Address::new(0x1111_1100_0042);
        second.sequence = SequenceByte::new(5, 2, 1);
        second.encrypted_on_air = false;
        assert!(reassembler.accept(first, now).is_none());
        assert!(reassembler.accept(second, now).is_none());
    }

    #[test]
    fn test_encrypted_clear_byte_mismatch_aborts() {
        let mut reassembler = Reassembler::default();
        let now = Instant::now();
        let mut first = packet(6, 2, 0, 1);
        first.destination = Address::new(0x1111_1100_0042);
        first.encrypted_on_air = true;
        let mut second = packet(6, 2, 1, 2);
        second.destination = Address::new(0x1111_1100_0043);
        second.encrypted_on_air = true;
        assert!(reassembler.accept(first, now).is_none());
        assert!(reassembler.accept(second, now).is_none());
        assert!(!reassembler.in_progress());
    }
}
