/// Serial transport: framed point-to-point link to the base station
///
/// Frame layout (little-endian):
/// [0xAA][0x55][payload length u16][address 6][sequence][payload type][payload]
///
/// A node sends its own address in the address field. Frames from the base
/// station carry the node they are meant for, so on receive the field is
/// the destination and the source is BROADCAST.

use crate::message::{Address, Message, PayloadType, ADDRESS_LEN};
use crate::routing::{IncomingRoute, RouteMetadata, RouteRecord};
use crate::transport::abstraction::{Channel, CommsInterface, InterfaceKind, ReceiveHandler};
use crate::CommsError;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const SERIAL_SYNC_A: u8 = 0xAA;
pub const SERIAL_SYNC_B: u8 = 0x55;
pub const SERIAL_HEADER_LEN: usize = 12;
/// Receive buffer size of deployed nodes
pub const DEFAULT_MAX_FRAME_LEN: usize = 256;

const SYNC: [u8; 2] = [SERIAL_SYNC_A, SERIAL_SYNC_B];

/// One serial frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    pub address: Address,
    pub sequence: u8,
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
}

impl SerialFrame {
    pub fn encoded_len(&self) -> usize {
        SERIAL_HEADER_LEN + self.payload.len()
    }

    /// Write the frame into `out`, returning the number of bytes used
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, CommsError> {
        let payload_len = u16::try_from(self.payload.len()).map_err(|_| {
            CommsError::InvalidData(format!("serial payload of {} bytes", self.payload.len()))
        })?;
        let total = self.encoded_len();
        if out.len() < total {
            return Err(CommsError::BufferTooSmall {
                need: total,
                got: out.len(),
            });
        }
        out[..2].copy_from_slice(&SYNC);
        out[2..4].copy_from_slice(&payload_len.to_le_bytes());
        out[4..4 + ADDRESS_LEN].copy_from_slice(&self.address.pack());
        out[10] = self.sequence;
        out[11] = self.payload_type.as_u8();
        out[SERIAL_HEADER_LEN..total].copy_from_slice(&self.payload);
        Ok(total)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CommsError> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Parse exactly one complete frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, CommsError> {
        let mut framer = SerialFramer::new(data.len().max(SERIAL_HEADER_LEN));
        let mut frame = None;
        for (i, byte) in data.iter().enumerate() {
            if let Some(complete) = framer.push(*byte) {
                if i + 1 != data.len() {
                    return Err(CommsError::InvalidData(format!(
                        "{} trailing bytes after frame",
                        data.len() - i - 1
                    )));
                }
                frame = Some(complete);
            }
        }
        frame.ok_or_else(|| CommsError::InvalidData("incomplete serial frame".to_string()))
    }
}

/// Byte-at-a-time frame recogniser.
///
/// Discards bytes until the sync pair lines up, learns the payload length
/// from the header, and yields a frame once it is complete. A header that
/// announces more than `max_frame_len` bytes resets the search.
#[derive(Debug)]
pub struct SerialFramer {
    buffer: Vec<u8>,
    expected_len: usize,
    max_frame_len: usize,
}

impl SerialFramer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_frame_len),
            expected_len: 0,
            max_frame_len,
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_len = 0;
    }

    /// Bytes buffered towards the current frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn push(&mut self, byte: u8) -> Option<SerialFrame> {
        let position = self.buffer.len();
        self.buffer.push(byte);

        if position < SYNC.len() {
            if byte != SYNC[position] {
                self.reset();
                // A stray sync byte may begin the real frame
                if byte == SERIAL_SYNC_A {
                    self.buffer.push(byte);
                }
            }
            return None;
        }

        if self.buffer.len() == SERIAL_HEADER_LEN {
            let payload_len = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
            self.expected_len = SERIAL_HEADER_LEN + payload_len;
            if self.expected_len > self.max_frame_len {
                warn!(
                    "Serial frame of {} bytes exceeds {} byte buffer, resyncing",
                    self.expected_len, self.max_frame_len
                );
                self.reset();
                return None;
            }
        }

        if self.buffer.len() >= SERIAL_HEADER_LEN && self.buffer.len() == self.expected_len {
            let frame = self.take_frame();
            self.reset();
            return Some(frame);
        }
        None
    }

    fn take_frame(&self) -> SerialFrame {
        let mut address = [0u8; ADDRESS_LEN];
        address.copy_from_slice(&self.buffer[4..4 + ADDRESS_LEN]);
        SerialFrame {
            address: Address::unpack(&address),
            sequence: self.buffer[10],
            payload_type: PayloadType::from_u8(self.buffer[11]),
            payload: self.buffer[SERIAL_HEADER_LEN..].to_vec(),
        }
    }
}

/// UART-side collaborator
#[cfg_attr(test, mockall::automock)]
pub trait SerialDriver: Send + Sync {
    /// Size of the transmit buffer the driver can hand out, 0 while none is free
    fn max_frame_len(&self) -> usize;
    fn transmit(&self, frame: &[u8]) -> Result<(), CommsError>;
    fn set_enabled(&self, enabled: bool) -> Result<(), CommsError>;
}

struct SerialReceiver {
    framer: SerialFramer,
    last_sequence: Option<u8>,
}

/// The serial [`CommsInterface`]
pub struct SerialInterface {
    driver: Arc<dyn SerialDriver>,
    tx_sequence: Mutex<u8>,
    receiver: Mutex<SerialReceiver>,
    handler: RwLock<Option<ReceiveHandler>>,
}

impl SerialInterface {
    pub fn new(driver: Arc<dyn SerialDriver>, max_frame_len: usize) -> Self {
        Self {
            driver,
            tx_sequence: Mutex::new(0),
            receiver: Mutex::new(SerialReceiver {
                framer: SerialFramer::new(max_frame_len),
                last_sequence: None,
            }),
            handler: RwLock::new(None),
        }
    }

    /// Feed one received byte; call from the UART receive context
    pub fn receive_byte(&self, byte: u8) {
        let frame = {
            let mut rx = self.receiver.lock();
            let Some(frame) = rx.framer.push(byte) else {
                return;
            };
            let duplicate = rx.last_sequence == Some(frame.sequence);
            rx.last_sequence = Some(frame.sequence);
            if duplicate {
                warn!("Duplicate serial frame dropped, sequence {}", frame.sequence);
                return;
            }
            frame
        };
        self.deliver(frame);
    }

    pub fn receive_bytes(&self, bytes: &[u8]) {
        for byte in bytes {
            self.receive_byte(*byte);
        }
    }

    fn deliver(&self, frame: SerialFrame) {
        let Some(handler) = self.handler.read().clone() else {
            debug!("Serial frame {} dropped, no receive handler", frame.sequence);
            return;
        };
        let route = IncomingRoute::new(
            RouteRecord::new(Address::BROADCAST, InterfaceKind::Serial, Channel::DEFAULT),
            RouteMetadata {
                age_ms: 0,
                sequence: frame.sequence,
                rssi: 0,
            },
        );
        // The link is point-to-point: the header carries the destination and
        // the far end has no address of its own
        let message = Message {
            source: Address::BROADCAST,
            destination: frame.address,
            payload_type: frame.payload_type,
            payload: frame.payload,
        };
        info!(
            "Serial RX seq {} for {} type {} ({} bytes)",
            frame.sequence,
            message.destination,
            message.payload_type,
            message.payload.len()
        );
        handler(InterfaceKind::Serial, &route, &message);
    }
}

impl CommsInterface for SerialInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Serial
    }

    fn init(&self) -> Result<(), CommsError> {
        let mut rx = self.receiver.lock();
        rx.framer.reset();
        rx.last_sequence = None;
        Ok(())
    }

    fn enable(&self, enabled: bool) -> Result<(), CommsError> {
        self.driver.set_enabled(enabled)
    }

    fn send(&self, _channel: Channel, message: &Message) -> Result<(), CommsError> {
        let mut sequence = self.tx_sequence.lock();
        let frame = SerialFrame {
            address: message.source,
            sequence: *sequence,
            payload_type: message.payload_type,
            payload: message.payload.clone(),
        };
        let capacity = self.driver.max_frame_len();
        if capacity == 0 {
            warn!("Serial TX buffer busy, seq {} not sent", *sequence);
            return Err(CommsError::UnavailableResource);
        }
        let mut buffer = vec![0u8; capacity];
        let len = frame.encode_into(&mut buffer)?;
        self.driver.transmit(&buffer[..len])?;
        debug!("Serial TX seq {} ({} bytes)", *sequence, len);
        *sequence = sequence.wrapping_add(1);
        Ok(())
    }

    fn set_receive_handler(&self, handler: Option<ReceiveHandler>) {
        *self.handler.write() = handler;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PayloadKind;

    fn sample_frame() -> SerialFrame {
        SerialFrame {
            address: Address::new(0x1),
            sequence: 0,
            payload_type: PayloadType::TDF3,
            payload: vec![0xAA, 0xBB],
        }
    }

    #[test]
    fn test_frame_layout() {
        assert_eq!(
            sample_frame().to_bytes().unwrap(),
            vec![0xAA, 0x55, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0x00, 0x00, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_encode_into_small_buffer() {
        let mut out = [0u8; 13];
        assert_eq!(
            sample_frame().encode_into(&mut out),
            Err(CommsError::BufferTooSmall { need: 14, got: 13 })
        );
    }

    #[test]
    fn test_framer_skips_noise() {
        let mut framer = SerialFramer::new(DEFAULT_MAX_FRAME_LEN);
        let mut input = vec![0x00, 0x13, 0xAA, 0x00, 0x55];
        input.extend(sample_frame().to_bytes().unwrap());
        let frames: Vec<_> = input.into_iter().filter_map(|b| framer.push(b)).collect();
        assert_eq!(frames, vec![sample_frame()]);
    }

    #[test]
    fn test_framer_restarts_on_repeated_sync_a() {
        let mut framer = SerialFramer::new(DEFAULT_MAX_FRAME_LEN);
        let mut input = vec![0xAA];
        input.extend(sample_frame().to_bytes().unwrap());
        let frames: Vec<_> = input.into_iter().filter_map(|b| framer.push(b)).collect();
        assert_eq!(frames, vec![sample_frame()]);
    }

    #[test]
    fn test_framer_empty_payload() {
        let mut framer = SerialFramer::new(DEFAULT_MAX_FRAME_LEN);
        let frame = SerialFrame {
            payload: vec![],
            ..sample_frame()
        };
        let frames: Vec<_> = frame
            .to_bytes()
            .unwrap()
            .into_iter()
            .filter_map(|b| framer.push(b))
            .collect();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_framer_resyncs_on_oversize_header() {
        let mut framer = SerialFramer::new(32);
        let oversize = SerialFrame {
            payload: vec![0u8; 40],
            ..sample_frame()
        };
        for byte in oversize.to_bytes().unwrap() {
            assert!(framer.push(byte).is_none());
        }
        assert!(framer.pending() < SERIAL_HEADER_LEN);

        let frames: Vec<_> = sample_frame()
            .to_bytes()
            .unwrap()
            .into_iter()
            .filter_map(|b| framer.push(b))
            .collect();
        assert_eq!(frames, vec![sample_frame()]);
    }

    #[test]
    fn test_from_bytes() {
        let bytes = sample_frame().to_bytes().unwrap();
        assert_eq!(SerialFrame::from_bytes(&bytes).unwrap(), sample_frame());
        assert!(SerialFrame::from_bytes(&bytes[..5]).is_err());
        let mut long = bytes.clone();
        long.push(0);
        assert!(SerialFrame::from_bytes(&long).is_err());
    }

    #[test]
    fn test_send_reports_small_driver_buffer() {
        let mut driver = MockSerialDriver::new();
        driver.expect_max_frame_len().return_const(8usize);
        driver.expect_transmit().never();
        let serial = SerialInterface::new(Arc::new(driver), DEFAULT_MAX_FRAME_LEN);
        let message = Message::new(Address::new(1), Address::new(2), PayloadKind::Tdf3, vec![1, 2]);
        assert_eq!(
            serial.send(Channel::DEFAULT, &message),
            Err(CommsError::BufferTooSmall { need: 14, got: 8 })
        );
    }

    #[test]
    fn test_send_without_free_buffer() {
        let mut driver = MockSerialDriver::new();
        driver.expect_max_frame_len().return_const(0usize);
        driver.expect_transmit().never();
        let serial = SerialInterface::new(Arc::new(driver), DEFAULT_MAX_FRAME_LEN);
        let message = Message::new(Address::new(1), Address::BASE, PayloadKind::Tdf3, vec![1]);
        assert_eq!(serial.send(Channel::DEFAULT, &message), Err(CommsError::UnavailableResource));
    }

    #[test]
    fn test_send_increments_sequence() {
        let mut driver = MockSerialDriver::new();
        driver.expect_max_frame_len().return_const(DEFAULT_MAX_FRAME_LEN);
        let mut seq = mockall::Sequence::new();
        for expected in 0u8..3 {
            driver
                .expect_transmit()
                .withf(move |frame| frame[10] == expected)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }
        let serial = SerialInterface::new(Arc::new(driver), DEFAULT_MAX_FRAME_LEN);
        let message = Message::new(Address::new(1), Address::new(2), PayloadKind::Tdf3, vec![]);
        for _ in 0..3 {
            serial.send(Channel::DEFAULT, &message).unwrap();
        }
    }
}
