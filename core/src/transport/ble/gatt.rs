/// GATT transport: messages over a connected BLE link
///
/// Frames are a single characteristic write or notification, no fragmentation:
///
/// ```text
/// cleartext:          [payload type][payload]
/// locally encrypted:  [payload type | ENCRYPTED][payload length][iv 16][ciphertext, zero padded]
/// ```
///
/// A payload that already carries `ENCRYPTED` is sent in the cleartext
/// layout; its bytes are opaque to this node.

use crate::config::GattConfig;
use crate::crypto::{BlockCipher, KeyLookup, NoKeys, OsRandom, RandomSource, SoftwareAes, AES_BLOCK_LEN};
use crate::message::{Address, Message, PayloadType};
use crate::routing::{IncomingRoute, RouteMetadata, RouteRecord};
use crate::transport::abstraction::{Channel, CommsInterface, InterfaceKind, ReceiveHandler};
use crate::CommsError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default ATT MTU of deployed nodes
pub const GATT_MTU: usize = 220;
/// Type byte, length byte and IV
pub const GATT_ENCRYPTED_HEADER_LEN: usize = 2 + AES_BLOCK_LEN;

/// Unified comms GATT service
pub const GATT_SERVICE_UUID: u128 = 0x9ac90001_c517_0d61_0c95_0d5593949597;

/// RSSI byte reported for GATT hops; the link has no per-packet RSSI
const GATT_ROUTE_RSSI: u8 = 30;

/// Characteristics of the unified comms service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattCharacteristic {
    /// Peer writes messages here
    DataIn,
    /// Messages out, delivered by indication
    AckedOut,
    /// Messages out, delivered by notification
    NackedOut,
}

impl GattCharacteristic {
    pub const ALL: [GattCharacteristic; 3] = [
        GattCharacteristic::DataIn,
        GattCharacteristic::AckedOut,
        GattCharacteristic::NackedOut,
    ];

    pub fn uuid(&self) -> u128 {
        match self {
            GattCharacteristic::DataIn => 0x9ac90002_c517_0d61_0c95_0d5593949597,
            GattCharacteristic::AckedOut => 0x9ac90003_c517_0d61_0c95_0d5593949597,
            GattCharacteristic::NackedOut => 0x9ac90004_c517_0d61_0c95_0d5593949597,
        }
    }

    pub fn from_uuid(uuid: u128) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    /// Channel a message received through this characteristic arrives on
    pub fn channel(&self) -> Channel {
        match self {
            GattCharacteristic::AckedOut => Channel::GATT_ACKED,
            GattCharacteristic::DataIn | GattCharacteristic::NackedOut => Channel::GATT_NACKED,
        }
    }
}

/// Encodes and decodes GATT frames
#[derive(Clone)]
pub struct GattCodec {
    mtu: usize,
    keys: Arc<dyn KeyLookup>,
    cipher: Arc<dyn BlockCipher>,
    random: Arc<dyn RandomSource>,
}

impl GattCodec {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            keys: Arc::new(NoKeys),
            cipher: Arc::new(SoftwareAes),
            random: Arc::new(OsRandom),
        }
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeyLookup>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn BlockCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Encode `message` into `out`, returning the frame length.
    ///
    /// Frames longer than the MTU are rejected before anything is written.
    pub fn encode_into(&self, message: &Message, out: &mut [u8]) -> Result<usize, CommsError> {
        let key = if message.payload_type.is_encrypted() {
            None
        } else {
            self.keys
                .encryption_key(InterfaceKind::Gatt, message.payload_type, message.destination)
        };

        let len = message.payload.len();
        let Some(key) = key else {
            let frame_len = 1 + len;
            self.check_fits(frame_len, out.len())?;
            out[0] = message.payload_type.as_u8();
            out[1..frame_len].copy_from_slice(&message.payload);
            return Ok(frame_len);
        };

        let padded = len.div_ceil(AES_BLOCK_LEN) * AES_BLOCK_LEN;
        let frame_len = GATT_ENCRYPTED_HEADER_LEN + padded;
        self.check_fits(frame_len, out.len())?;
        let declared = u8::try_from(len)
            .map_err(|_| CommsError::InvalidData(format!("{} byte payload exceeds length field", len)))?;

        let mut iv = [0u8; AES_BLOCK_LEN];
        self.random.fill(&mut iv);
        out[0] = message.payload_type.with_encrypted(true).as_u8();
        out[1] = declared;
        out[2..GATT_ENCRYPTED_HEADER_LEN].copy_from_slice(&iv);
        let body = &mut out[GATT_ENCRYPTED_HEADER_LEN..frame_len];
        body.fill(0);
        body[..len].copy_from_slice(&message.payload);
        self.cipher.encrypt(&key, &iv, body)?;
        Ok(frame_len)
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CommsError> {
        let mut out = vec![0u8; self.mtu];
        let len = self.encode_into(message, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Decode a frame received from `peer`.
    ///
    /// Malformed encrypted frames yield `None`. Without a key the frame is
    /// handed up still encrypted, as length, IV and ciphertext.
    pub fn decode(&self, peer: Address, data: &[u8]) -> Option<(PayloadType, Vec<u8>)> {
        let (&first, rest) = data.split_first()?;
        let payload_type = PayloadType::from_u8(first);
        if !payload_type.is_encrypted() {
            return Some((payload_type, rest.to_vec()));
        }

        if data.len() < GATT_ENCRYPTED_HEADER_LEN || (data.len() - GATT_ENCRYPTED_HEADER_LEN) % AES_BLOCK_LEN != 0 {
            debug!("GATT encrypted frame of {} bytes is not block aligned, dropped", data.len());
            return None;
        }
        let Some(key) = self
            .keys
            .decryption_key(InterfaceKind::Gatt, payload_type.without_flags(), peer)
        else {
            return Some((payload_type, rest.to_vec()));
        };

        let declared = data[1] as usize;
        let mut iv = [0u8; AES_BLOCK_LEN];
        iv.copy_from_slice(&data[2..GATT_ENCRYPTED_HEADER_LEN]);
        let mut body = data[GATT_ENCRYPTED_HEADER_LEN..].to_vec();
        if declared > body.len() {
            debug!("GATT frame declares {} bytes in a {} byte body, dropped", declared, body.len());
            return None;
        }
        self.cipher.decrypt(&key, &iv, &mut body).ok()?;
        body.truncate(declared);
        Some((payload_type.with_encrypted(false), body))
    }

    fn check_fits(&self, frame_len: usize, buffer_len: usize) -> Result<(), CommsError> {
        if frame_len > self.mtu {
            return Err(CommsError::InvalidData(format!(
                "{} byte GATT frame exceeds MTU {}",
                frame_len, self.mtu
            )));
        }
        if frame_len > buffer_len {
            return Err(CommsError::BufferTooSmall {
                need: frame_len,
                got: buffer_len,
            });
        }
        Ok(())
    }
}

/// Connection-side collaborator, one link at a time
#[cfg_attr(test, mockall::automock)]
pub trait GattDriver: Send + Sync {
    /// Write to the peer's data-in characteristic, with or without response
    fn write_remote_data_in(&self, data: &[u8], acked: bool) -> Result<(), CommsError>;
    /// Indicate (acked) or notify (nacked) through a local characteristic
    fn notify_local(&self, characteristic: GattCharacteristic, data: &[u8]) -> Result<(), CommsError>;
    fn subscribe_remote(&self, characteristic: GattCharacteristic) -> Result<(), CommsError>;
    fn disconnect(&self) -> Result<(), CommsError>;
}

/// Connection lifecycle reported by the BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connected {
        remote: Address,
        /// Unified comms characteristics discovered on the peer
        remote_characteristics: Vec<GattCharacteristic>,
    },
    Disconnected,
    /// The peer wrote one of our characteristics
    LocalWritten { uuid: u128, data: Vec<u8> },
    /// The peer changed its subscription to one of our characteristics
    LocalSubscribed { uuid: u128, subscribed: bool },
    /// A notification or indication arrived from the peer
    RemoteChanged { uuid: u128, data: Vec<u8> },
}

/// Observer for characteristics outside the unified comms service
pub type CharacteristicHandler = Arc<dyn Fn(u128, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Connection {
    remote: Address,
    remote_data_in: bool,
    acked_subscribed: bool,
    nacked_subscribed: bool,
}

/// The GATT [`CommsInterface`]
pub struct GattInterface {
    driver: Arc<dyn GattDriver>,
    codec: GattCodec,
    local: Address,
    send_timeout: Duration,
    encode_buffer: Mutex<Vec<u8>>,
    connection: Mutex<Option<Connection>>,
    handler: RwLock<Option<ReceiveHandler>>,
    characteristic_handler: RwLock<Option<CharacteristicHandler>>,
}

impl GattInterface {
    pub fn new(driver: Arc<dyn GattDriver>, codec: GattCodec, local: Address, config: &GattConfig) -> Self {
        let mtu = codec.mtu();
        Self {
            driver,
            codec,
            local,
            send_timeout: config.send_timeout(),
            encode_buffer: Mutex::new(vec![0u8; mtu]),
            connection: Mutex::new(None),
            handler: RwLock::new(None),
            characteristic_handler: RwLock::new(None),
        }
    }

    pub fn set_characteristic_handler(&self, handler: Option<CharacteristicHandler>) {
        *self.characteristic_handler.write() = handler;
    }

    /// Address of the connected peer
    pub fn remote(&self) -> Option<Address> {
        self.connection.lock().map(|c| c.remote)
    }

    /// Feed one event from the BLE stack
    pub fn handle_event(&self, event: GattEvent) {
        match event {
            GattEvent::Connected {
                remote,
                remote_characteristics,
            } => {
                info!("GATT connected to {}", remote);
                *self.connection.lock() = Some(Connection {
                    remote,
                    remote_data_in: remote_characteristics.contains(&GattCharacteristic::DataIn),
                    acked_subscribed: false,
                    nacked_subscribed: false,
                });
                for characteristic in [GattCharacteristic::AckedOut, GattCharacteristic::NackedOut] {
                    if remote_characteristics.contains(&characteristic) {
                        if let Err(e) = self.driver.subscribe_remote(characteristic) {
                            warn!("GATT subscribe to {:?} on {} failed: {}", characteristic, remote, e);
                        }
                    }
                }
            }
            GattEvent::Disconnected => {
                if let Some(connection) = self.connection.lock().take() {
                    info!("GATT disconnected from {}", connection.remote);
                }
            }
            GattEvent::LocalSubscribed { uuid, subscribed } => {
                let mut connection = self.connection.lock();
                let Some(connection) = connection.as_mut() else {
                    return;
                };
                match GattCharacteristic::from_uuid(uuid) {
                    Some(GattCharacteristic::AckedOut) => connection.acked_subscribed = subscribed,
                    Some(GattCharacteristic::NackedOut) => connection.nacked_subscribed = subscribed,
                    _ => debug!("GATT subscription change on {:032x} ignored", uuid),
                }
            }
            GattEvent::LocalWritten { uuid, data } => match GattCharacteristic::from_uuid(uuid) {
                Some(GattCharacteristic::DataIn) => self.receive(GattCharacteristic::DataIn, &data),
                _ => self.forward_characteristic(uuid, &data),
            },
            GattEvent::RemoteChanged { uuid, data } => match GattCharacteristic::from_uuid(uuid) {
                Some(characteristic @ (GattCharacteristic::AckedOut | GattCharacteristic::NackedOut)) => {
                    self.receive(characteristic, &data)
                }
                _ => self.forward_characteristic(uuid, &data),
            },
        }
    }

    fn forward_characteristic(&self, uuid: u128, data: &[u8]) {
        let handler = self.characteristic_handler.read().clone();
        match handler {
            Some(handler) => handler(uuid, data),
            None => debug!("GATT data on {:032x} with no handler", uuid),
        }
    }

    fn receive(&self, characteristic: GattCharacteristic, data: &[u8]) {
        let Some(remote) = self.remote() else {
            debug!("GATT data without a connection, dropped");
            return;
        };
        let Some((payload_type, payload)) = self.codec.decode(remote, data) else {
            return;
        };
        let Some(handler) = self.handler.read().clone() else {
            debug!("GATT message from {} dropped, no receive handler", remote);
            return;
        };
        let route = IncomingRoute::new(
            RouteRecord::new(remote, InterfaceKind::Gatt, characteristic.channel()),
            RouteMetadata {
                age_ms: 0,
                sequence: 0,
                rssi: GATT_ROUTE_RSSI,
            },
        );
        let message = Message {
            source: remote,
            destination: self.local,
            payload_type,
            payload,
        };
        info!(
            "GATT RX from {} via {:?} type {} ({} bytes)",
            remote,
            characteristic,
            message.payload_type,
            message.payload.len()
        );
        handler(InterfaceKind::Gatt, &route, &message);
    }
}

impl CommsInterface for GattInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Gatt
    }

    fn init(&self) -> Result<(), CommsError> {
        *self.connection.lock() = None;
        Ok(())
    }

    /// Connections are driven by the BLE stack; disabling drops the current one
    fn enable(&self, enabled: bool) -> Result<(), CommsError> {
        if !enabled && self.remote().is_some() {
            self.driver.disconnect()?;
        }
        Ok(())
    }

    fn send(&self, channel: Channel, message: &Message) -> Result<(), CommsError> {
        let connection = (*self.connection.lock()).ok_or(CommsError::InvalidAddress)?;
        if message.destination != connection.remote {
            return Err(CommsError::InvalidAddress);
        }
        let acked = channel == Channel::GATT_ACKED;
        let local_out = if connection.remote_data_in {
            None
        } else if acked && connection.acked_subscribed {
            Some(GattCharacteristic::AckedOut)
        } else if !acked && connection.nacked_subscribed {
            Some(GattCharacteristic::NackedOut)
        } else {
            return Err(CommsError::InvalidState(format!(
                "{} is not subscribed for channel {}",
                connection.remote, channel
            )));
        };

        let mut buffer = self
            .encode_buffer
            .try_lock_for(self.send_timeout)
            .ok_or(CommsError::Timeout)?;
        let len = self.codec.encode_into(message, &mut buffer)?;
        match local_out {
            None => self.driver.write_remote_data_in(&buffer[..len], acked)?,
            Some(characteristic) => self.driver.notify_local(characteristic, &buffer[..len])?,
        }
        debug!("GATT TX {} bytes to {} on channel {}", len, connection.remote, channel);
        Ok(())
    }

    fn set_receive_handler(&self, handler: Option<ReceiveHandler>) {
        *self.handler.write() = handler;
    }
}
