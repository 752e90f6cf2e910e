/// Bluetooth advertising interface
///
/// Sends by queueing advertisement chains on the radio and receives from the
/// scan callback. The scan callback is the only writer of the reassembly
/// state; `send` may be called from any task.

use super::advertising::{AdvertisingCodec, ADVERTISING_PACKET_LEN};
use super::fragment::Reassembler;
use crate::config::{BluetoothConfig, IV_TAIL_LEN};
use crate::crypto::DecryptionChecker;
use crate::message::{Address, Message};
use crate::routing::{IncomingRoute, RouteMetadata, RouteRecord};
use crate::transport::abstraction::{Channel, CommsInterface, InterfaceKind, ReceiveHandler};
use crate::CommsError;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// One advertisement handed to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingPacket {
    pub data: [u8; ADVERTISING_PACKET_LEN],
    /// How many times the radio should repeat this packet
    pub advertise_count: u8,
    pub connectable: bool,
    /// Set on the last packet of a chain; the radio may start advertising
    pub start_sequence: bool,
}

/// One scan report from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Advertiser's radio address
    pub address: Address,
    pub rssi: i8,
    pub connectable: bool,
    pub data: Vec<u8>,
}

/// Observer for every scan report, unified or not
pub type RawAdvertisementHandler = Arc<dyn Fn(&ScanReport) + Send + Sync>;

/// Radio-side collaborator
#[cfg_attr(test, mockall::automock)]
pub trait AdvertisingDriver: Send + Sync {
    /// Queue one packet
    fn advertise(&self, packet: &AdvertisingPacket) -> Result<(), CommsError>;
    fn set_scanning(&self, enabled: bool) -> Result<(), CommsError>;
}

/// The Bluetooth advertising [`CommsInterface`]
pub struct BluetoothInterface {
    driver: Arc<dyn AdvertisingDriver>,
    codec: RwLock<AdvertisingCodec>,
    phone_advertise_count: u8,
    default_advertise_count: u8,
    sequence: AtomicU8,
    advertise_connectable: AtomicBool,
    last_connectable: AtomicBool,
    last_rssi: AtomicI8,
    reassembler: Mutex<Reassembler>,
    handler: RwLock<Option<ReceiveHandler>>,
    custom_handler: RwLock<Option<RawAdvertisementHandler>>,
}

impl BluetoothInterface {
    pub fn new(driver: Arc<dyn AdvertisingDriver>, codec: AdvertisingCodec, config: &BluetoothConfig) -> Self {
        Self {
            driver,
            codec: RwLock::new(codec.with_iv_tail(config.iv_tail)),
            phone_advertise_count: config.phone_advertise_count,
            default_advertise_count: config.default_advertise_count,
            sequence: AtomicU8::new(0),
            advertise_connectable: AtomicBool::new(config.advertise_connectable),
            last_connectable: AtomicBool::new(false),
            last_rssi: AtomicI8::new(0),
            reassembler: Mutex::new(Reassembler::new(config.multi_packet_timeout())),
            handler: RwLock::new(None),
            custom_handler: RwLock::new(None),
        }
    }

    pub fn set_decryption_checker(&self, checker: Option<DecryptionChecker>) {
        self.codec.write().set_checker(checker);
    }

    pub fn set_iv_tail(&self, iv_tail: [u8; IV_TAIL_LEN]) {
        self.codec.write().set_iv_tail(iv_tail);
    }

    pub fn set_custom_handler(&self, handler: Option<RawAdvertisementHandler>) {
        *self.custom_handler.write() = handler;
    }

    /// Mark future advertisements as connectable or not
    pub fn advertise_connectable(&self, connectable: bool) {
        self.advertise_connectable.store(connectable, Ordering::Relaxed);
    }

    /// Whether the last unified packet heard was connectable
    pub fn was_connectable(&self) -> bool {
        self.last_connectable.load(Ordering::Relaxed)
    }

    /// RSSI of the last packet decoded
    pub fn last_rssi(&self) -> i8 {
        self.last_rssi.load(Ordering::Relaxed)
    }

    /// Scan callback entry point
    pub fn scan_received(&self, report: &ScanReport) {
        let custom = self.custom_handler.read().clone();
        if let Some(custom) = custom {
            custom(report);
        }
        if !AdvertisingCodec::has_unified_headers(&report.data) {
            return;
        }
        self.last_connectable.store(report.connectable, Ordering::Relaxed);

        let Some(packet) = self.codec.read().decode(report.address, &report.data) else {
            return;
        };
        self.last_rssi.store(report.rssi, Ordering::Relaxed);

        let route = IncomingRoute::new(
            RouteRecord::new(packet.source, InterfaceKind::Bluetooth, Channel::DEFAULT),
            RouteMetadata {
                age_ms: 0,
                sequence: packet.sequence.sequence,
                rssi: RouteMetadata::encode_rssi(report.rssi),
            },
        );
        let Some(message) = self.reassembler.lock().accept(packet, Instant::now()) else {
            return;
        };

        let Some(handler) = self.handler.read().clone() else {
            debug!("BLE message from {} dropped, no receive handler", message.source);
            return;
        };
        info!(
            "BLE RX from {} to {} type {} ({} bytes, rssi {})",
            message.source,
            message.destination,
            message.payload_type,
            message.payload.len(),
            report.rssi
        );
        handler(InterfaceKind::Bluetooth, &route, &message);
    }
}

impl CommsInterface for BluetoothInterface {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::Bluetooth
    }

    fn init(&self) -> Result<(), CommsError> {
        self.reassembler.lock().reset();
        Ok(())
    }

    fn enable(&self, enabled: bool) -> Result<(), CommsError> {
        self.driver.set_scanning(enabled)
    }

    fn send(&self, channel: Channel, message: &Message) -> Result<(), CommsError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) & 0x0F;
        let packets = self.codec.read().encode(message, sequence)?;

        let advertise_count = if channel == Channel::BLUETOOTH_PHONE {
            self.phone_advertise_count
        } else {
            self.default_advertise_count
        };
        let connectable = self.advertise_connectable.load(Ordering::Relaxed);
        let last = packets.len() - 1;
        for (index, data) in packets.into_iter().enumerate() {
            self.driver.advertise(&AdvertisingPacket {
                data,
                advertise_count,
                connectable,
                start_sequence: index == last,
            })?;
        }
        debug!("BLE TX seq {} to {} queued ({} packets)", sequence, message.destination, last + 1);
        Ok(())
    }

    fn set_receive_handler(&self, handler: Option<ReceiveHandler>) {
        *self.handler.write() = handler;
    }
}
