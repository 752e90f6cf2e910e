//! Interface abstraction shared by every transport
//!
//! Each physical transport is wrapped in a [`CommsInterface`]: a long-lived
//! object that can be initialised, switched on and off, asked to send a
//! [`Message`] on a channel, and given a handler for received messages.

use crate::message::Message;
use crate::routing::{IncomingRoute, RouteError};
use crate::CommsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Transport kinds, with their 4-bit identifiers used in route records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum InterfaceKind {
    /// Point-to-point UART link to the base station
    Serial = 0,
    /// Connectionless BLE advertising
    Bluetooth = 1,
    /// Connected BLE GATT link
    Gatt = 2,
    Lora = 3,
    LoraWan = 4,
}

impl InterfaceKind {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Result<Self, RouteError> {
        match id {
            0 => Ok(InterfaceKind::Serial),
            1 => Ok(InterfaceKind::Bluetooth),
            2 => Ok(InterfaceKind::Gatt),
            3 => Ok(InterfaceKind::Lora),
            4 => Ok(InterfaceKind::LoraWan),
            other => Err(RouteError::UnknownInterface(other)),
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceKind::Serial => write!(f, "Serial"),
            InterfaceKind::Bluetooth => write!(f, "Bluetooth"),
            InterfaceKind::Gatt => write!(f, "GATT"),
            InterfaceKind::Lora => write!(f, "LoRa"),
            InterfaceKind::LoraWan => write!(f, "LoRaWAN"),
        }
    }
}

/// Sub-selector within an interface (4 bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Channel(u8);

impl Channel {
    pub const MASK: u8 = 0x0F;

    pub const DEFAULT: Channel = Channel(0);
    /// Bluetooth: the payload answers a phone, advertise it more often
    pub const BLUETOOTH_PHONE: Channel = Channel(1);
    /// GATT: deliver with indications
    pub const GATT_ACKED: Channel = Channel(0);
    /// GATT: deliver with notifications
    pub const GATT_NACKED: Channel = Channel(1);

    pub const fn new(raw: u8) -> Self {
        Channel(raw & Self::MASK)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked for every message an interface delivers.
///
/// Arguments are the receiving interface, the route of the hop that was
/// just received and the message itself.
pub type ReceiveHandler = Arc<dyn Fn(InterfaceKind, &IncomingRoute, &Message) + Send + Sync>;

/// A transport wrapped behind the unified message abstraction
pub trait CommsInterface: Send + Sync {
    fn kind(&self) -> InterfaceKind;

    /// One-time setup, called once before any other operation
    fn init(&self) -> Result<(), CommsError>;

    /// Turn the underlying radio or receiver on or off
    fn enable(&self, enabled: bool) -> Result<(), CommsError>;

    /// Encode and transmit a message. Encoding failures are returned before
    /// anything reaches the driver.
    fn send(&self, channel: Channel, message: &Message) -> Result<(), CommsError>;

    /// Replace the receive handler; `None` stops delivery
    fn set_receive_handler(&self, handler: Option<ReceiveHandler>);
}
