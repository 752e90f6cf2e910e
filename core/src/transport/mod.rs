// Transport module: comms interfaces and their wire codecs

pub mod abstraction;
pub mod ble;
pub mod listen;
pub mod manager;
pub mod serial;

pub use abstraction::{Channel, CommsInterface, InterfaceKind, ReceiveHandler};
pub use ble::{
    AdvertisingCodec, AdvertisingDriver, AdvertisingPacket, BluetoothInterface, GattCharacteristic,
    GattCodec, GattDriver, GattEvent, GattInterface, ScanReport,
};
pub use listen::{ListenController, ListenDuration, ListenMode};
pub use manager::InterfaceRegistry;
pub use serial::{SerialDriver, SerialFrame, SerialFramer, SerialInterface};
