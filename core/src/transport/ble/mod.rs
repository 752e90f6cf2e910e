/// BLE transports
///
/// - **advertising**: the 31-byte advertisement codec and its encryption
/// - **fragment**: sequence byte and multi-packet reassembly
/// - **scanner**: the advertising [`CommsInterface`](crate::transport::CommsInterface)
/// - **gatt**: GATT frame codec and the connected-link interface
///
/// Radio primitives stay behind the driver traits; everything here runs
/// without BLE hardware.

pub mod advertising;
pub mod fragment;
pub mod gatt;
pub mod scanner;

pub use advertising::{
    AdvertisingCodec, DecodedPacket, ADVERTISING_PACKET_LEN, ENCRYPTED_MESSAGE_MAX_LEN,
    ENCRYPTED_PAYLOAD_LEN, MESSAGE_MAX_LEN, PAYLOAD_MAX_LEN,
};
pub use fragment::{Reassembler, SequenceByte, MAX_PACKETS, MULTI_PACKET_TIMEOUT};
pub use gatt::{
    CharacteristicHandler, GattCharacteristic, GattCodec, GattDriver, GattEvent, GattInterface,
    GATT_ENCRYPTED_HEADER_LEN, GATT_MTU, GATT_SERVICE_UUID,
};
pub use scanner::{
    AdvertisingDriver, AdvertisingPacket, BluetoothInterface, RawAdvertisementHandler, ScanReport,
};
