// Stack configuration: deployment constants that are not part of the wire format
//
// Serialized as JSON by the CLI. Every field has a default matching the
// deployed firmware, so an empty object is a valid configuration.

use crate::message::Address;
use crate::transport::ble::gatt::GATT_ENCRYPTED_HEADER_LEN;
use crate::CommsError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Bytes of the BLE IV that come from the deployment rather than the address
pub const IV_TAIL_LEN: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    /// This node's own address, normally the radio MAC
    pub local_address: Address,
    pub bluetooth: BluetoothConfig,
    pub serial: SerialConfig,
    pub gatt: GattConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Deployment-wide IV tail, shared by every node that must interoperate
    #[serde(with = "hex_tail")]
    pub iv_tail: [u8; IV_TAIL_LEN],
    pub advertise_connectable: bool,
    /// Maximum gap between fragments of one message
    pub multi_packet_timeout_ms: u64,
    /// Repeats per packet on the phone channel
    pub phone_advertise_count: u8,
    pub default_advertise_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Largest frame (header included) the receiver will buffer
    pub max_frame_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    pub mtu: usize,
    /// How long a send waits for the shared encode buffer
    pub send_timeout_ms: u64,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            local_address: Address::BASE,
            bluetooth: BluetoothConfig::default(),
            serial: SerialConfig::default(),
            gatt: GattConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            iv_tail: [0u8; IV_TAIL_LEN],
            advertise_connectable: true,
            multi_packet_timeout_ms: 300,
            phone_advertise_count: 5,
            default_advertise_count: 1,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self { max_frame_len: 256 }
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            mtu: 220,
            send_timeout_ms: 1000,
        }
    }
}

impl BluetoothConfig {
    pub fn multi_packet_timeout(&self) -> Duration {
        Duration::from_millis(self.multi_packet_timeout_ms)
    }
}

impl GattConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl CommsConfig {
    pub fn with_local_address(mut self, address: Address) -> Self {
        self.local_address = address;
        self
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(text: &str) -> Result<Self, CommsError> {
        let config: CommsConfig = serde_json::from_str(text)
            .map_err(|e| CommsError::InvalidData(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, CommsError> {
        serde_json::to_string_pretty(self).map_err(|e| CommsError::Generic(e.to_string()))
    }

    /// Reject configurations no interface could run with
    pub fn validate(&self) -> Result<(), CommsError> {
        if self.local_address.is_broadcast() {
            return Err(CommsError::InvalidAddress);
        }
        if self.bluetooth.multi_packet_timeout_ms == 0 {
            return Err(CommsError::InvalidData(
                "bluetooth.multi_packet_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.bluetooth.default_advertise_count == 0 || self.bluetooth.phone_advertise_count == 0 {
            return Err(CommsError::InvalidData(
                "bluetooth advertise counts must be non-zero".to_string(),
            ));
        }
        if self.serial.max_frame_len <= crate::transport::serial::SERIAL_HEADER_LEN {
            return Err(CommsError::InvalidData(format!(
                "serial.max_frame_len {} leaves no room for a payload",
                self.serial.max_frame_len
            )));
        }
        if self.gatt.mtu <= GATT_ENCRYPTED_HEADER_LEN {
            return Err(CommsError::InvalidData(format!(
                "gatt.mtu {} is too small for the encrypted header",
                self.gatt.mtu
            )));
        }
        if self.gatt.send_timeout_ms == 0 {
            return Err(CommsError::InvalidData(
                "gatt.send_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod hex_tail {
    use super::IV_TAIL_LEN;
    use super::{Deserialize, Deserializer, Serializer};
    use serde::de::Error;

    pub fn serialize<S: Serializer>(tail: &[u8; IV_TAIL_LEN], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(tail))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; IV_TAIL_LEN], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(text.trim()).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::custom(format!("iv_tail must be {} bytes, got {}", IV_TAIL_LEN, b.len())))
    }
}
