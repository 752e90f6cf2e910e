/// Advertising codec: messages packed into legacy BLE advertisements
///
/// Every packet uses the full 31-byte legacy payload:
///
/// ```text
/// [0x02 0x01 0x06]      AD flags
/// [0x1B 0x09]           AD header: 27 bytes of Complete Local Name
/// [descriptor + 0x21]   payload type, shifted into printable ASCII
/// [25 bytes CSIRO85]    20 binary bytes: [sequence][address 6 LE][payload 13]
/// ```
///
/// Phones read the local name as UTF-8, hence the ASCII shift and base-85
/// body. There is no length field; receivers always deliver whole packets.
///
/// Encryption covers binary bytes 4..20 (the upper three address bytes plus
/// the payload) as one AES-128-CBC block, with an IV built from the lower
/// three address bytes and a deployment-wide tail. This obfuscates payloads
/// but is not authenticated and reuses IVs; it is kept for compatibility
/// with deployed nodes.

use super::fragment::{SequenceByte, MAX_PACKETS};
use crate::config::IV_TAIL_LEN;
use crate::crypto::{AesKey, BlockCipher, DecryptionChecker, KeyLookup, NoKeys, SoftwareAes, AES_BLOCK_LEN};
use crate::encoding::csiro85;
use crate::message::{Address, Message, PayloadType, ADDRESS_LEN};
use crate::transport::InterfaceKind;
use crate::CommsError;
use std::sync::Arc;
use tracing::{debug, trace};

/// Legacy advertising payload size
pub const ADVERTISING_PACKET_LEN: usize = 31;
pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
/// LE general discoverable, BR/EDR not supported
pub const AD_FLAGS: [u8; 3] = [0x02, AD_TYPE_FLAGS, 0x06];
pub const LOCAL_NAME_LEN: usize = 26;
pub const HEADER_ASCII_OFFSET: u8 = 0x21;

/// Cleartext payload bytes per packet
pub const PAYLOAD_MAX_LEN: usize = 13;
/// Largest cleartext message
pub const MESSAGE_MAX_LEN: usize = PAYLOAD_MAX_LEN * MAX_PACKETS as usize;
/// Bytes per packet when the payload arrives already encrypted
pub const ENCRYPTED_PAYLOAD_LEN: usize = PAYLOAD_MAX_LEN + ENCRYPTED_ADDRESS_BYTES;
pub const ENCRYPTED_MESSAGE_MAX_LEN: usize = ENCRYPTED_PAYLOAD_LEN * MAX_PACKETS as usize;

const NAME_HEADER: [u8; 2] = [LOCAL_NAME_LEN as u8 + 1, AD_TYPE_COMPLETE_LOCAL_NAME];
const DESCRIPTOR_OFFSET: usize = AD_FLAGS.len() + NAME_HEADER.len();
const ENCODED_OFFSET: usize = DESCRIPTOR_OFFSET + 1;
const ENCODED_LEN: usize = LOCAL_NAME_LEN - 1;
const BINARY_LEN: usize = 20;
const ADDRESS_OFFSET: usize = 1;
const PAYLOAD_OFFSET: usize = ADDRESS_OFFSET + ADDRESS_LEN;
/// Address bytes overwritten by ciphertext
const ENCRYPTED_ADDRESS_BYTES: usize = 3;
const CIPHER_OFFSET: usize = PAYLOAD_OFFSET - ENCRYPTED_ADDRESS_BYTES;

/// One packet recovered from the air
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub source: Address,
    pub destination: Address,
    /// Kind bits, plus `ENCRYPTED` when `payload` is still ciphertext
    pub payload_type: PayloadType,
    pub sequence: SequenceByte,
    pub payload: Vec<u8>,
    /// The packet carried the encrypted flag, whether or not it was decrypted
    pub encrypted_on_air: bool,
}

impl DecodedPacket {
    pub fn into_message(self) -> Message {
        Message {
            source: self.source,
            destination: self.destination,
            payload_type: self.payload_type,
            payload: self.payload,
        }
    }
}

/// Packs messages into advertisements and back.
///
/// Holds everything the byte format depends on besides the message itself:
/// the local address (used for broadcasts), the key policy, the cipher, the
/// IV tail and the optional decryption checker.
#[derive(Clone)]
pub struct AdvertisingCodec {
    local: Address,
    iv_tail: [u8; IV_TAIL_LEN],
    keys: Arc<dyn KeyLookup>,
    cipher: Arc<dyn BlockCipher>,
    checker: Option<DecryptionChecker>,
}

impl AdvertisingCodec {
    pub fn new(local: Address) -> Self {
        Self {
            local,
            iv_tail: [0u8; IV_TAIL_LEN],
            keys: Arc::new(NoKeys),
            cipher: Arc::new(SoftwareAes),
            checker: None,
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

    pub fn with_iv_tail(mut self, iv_tail: [u8; IV_TAIL_LEN]) -> Self {
        self.iv_tail = iv_tail;
        self
    }

    pub fn with_checker(mut self, checker: Option<DecryptionChecker>) -> Self {
        self.checker = checker;
        self
    }

    pub fn set_iv_tail(&mut self, iv_tail: [u8; IV_TAIL_LEN]) {
        self.iv_tail = iv_tail;
    }

    pub fn set_checker(&mut self, checker: Option<DecryptionChecker>) {
        self.checker = checker;
    }

    pub fn local(&self) -> Address {
        self.local
    }

    /// Number of packets `message` needs
    pub fn packet_count(message: &Message) -> usize {
        let capacity = if message.payload_type.is_encrypted() {
            ENCRYPTED_PAYLOAD_LEN
        } else {
            PAYLOAD_MAX_LEN
        };
        message.payload.len().div_ceil(capacity).max(1)
    }

    /// Split and encode `message` using the 4-bit message `sequence`.
    ///
    /// All validation happens before any packet is produced, so an error
    /// means nothing should be transmitted.
    pub fn encode(&self, message: &Message, sequence: u8) -> Result<Vec<[u8; ADVERTISING_PACKET_LEN]>, CommsError> {
        let pre_encrypted = message.payload_type.is_encrypted();
        let num_packets = Self::packet_count(message);
        if num_packets > MAX_PACKETS as usize {
            let max = if pre_encrypted { ENCRYPTED_MESSAGE_MAX_LEN } else { MESSAGE_MAX_LEN };
            return Err(CommsError::InvalidData(format!(
                "{} byte payload exceeds {} byte advertising limit",
                message.payload.len(),
                max
            )));
        }

        let mut descriptor = message.payload_type;
        let header_address = if message.destination.is_broadcast() {
            descriptor = descriptor.with_broadcast(true);
            self.local
        } else {
            message.destination
        };

        let key = if pre_encrypted {
            None
        } else {
            self.keys
                .encryption_key(InterfaceKind::Bluetooth, message.payload_type, message.destination)
        };
        if key.is_some() {
            descriptor = descriptor.with_encrypted(true);
        }

        let mut packets = Vec::with_capacity(num_packets);
        for index in 0..num_packets {
            let mut binary = [0u8; BINARY_LEN];
            binary[0] = SequenceByte::new(sequence, num_packets as u8, index as u8).encode();
            binary[ADDRESS_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&header_address.pack());

            if pre_encrypted {
                let start = index * ENCRYPTED_PAYLOAD_LEN;
                let end = (start + ENCRYPTED_PAYLOAD_LEN).min(message.payload.len());
                if end.saturating_sub(start) <= ENCRYPTED_ADDRESS_BYTES {
                    return Err(CommsError::InvalidData(
                        "pre-encrypted packet must carry more than 3 bytes".to_string(),
                    ));
                }
                let chunk = &message.payload[start..end];
                binary[CIPHER_OFFSET..CIPHER_OFFSET + chunk.len()].copy_from_slice(chunk);
            } else {
                let start = index * PAYLOAD_MAX_LEN;
                let end = (start + PAYLOAD_MAX_LEN).min(message.payload.len());
                let chunk = &message.payload[start..end];
                binary[PAYLOAD_OFFSET..PAYLOAD_OFFSET + chunk.len()].copy_from_slice(chunk);
                if let Some(key) = &key {
                    self.crypt_block(key, &mut binary, true)?;
                }
            }

            trace!("BLE TX packet {}/{} descriptor {:02X}: {:02X?}", index + 1, num_packets, descriptor.as_u8(), binary);
            packets.push(Self::wrap(descriptor, &binary)?);
        }
        debug!(
            "BLE encoded {} bytes to {} in {} packet(s), seq {}",
            message.payload.len(),
            message.destination,
            num_packets,
            sequence & 0x0F
        );
        Ok(packets)
    }

    /// True when `data` has the AD structure of a unified comms packet
    pub fn has_unified_headers(data: &[u8]) -> bool {
        data.len() == ADVERTISING_PACKET_LEN
            && data[1] == AD_TYPE_FLAGS
            && data[AD_FLAGS.len() + 1] == AD_TYPE_COMPLETE_LOCAL_NAME
    }

    /// Decode one advertisement heard from `sender`.
    ///
    /// Returns `None` for anything that is not a well-formed packet; nearby
    /// devices advertise arbitrary data.
    pub fn decode(&self, sender: Address, data: &[u8]) -> Option<DecodedPacket> {
        if !Self::has_unified_headers(data) {
            return None;
        }
        let shifted = data[DESCRIPTOR_OFFSET];
        let encoded = &data[ENCODED_OFFSET..];
        if shifted < HEADER_ASCII_OFFSET || !csiro85::is_valid(encoded) {
            return None;
        }
        let raw_descriptor = shifted - HEADER_ASCII_OFFSET;
        if raw_descriptor & PayloadType::RESERVED_HIGH_MASK != 0 {
            return None;
        }
        let descriptor = PayloadType::from_u8(raw_descriptor);

        let mut binary = [0u8; BINARY_LEN];
        csiro85::decode_into(encoded, &mut binary).ok()?;

        let sequence = SequenceByte::decode(binary[0]);
        let header_address = Address::from_slice(&binary[ADDRESS_OFFSET..])?;
        let kind_only = descriptor.without_flags();

        let mut still_encrypted = false;
        if descriptor.is_encrypted() {
            still_encrypted = true;
            if let Some(key) = self
                .keys
                .decryption_key(InterfaceKind::Bluetooth, kind_only, header_address)
            {
                let mut scratch = binary;
                self.crypt_block(&key, &mut scratch, false).ok()?;
                let plaintext = &scratch[CIPHER_OFFSET..];
                let accepted = self.checker.as_ref().map_or(true, |check| check(plaintext));
                if accepted {
                    binary = scratch;
                    still_encrypted = false;
                } else {
                    debug!("BLE decryption rejected by checker, delivering ciphertext");
                }
            }
        }

        let (payload_type, payload) = if still_encrypted {
            (kind_only.with_encrypted(true), binary[CIPHER_OFFSET..].to_vec())
        } else {
            (kind_only, binary[PAYLOAD_OFFSET..].to_vec())
        };

        let address = Address::from_slice(&binary[ADDRESS_OFFSET..])?;
        let (source, destination) = if descriptor.is_broadcast() {
            (address, Address::BROADCAST)
        } else {
            (sender, address)
        };

        Some(DecodedPacket {
            source,
            destination,
            payload_type,
            sequence,
            payload,
            encrypted_on_air: descriptor.is_encrypted(),
        })
    }

    fn iv(&self, binary: &[u8; BINARY_LEN]) -> [u8; AES_BLOCK_LEN] {
        let mut iv = [0u8; AES_BLOCK_LEN];
        iv[..ENCRYPTED_ADDRESS_BYTES].copy_from_slice(&binary[ADDRESS_OFFSET..ADDRESS_OFFSET + ENCRYPTED_ADDRESS_BYTES]);
        iv[ENCRYPTED_ADDRESS_BYTES..].copy_from_slice(&self.iv_tail);
        iv
    }

    fn crypt_block(&self, key: &AesKey, binary: &mut [u8; BINARY_LEN], encrypt: bool) -> Result<(), CommsError> {
        let iv = self.iv(binary);
        let block = &mut binary[CIPHER_OFFSET..];
        if encrypt {
            self.cipher.encrypt(key, &iv, block)?;
        } else {
            self.cipher.decrypt(key, &iv, block)?;
        }
        Ok(())
    }

    fn wrap(descriptor: PayloadType, binary: &[u8; BINARY_LEN]) -> Result<[u8; ADVERTISING_PACKET_LEN], CommsError> {
        let mut packet = [0u8; ADVERTISING_PACKET_LEN];
        packet[..AD_FLAGS.len()].copy_from_slice(&AD_FLAGS);
        packet[AD_FLAGS.len()..DESCRIPTOR_OFFSET].copy_from_slice(&NAME_HEADER);
        packet[DESCRIPTOR_OFFSET] = descriptor.as_u8() + HEADER_ASCII_OFFSET;
        csiro85::encode_into(binary, &mut packet[ENCODED_OFFSET..])?;
        Ok(packet)
    }
}
