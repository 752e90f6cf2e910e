/// Key lookup, decryption checking and randomness collaborators

use super::cipher::AesKey;
use crate::message::{Address, PayloadType};
use crate::transport::InterfaceKind;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;

/// Chooses the key for a transmission.
///
/// Queried separately for each direction. Encryption sees the message's full
/// payload type, flags and reserved bits included; decryption sees the kind
/// bits of the received descriptor. Returning `None` means the payload
/// travels (or is handed up) as-is.
#[cfg_attr(test, mockall::automock)]
pub trait KeyLookup: Send + Sync {
    fn encryption_key(&self, interface: InterfaceKind, payload_type: PayloadType, peer: Address) -> Option<AesKey>;
    fn decryption_key(&self, interface: InterfaceKind, payload_type: PayloadType, peer: Address) -> Option<AesKey>;
}

/// Key policy that never encrypts
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeys;

impl KeyLookup for NoKeys {
    fn encryption_key(&self, _: InterfaceKind, _: PayloadType, _: Address) -> Option<AesKey> {
        None
    }

    fn decryption_key(&self, _: InterfaceKind, _: PayloadType, _: Address) -> Option<AesKey> {
        None
    }
}

/// Fixed key table: per-peer keys with an optional fallback
#[derive(Debug, Clone, Default)]
pub struct StaticKeys {
    fallback: Option<AesKey>,
    peers: HashMap<Address, AesKey>,
}

impl StaticKeys {
    /// Use `key` for every peer
    pub fn shared(key: AesKey) -> Self {
        Self {
            fallback: Some(key),
            peers: HashMap::new(),
        }
    }

    pub fn with_peer(mut self, peer: Address, key: AesKey) -> Self {
        self.peers.insert(peer, key);
        self
    }

    fn lookup(&self, peer: Address) -> Option<AesKey> {
        self.peers.get(&peer).or(self.fallback.as_ref()).cloned()
    }
}

impl KeyLookup for StaticKeys {
    fn encryption_key(&self, _: InterfaceKind, _: PayloadType, peer: Address) -> Option<AesKey> {
        self.lookup(peer)
    }

    fn decryption_key(&self, _: InterfaceKind, _: PayloadType, peer: Address) -> Option<AesKey> {
        self.lookup(peer)
    }
}

/// Judges whether a decrypted advertising block is plausible plaintext
pub type DecryptionChecker = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Source of IV bytes
pub trait RandomSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// Operating system randomness
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}
