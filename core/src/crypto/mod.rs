// Cryptography hooks: block cipher, key lookup and randomness.
//
// The protocol layer never chooses keys or algorithms itself. It asks a
// `KeyLookup` for a key per (interface, payload kind, peer) and runs
// AES-128-CBC through a `BlockCipher`, so deployments can swap in hardware
// engines or their own key policy.

pub mod cipher;
pub mod keys;

pub use cipher::{AesKey, BlockCipher, SoftwareAes, AES_BLOCK_LEN};
pub use keys::{DecryptionChecker, KeyLookup, NoKeys, OsRandom, RandomSource, StaticKeys};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Data length {0} is not a whole number of {AES_BLOCK_LEN}-byte blocks")]
    UnalignedBlocks(usize),
    #[error("Cipher failure: {0}")]
    CipherFailure(String),
}
