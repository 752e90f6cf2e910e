/// AES-128-CBC over whole blocks, no padding

use super::CryptoError;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const AES_BLOCK_LEN: usize = 16;
pub const AES_KEY_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// A 128-bit AES key, wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; AES_KEY_LEN]);

impl AesKey {
    pub fn new(bytes: [u8; AES_KEY_LEN]) -> Self {
        AesKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }
}

impl From<[u8; AES_KEY_LEN]> for AesKey {
    fn from(bytes: [u8; AES_KEY_LEN]) -> Self {
        AesKey(bytes)
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// In-place AES-128-CBC over a buffer that is a whole number of blocks.
///
/// Implementations may be hardware accelerated; the interfaces only rely on
/// standard CBC semantics.
pub trait BlockCipher: Send + Sync {
    fn encrypt(&self, key: &AesKey, iv: &[u8; AES_BLOCK_LEN], blocks: &mut [u8]) -> Result<(), CryptoError>;
    fn decrypt(&self, key: &AesKey, iv: &[u8; AES_BLOCK_LEN], blocks: &mut [u8]) -> Result<(), CryptoError>;
}

/// Pure software AES from the RustCrypto `aes` and `cbc` crates
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareAes;

impl BlockCipher for SoftwareAes {
    fn encrypt(&self, key: &AesKey, iv: &[u8; AES_BLOCK_LEN], blocks: &mut [u8]) -> Result<(), CryptoError> {
        check_alignment(blocks)?;
        let len = blocks.len();
        Aes128CbcEnc::new(key.as_bytes().into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(blocks, len)
            .map_err(|e| CryptoError::CipherFailure(e.to_string()))?;
        Ok(())
    }

    fn decrypt(&self, key: &AesKey, iv: &[u8; AES_BLOCK_LEN], blocks: &mut [u8]) -> Result<(), CryptoError> {
        check_alignment(blocks)?;
        Aes128CbcDec::new(key.as_bytes().into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(blocks)
            .map_err(|e| CryptoError::CipherFailure(e.to_string()))?;
        Ok(())
    }
}

fn check_alignment(blocks: &[u8]) -> Result<(), CryptoError> {
    if blocks.len() % AES_BLOCK_LEN != 0 {
        return Err(CryptoError::UnalignedBlocks(blocks.len()));
    }
    Ok(())
}
