//! AES-128-CBC without padding.
//!
//! The frame layer pads plain frames with zeros to the block size itself, so
//! the cipher never adds or strips padding. Inputs that are not a whole
//! number of blocks are rejected.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use rand::{RngCore, rngs::OsRng};

use super::keys::SymmetricKey;
use crate::core::{BLOCK_SIZE, IV_SIZE, ProtocolError};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Generate a fresh random IV.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt a block-aligned plaintext.
pub fn encrypt(
    key: &SymmetricKey,
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if plaintext.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::Length);
    }
    let mut buf = plaintext.to_vec();
    let len = buf.len();
    Aes128CbcEnc::new(key.as_bytes().into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|_| ProtocolError::Length)?;
    Ok(buf)
}

/// Decrypt a block-aligned ciphertext.
pub fn decrypt(
    key: &SymmetricKey,
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(ProtocolError::Format);
    }
    let mut buf = ciphertext.to_vec();
    Aes128CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| ProtocolError::Format)?;
    Ok(buf)
}
