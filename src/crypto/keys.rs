//! Key material for the login and session phases.
//!
//! Two AES-128 keys protect the link:
//! - the login key, `MD5(local_key)`, encrypts the device-info exchange;
//! - the session key, `MD5(local_key || device_random)`, encrypts everything
//!   after it and is re-derived on every connection.
//!
//! The local key is the first six bytes of the pairing secret handed out by
//! the credential source.

use md5::{Digest, Md5};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::{
    DEVICE_RANDOM_SIZE, LOCAL_KEY_SIZE, ProtocolError, SECURITY_FLAG_LOGIN, SECURITY_FLAG_SESSION,
};

/// Size of an AES-128 key.
pub const KEY_SIZE: usize = 16;

/// First six bytes of the pairing secret.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct LocalKey([u8; LOCAL_KEY_SIZE]);

impl LocalKey {
    /// Take the local key from a pairing secret.
    ///
    /// Secrets shorter than six bytes are zero-extended.
    pub fn from_secret(secret: &str) -> Self {
        let mut key = [0u8; LOCAL_KEY_SIZE];
        let bytes = secret.as_bytes();
        let len = bytes.len().min(LOCAL_KEY_SIZE);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; LOCAL_KEY_SIZE] {
        &self.0
    }

    /// Derive the login key, `MD5(local_key)`.
    pub fn login_key(&self) -> SymmetricKey {
        SymmetricKey(Md5::digest(self.0).into())
    }

    /// Derive the session key, `MD5(local_key || device_random)`.
    pub fn session_key(&self, device_random: &[u8; DEVICE_RANDOM_SIZE]) -> SymmetricKey {
        let mut hasher = Md5::new();
        hasher.update(self.0);
        hasher.update(device_random);
        SymmetricKey(hasher.finalize().into())
    }
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalKey(..)")
    }
}

/// An AES-128 key.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Derive a key as the MD5 digest of arbitrary bytes.
    pub fn md5_of(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Which key protects a frame, as encoded in its security flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityFlag {
    /// Login key (device-info exchange).
    Login = SECURITY_FLAG_LOGIN,
    /// Session key.
    Session = SECURITY_FLAG_SESSION,
}

impl SecurityFlag {
    /// Parse a security flag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SECURITY_FLAG_LOGIN => Some(Self::Login),
            SECURITY_FLAG_SESSION => Some(Self::Session),
            _ => None,
        }
    }

    /// Get the byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The keys of one connection.
#[derive(Debug, Clone)]
pub struct KeySet {
    login: SymmetricKey,
    session: Option<SymmetricKey>,
}

impl KeySet {
    /// Create a key set with only the login key.
    pub fn new(login: SymmetricKey) -> Self {
        Self {
            login,
            session: None,
        }
    }

    /// Create a key set from a local key.
    pub fn from_local_key(local_key: &LocalKey) -> Self {
        Self::new(local_key.login_key())
    }

    /// Install the session key.
    pub fn set_session(&mut self, key: SymmetricKey) {
        self.session = Some(key);
    }

    /// Forget the session key (on disconnect).
    pub fn clear_session(&mut self) {
        self.session = None;
    }

    /// Check if a session key is installed.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Get the key for a security flag.
    ///
    /// Fails with [`ProtocolError::Format`] when a session frame arrives
    /// before the session key exists.
    pub fn key(&self, flag: SecurityFlag) -> Result<&SymmetricKey, ProtocolError> {
        match flag {
            SecurityFlag::Login => Ok(&self.login),
            SecurityFlag::Session => self.session.as_ref().ok_or(ProtocolError::Format),
        }
    }
}
