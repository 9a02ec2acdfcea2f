//! Gimdow BLE protocol - Security layer
//!
//! - [`keys`]: local, login and session key derivation
//! - [`cipher`]: AES-128-CBC envelope encryption
//! - [`crc`]: CRC-16 frame trailer

pub mod cipher;
pub mod crc;
pub mod keys;

pub use cipher::{decrypt, encrypt, random_iv};
pub use crc::crc16;
pub use keys::{KEY_SIZE, KeySet, LocalKey, SecurityFlag, SymmetricKey};
