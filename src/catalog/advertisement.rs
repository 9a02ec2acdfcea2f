//! Advertisement decoding.
//!
//! Service data starting with 0 carries the product id. Manufacturer data
//! carries the bound flag, the protocol version and the device UUID,
//! encrypted with AES-128-CBC where key and IV are both `MD5(product_id)`.

use std::collections::HashMap;

use crate::core::{IV_SIZE, MANUFACTURER_DATA_ID, ProtocolError, SERVICE_UUID};
use crate::crypto::{SymmetricKey, decrypt};

/// Service data type byte announcing the product id.
const SERVICE_DATA_PRODUCT_ID: u8 = 0;

/// Manufacturer data offset of the encrypted UUID.
const UUID_OFFSET: usize = 6;

/// Identity advertised by an unconnected device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Raw product id from the service data.
    pub product_id: Option<Vec<u8>>,
    /// Whether the device is bound to an account.
    pub bound: Option<bool>,
    /// Advertised protocol version.
    pub protocol_version: Option<u8>,
    /// Decrypted device UUID; needs both the product id and the
    /// manufacturer data.
    pub uuid: Option<String>,
}

impl Advertisement {
    /// Decode an advertisement from the service data and manufacturer data
    /// maps reported by a scanner.
    ///
    /// Picks the entries for [`SERVICE_UUID`] (compared case-insensitively)
    /// and [`MANUFACTURER_DATA_ID`].
    pub fn from_scan(
        service_data: &HashMap<String, Vec<u8>>,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
    ) -> Result<Self, ProtocolError> {
        let service = service_data
            .iter()
            .find(|(uuid, _)| uuid.eq_ignore_ascii_case(SERVICE_UUID))
            .map(|(_, data)| data.as_slice());
        let manufacturer = manufacturer_data
            .get(&MANUFACTURER_DATA_ID)
            .map(Vec::as_slice);
        Self::decode(service, manufacturer)
    }

    /// Decode the service data of [`SERVICE_UUID`] and the manufacturer data
    /// of [`MANUFACTURER_DATA_ID`].
    ///
    /// Fields that are absent or too short are left empty. A UUID that fails
    /// to decrypt is an error.
    pub fn decode(
        service_data: Option<&[u8]>,
        manufacturer_data: Option<&[u8]>,
    ) -> Result<Self, ProtocolError> {
        let mut adv = Self::default();

        if let Some(data) =
            service_data.filter(|d| d.len() > 1 && d[0] == SERVICE_DATA_PRODUCT_ID)
        {
            adv.product_id = Some(data[1..].to_vec());
        }

        if let Some(data) = manufacturer_data.filter(|d| d.len() > UUID_OFFSET) {
            adv.bound = Some(data[0] & 0x80 != 0);
            adv.protocol_version = Some(data[1]);
            if let Some(product_id) = &adv.product_id {
                adv.uuid = Some(decrypt_uuid(product_id, &data[UUID_OFFSET..])?);
            }
        }

        Ok(adv)
    }
}

/// Decrypt an advertised UUID.
pub fn decrypt_uuid(product_id: &[u8], encrypted: &[u8]) -> Result<String, ProtocolError> {
    let key = SymmetricKey::md5_of(product_id);
    let iv: [u8; IV_SIZE] = *key.as_bytes();
    let plain = decrypt(&key, &iv, encrypted)?;
    String::from_utf8(plain).map_err(|_| ProtocolError::Format)
}
