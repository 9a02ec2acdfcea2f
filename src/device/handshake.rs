//! Device-info and pairing messages.
//!
//! ```text
//! host                                   lock
//!   |-- DEVICE_INFO (login key) ----------->|
//!   |<---------- versions, random, auth key-|   session key = MD5(local || random)
//!   |-- PAIR uuid|local_key|device_id ----->|
//!   |<------------------------ result byte -|   0 or 2 = paired
//! ```

use crate::core::{
    AUTH_KEY_SIZE, DEVICE_INFO_MIN_SIZE, DEVICE_RANDOM_SIZE, PAIR_RESULT_ALREADY_PAIRED,
    PAIR_RESULT_OK, PAIRING_REQUEST_SIZE, ProtocolError,
};
use crate::crypto::LocalKey;

/// Device information returned by the DEVICE_INFO exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Firmware version, `major.minor`.
    pub device_version: String,
    /// Protocol version, `major.minor`.
    pub protocol_version_str: String,
    /// Hardware version, `major.minor`.
    pub hardware_version: String,
    /// Protocol major version; selects the datapoint framing.
    pub protocol_version: u8,
    /// Device flags.
    pub flags: u8,
    /// Whether the device is bound to an account.
    pub bound: bool,
    /// Device random mixed into the session key.
    pub device_random: [u8; DEVICE_RANDOM_SIZE],
    /// Opaque auth key.
    pub auth_key: [u8; AUTH_KEY_SIZE],
}

impl DeviceInfo {
    /// Parse a DEVICE_INFO response payload.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < DEVICE_INFO_MIN_SIZE {
            return Err(ProtocolError::Length);
        }

        let mut device_random = [0u8; DEVICE_RANDOM_SIZE];
        device_random.copy_from_slice(&data[6..12]);
        let mut auth_key = [0u8; AUTH_KEY_SIZE];
        auth_key.copy_from_slice(&data[14..46]);

        Ok(Self {
            device_version: format!("{}.{}", data[0], data[1]),
            protocol_version_str: format!("{}.{}", data[2], data[3]),
            hardware_version: format!("{}.{}", data[12], data[13]),
            protocol_version: data[2],
            flags: data[4],
            bound: data[5] != 0,
            device_random,
            auth_key,
        })
    }
}

impl std::fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInfo")
            .field("device_version", &self.device_version)
            .field("protocol_version", &self.protocol_version_str)
            .field("hardware_version", &self.hardware_version)
            .field("flags", &self.flags)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

/// Build the PAIR request payload.
///
/// `uuid || local_key || device_id`, zero-padded or truncated to 44 bytes.
pub fn pairing_request(uuid: &str, local_key: &LocalKey, device_id: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAIRING_REQUEST_SIZE);
    payload.extend_from_slice(uuid.as_bytes());
    payload.extend_from_slice(local_key.as_bytes());
    payload.extend_from_slice(device_id.as_bytes());
    payload.resize(PAIRING_REQUEST_SIZE, 0);
    payload
}

/// Parse a PAIR response into a result code, mapping "already paired" to
/// success.
pub fn parse_pair_result(data: &[u8]) -> Result<u8, ProtocolError> {
    match single_byte(data)? {
        PAIR_RESULT_ALREADY_PAIRED => {
            tracing::debug!("device is already paired");
            Ok(PAIR_RESULT_OK)
        }
        code => Ok(code),
    }
}

/// Parse a one-byte result payload (DEVICE_STATUS).
pub fn single_byte(data: &[u8]) -> Result<u8, ProtocolError> {
    match data {
        [code] => Ok(*code),
        _ => Err(ProtocolError::Length),
    }
}
