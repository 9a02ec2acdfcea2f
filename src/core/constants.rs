//! Protocol constants for the Gimdow BLE lock protocol.
//!
//! Wire values in this module are fixed by the device firmware and MUST NOT
//! be changed. Timing values are defaults; most of them can be overridden
//! through [`DeviceConfig`](crate::device::DeviceConfig).

use std::time::Duration;

// =============================================================================
// GATT IDENTIFIERS
// =============================================================================

/// Service UUID carried in the advertisement service data.
pub const SERVICE_UUID: &str = "0000a201-0000-1000-8000-00805f9b34fb";

/// Characteristic the host subscribes to for inbound chunks.
pub const CHARACTERISTIC_NOTIFY: &str = "00002b10-0000-1000-8000-00805f9b34fb";

/// Characteristic the host writes outbound chunks to.
pub const CHARACTERISTIC_WRITE: &str = "00002b11-0000-1000-8000-00805f9b34fb";

/// Manufacturer id of the advertisement manufacturer data.
pub const MANUFACTURER_DATA_ID: u16 = 0x07D0;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Plain frame header size (seq + response_to + opcode + length).
pub const FRAME_HEADER_SIZE: usize = 12;

/// CRC-16 trailer size.
pub const CRC_SIZE: usize = 2;

/// AES block size; plain frames are zero-padded to a multiple of it.
pub const BLOCK_SIZE: usize = 16;

/// CBC initialisation vector size.
pub const IV_SIZE: usize = 16;

/// Security flag + IV prefix in front of the ciphertext.
pub const ENVELOPE_PREFIX_SIZE: usize = 1 + IV_SIZE;

/// Maximum number of bytes in a chunk index / length varint.
pub const MAX_VARINT_SIZE: usize = 4;

/// Default transport MTU (bytes per written chunk).
pub const DEFAULT_MTU: usize = 20;

/// Smallest MTU accepted by the fragmenter: index, length, version and one
/// data byte must fit in chunk 0.
pub const MIN_MTU: usize = 8;

/// Default protocol version advertised in chunk 0.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 2;

/// Protocol versions that use the v2/v3 datapoint framing.
pub const SUPPORTED_PROTOCOL_VERSIONS: [u8; 2] = [2, 3];

// =============================================================================
// SECURITY FLAGS
// =============================================================================

/// Frame encrypted with the login key (device-info exchange only).
pub const SECURITY_FLAG_LOGIN: u8 = 0x04;

/// Frame encrypted with the session key.
pub const SECURITY_FLAG_SESSION: u8 = 0x05;

// =============================================================================
// OPCODES
// =============================================================================

/// Device information request / response.
pub const OP_DEVICE_INFO: u16 = 0x0000;

/// Pairing request / response.
pub const OP_PAIR: u16 = 0x0001;

/// Datapoint batch sent by the host.
pub const OP_DATAPOINT_SET: u16 = 0x0002;

/// Device status poll.
pub const OP_DEVICE_STATUS: u16 = 0x0003;

/// Datapoint report from the device.
pub const OP_DATAPOINT_REPORT: u16 = 0x8001;

/// Timestamped datapoint report.
pub const OP_TIMESTAMPED_DATAPOINT_REPORT: u16 = 0x8003;

/// Signed datapoint report (device sequence + flags prefix).
pub const OP_SIGNED_DATAPOINT_REPORT: u16 = 0x8004;

/// Signed and timestamped datapoint report.
pub const OP_SIGNED_TIMESTAMPED_DATAPOINT_REPORT: u16 = 0x8005;

/// Time request answered with epoch milliseconds.
pub const OP_TIME_REQUEST_1: u16 = 0x8011;

/// Time request answered with packed calendar fields.
pub const OP_TIME_REQUEST_2: u16 = 0x8012;

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Number of pairing-secret bytes used as the local key.
pub const LOCAL_KEY_SIZE: usize = 6;

/// Minimum device-info response payload.
pub const DEVICE_INFO_MIN_SIZE: usize = 46;

/// Fixed pairing request payload size.
pub const PAIRING_REQUEST_SIZE: usize = 44;

/// Device random bytes mixed into the session key.
pub const DEVICE_RANDOM_SIZE: usize = 6;

/// Auth key returned in the device-info response.
pub const AUTH_KEY_SIZE: usize = 32;

/// Pairing result: paired.
pub const PAIR_RESULT_OK: u8 = 0x00;

/// Pairing result: device already paired (treated as success).
pub const PAIR_RESULT_ALREADY_PAIRED: u8 = 0x02;

// =============================================================================
// TIMING
// =============================================================================

/// How long an awaited request waits for its response.
pub const RESPONSE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed backoff before retrying after a bus error or a failed reconnect.
pub const BACKOFF_TIME: Duration = Duration::from_millis(250);

/// How long the lock sequencer waits for a command echo.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the lock sequencer waits for the "unlocked" state report.
pub const UNLOCK_CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// Mechanical settle delay after the second unlock.
pub const SETTLE_DELAY: Duration = Duration::from_secs(10);

/// How long the lock sequencer waits for the "locked" state report.
pub const LOCK_CONFIRM_TIMEOUT: Duration = Duration::from_secs(75);

// =============================================================================
// TIME SYNC
// =============================================================================

/// Digits in the ASCII millisecond timestamp.
pub const EPOCH_MILLIS_DIGITS: usize = 13;

/// Seconds per timezone unit on the wire (hundredths of an hour).
pub const TIMEZONE_UNIT_SECONDS: i32 = 36;
