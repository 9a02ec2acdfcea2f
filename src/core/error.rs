//! Error types for the Gimdow BLE protocol.

use thiserror::Error;

use crate::datapoint::DatapointType;

/// Errors raised while decoding frames and message payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Malformed frame or payload structure.
    #[error("incoming packet is formatted in wrong way")]
    Format,

    /// Truncated or short payload.
    #[error("incoming packet has invalid length")]
    Length,

    /// CRC-16 trailer does not match header and payload.
    #[error("incoming packet has invalid CRC")]
    Crc,

    /// The device answered a request with a non-zero result code.
    #[error("device returned error code {0}")]
    Device(u8),
}

/// Errors raised by the datapoint value model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatapointError {
    /// A negative value was assigned to an enum datapoint.
    #[error("value of enum datapoint must be unsigned, got {0}")]
    EnumValue(i64),

    /// The value cannot be coerced into the datapoint's type.
    #[error("cannot store {found} value in {expected} datapoint")]
    TypeMismatch {
        /// Declared datapoint type.
        expected: DatapointType,
        /// Type of the offered value.
        found: DatapointType,
    },

    /// No datapoint with this id exists.
    #[error("unknown datapoint {0}")]
    Unknown(u8),

    /// The device schema has no function with this code.
    #[error("unknown function code {0:?}")]
    UnknownCode(String),

    /// The label is not in the enum range of the function.
    #[error("{label:?} is not a value of {code:?}")]
    InvalidLabel {
        /// Function code.
        code: String,
        /// Offered label.
        label: String,
    },
}

/// Errors reported by the link layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Device not found, out of range or poor signal.
    #[error("device not found: {0}")]
    NotFound(String),

    /// Generic bus / stack failure.
    #[error("bus error: {0}")]
    Bus(String),

    /// No link is established.
    #[error("not connected")]
    NotConnected,
}

impl TransportError {
    /// Check if a write failing with this error may be retried after a backoff.
    ///
    /// A device that is out of range is never retried blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Bus(_) | TransportError::NotConnected)
    }
}

/// Top-level errors.
#[derive(Debug, Error)]
pub enum GimdowError {
    /// Frame or payload error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Datapoint value error.
    #[error("datapoint error: {0}")]
    Datapoint(#[from] DatapointError),

    /// Link layer error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A handshake step received no response in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// No established and paired session.
    #[error("device not connected")]
    NotConnected,

    /// No credentials are known for this device.
    #[error("no credentials for device {0}")]
    MissingCredentials(String),

    /// The device speaks a datapoint framing this crate does not implement.
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u8),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl GimdowError {
    /// Check if this error belongs to the transport class.
    pub fn is_transport(&self) -> bool {
        matches!(self, GimdowError::Transport(_))
    }

    /// Check if a reconnect loop should keep trying after this error.
    ///
    /// Transport failures and handshake timeouts are retried; a device that
    /// rejects pairing or sends malformed data is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GimdowError::Transport(_) | GimdowError::Timeout(_) | GimdowError::NotConnected
        )
    }

    /// The device result code, if this is a device rejection.
    pub fn device_code(&self) -> Option<u8> {
        match self {
            GimdowError::Protocol(ProtocolError::Device(code)) => Some(*code),
            _ => None,
        }
    }
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, GimdowError>;
