//! Frame encoding and decoding.
//!
//! Plain frame (big-endian):
//! ```text
//! +--------+-------------+--------+--------+---------+--------+---------+
//! | seq    | response_to | opcode | length | payload | CRC-16 | 0-pad   |
//! | 4B     | 4B          | 2B     | 2B     | length  | 2B     | to 16   |
//! +--------+-------------+--------+--------+---------+--------+---------+
//! ```
//!
//! The padded plain frame is encrypted with AES-128-CBC and wrapped as
//! `flag || IV || ciphertext`, where the flag selects the login or the
//! session key.

use crate::core::{
    BLOCK_SIZE, CRC_SIZE, ENVELOPE_PREFIX_SIZE, FRAME_HEADER_SIZE, IV_SIZE, OP_DATAPOINT_REPORT,
    OP_DATAPOINT_SET, OP_DEVICE_INFO, OP_DEVICE_STATUS, OP_PAIR, OP_SIGNED_DATAPOINT_REPORT,
    OP_SIGNED_TIMESTAMPED_DATAPOINT_REPORT, OP_TIME_REQUEST_1, OP_TIME_REQUEST_2,
    OP_TIMESTAMPED_DATAPOINT_REPORT, ProtocolError,
};
use crate::crypto::{KeySet, SecurityFlag, crc16, decrypt, encrypt};

/// Message codes known to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Device information exchange (login key).
    DeviceInfo = OP_DEVICE_INFO,
    /// Pairing.
    Pair = OP_PAIR,
    /// Datapoint batch from the host.
    DatapointSet = OP_DATAPOINT_SET,
    /// Status poll.
    DeviceStatus = OP_DEVICE_STATUS,
    /// Datapoint report.
    DatapointReport = OP_DATAPOINT_REPORT,
    /// Datapoint report with a timestamp prefix.
    TimestampedDatapointReport = OP_TIMESTAMPED_DATAPOINT_REPORT,
    /// Datapoint report with a device sequence prefix.
    SignedDatapointReport = OP_SIGNED_DATAPOINT_REPORT,
    /// Datapoint report with device sequence and timestamp prefixes.
    SignedTimestampedDatapointReport = OP_SIGNED_TIMESTAMPED_DATAPOINT_REPORT,
    /// Time request, answered with epoch milliseconds.
    TimeRequest1 = OP_TIME_REQUEST_1,
    /// Time request, answered with calendar fields.
    TimeRequest2 = OP_TIME_REQUEST_2,
}

impl Opcode {
    /// Parse an opcode.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            OP_DEVICE_INFO => Some(Self::DeviceInfo),
            OP_PAIR => Some(Self::Pair),
            OP_DATAPOINT_SET => Some(Self::DatapointSet),
            OP_DEVICE_STATUS => Some(Self::DeviceStatus),
            OP_DATAPOINT_REPORT => Some(Self::DatapointReport),
            OP_TIMESTAMPED_DATAPOINT_REPORT => Some(Self::TimestampedDatapointReport),
            OP_SIGNED_DATAPOINT_REPORT => Some(Self::SignedDatapointReport),
            OP_SIGNED_TIMESTAMPED_DATAPOINT_REPORT => Some(Self::SignedTimestampedDatapointReport),
            OP_TIME_REQUEST_1 => Some(Self::TimeRequest1),
            OP_TIME_REQUEST_2 => Some(Self::TimeRequest2),
            _ => None,
        }
    }

    /// Get the wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Key used to encrypt frames with this opcode.
    pub fn security_flag(self) -> SecurityFlag {
        match self {
            Self::DeviceInfo => SecurityFlag::Login,
            _ => SecurityFlag::Session,
        }
    }
}

/// Plain frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sender sequence number.
    pub seq: u32,
    /// Sequence number this frame answers, 0 if none.
    pub response_to: u32,
    /// Raw opcode.
    pub code: u16,
    /// Payload length.
    pub length: u16,
}

impl FrameHeader {
    /// Serialize the header.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.response_to.to_be_bytes());
        buf[8..10].copy_from_slice(&self.code.to_be_bytes());
        buf[10..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse a header from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Length);
        }
        Ok(Self {
            seq: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            response_to: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            code: u16::from_be_bytes([data[8], data[9]]),
            length: u16::from_be_bytes([data[10], data[11]]),
        })
    }
}

/// A decrypted and verified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender sequence number.
    pub seq: u32,
    /// Sequence number this frame answers, 0 if none.
    pub response_to: u32,
    /// Raw opcode; may be unknown.
    pub code: u16,
    /// Payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// The opcode, if known.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u16(self.code)
    }
}

/// Build the encrypted blob of one frame.
///
/// The IV is passed in so that tests can make the output deterministic; the
/// send path uses [`random_iv`](crate::crypto::random_iv).
pub fn encode_frame(
    keys: &KeySet,
    seq: u32,
    opcode: Opcode,
    payload: &[u8],
    response_to: u32,
    iv: &[u8; IV_SIZE],
) -> Result<Vec<u8>, ProtocolError> {
    let length = u16::try_from(payload.len()).map_err(|_| ProtocolError::Length)?;
    let flag = opcode.security_flag();
    let key = keys.key(flag)?;

    let header = FrameHeader {
        seq,
        response_to,
        code: opcode.as_u16(),
        length,
    };

    let mut raw = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + CRC_SIZE + BLOCK_SIZE);
    raw.extend_from_slice(&header.to_bytes());
    raw.extend_from_slice(payload);
    let crc = crc16(&raw);
    raw.extend_from_slice(&crc.to_be_bytes());
    let padded = raw.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    raw.resize(padded, 0);

    let ciphertext = encrypt(key, iv, &raw)?;

    let mut blob = Vec::with_capacity(ENVELOPE_PREFIX_SIZE + ciphertext.len());
    blob.push(flag.as_byte());
    blob.extend_from_slice(iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt and verify a reassembled blob.
///
/// Unknown opcodes are not an error here; the caller decides what to do with
/// [`Frame::opcode`] returning `None`.
pub fn decode_frame(keys: &KeySet, blob: &[u8]) -> Result<Frame, ProtocolError> {
    let (&flag_byte, rest) = blob.split_first().ok_or(ProtocolError::Format)?;
    let flag = SecurityFlag::from_byte(flag_byte).ok_or(ProtocolError::Format)?;
    let key = keys.key(flag)?;

    if rest.len() < IV_SIZE {
        return Err(ProtocolError::Format);
    }
    let (iv, ciphertext) = rest.split_at(IV_SIZE);
    let iv: &[u8; IV_SIZE] = iv.try_into().map_err(|_| ProtocolError::Format)?;
    let raw = decrypt(key, iv, ciphertext)?;

    let header = FrameHeader::from_bytes(&raw)?;
    let data_end = FRAME_HEADER_SIZE + usize::from(header.length);
    if raw.len() < data_end {
        return Err(ProtocolError::Length);
    }
    if raw.len() > data_end {
        let trailer = raw
            .get(data_end..data_end + CRC_SIZE)
            .ok_or(ProtocolError::Length)?;
        let expected = u16::from_be_bytes([trailer[0], trailer[1]]);
        if crc16(&raw[..data_end]) != expected {
            return Err(ProtocolError::Crc);
        }
    }

    Ok(Frame {
        seq: header.seq,
        response_to: header.response_to,
        code: header.code,
        payload: raw[FRAME_HEADER_SIZE..data_end].to_vec(),
    })
}
