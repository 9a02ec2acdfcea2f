//! Datapoint report parsing and batch encoding.
//!
//! A record is `id | type | length | value`. Reports carry a sequence of
//! records, optionally behind a device sequence + flags prefix (signed
//! reports) and a timestamp prefix (timestamped reports).

use chrono::{DateTime, Utc};

use super::value::{DatapointType, DatapointValue};
use crate::core::{EPOCH_MILLIS_DIGITS, ProtocolError};
use crate::transport::Opcode;

/// Bytes in front of each record value.
const RECORD_HEADER_SIZE: usize = 3;

/// A record is only read while at least this many bytes remain.
const RECORD_MIN_REMAINING: usize = RECORD_HEADER_SIZE + 1;

/// Bytes of the signed report prefix (u16 sequence + flags).
const SIGNED_PREFIX_SIZE: usize = 3;

/// One `id | type | value` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointRecord {
    /// Datapoint id.
    pub id: u8,
    /// Reported value; its type is the reported type.
    pub value: DatapointValue,
}

/// Report flavour, selected by opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Records only.
    Plain,
    /// Timestamp prefix.
    Timestamped,
    /// Sequence + flags prefix.
    Signed,
    /// Sequence + flags prefix, then timestamp prefix.
    SignedTimestamped,
}

impl ReportKind {
    /// Report kind carried by an opcode, if any.
    pub fn from_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::DatapointReport => Some(Self::Plain),
            Opcode::TimestampedDatapointReport => Some(Self::Timestamped),
            Opcode::SignedDatapointReport => Some(Self::Signed),
            Opcode::SignedTimestampedDatapointReport => Some(Self::SignedTimestamped),
            _ => None,
        }
    }

    fn is_signed(self) -> bool {
        matches!(self, Self::Signed | Self::SignedTimestamped)
    }

    fn is_timestamped(self) -> bool {
        matches!(self, Self::Timestamped | Self::SignedTimestamped)
    }
}

/// A parsed datapoint report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatapointReport {
    /// Report flavour.
    pub kind: ReportKind,
    /// Device sequence number of signed reports.
    pub device_seq: Option<u16>,
    /// Report flags (0 for unsigned reports).
    pub flags: u8,
    /// Timestamp applied to every record.
    pub timestamp: DateTime<Utc>,
    /// Records in report order.
    pub records: Vec<DatapointRecord>,
}

impl DatapointReport {
    /// Parse a report payload.
    ///
    /// Reports without a timestamp prefix are stamped with `received_at`.
    pub fn parse(
        kind: ReportKind,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let mut device_seq = None;
        let mut flags = 0;

        if kind.is_signed() {
            if payload.len() < SIGNED_PREFIX_SIZE {
                return Err(ProtocolError::Length);
            }
            device_seq = Some(u16::from_be_bytes([payload[0], payload[1]]));
            flags = payload[2];
            pos = SIGNED_PREFIX_SIZE;
        }

        let mut timestamp = received_at;
        if kind.is_timestamped() {
            let (parsed, next) = parse_timestamp(payload, pos)?;
            timestamp = parsed;
            pos = next;
        }

        Ok(Self {
            kind,
            device_seq,
            flags,
            timestamp,
            records: parse_records(payload, pos)?,
        })
    }

    /// Payload of the acknowledgement the device expects.
    ///
    /// Signed reports echo `seq | flags | 0`; the others are acknowledged
    /// with an empty payload.
    pub fn ack_payload(&self) -> Vec<u8> {
        match self.device_seq {
            Some(seq) => {
                let mut ack = seq.to_be_bytes().to_vec();
                ack.push(self.flags);
                ack.push(0);
                ack
            }
            None => Vec::new(),
        }
    }
}

/// Parse a timestamp prefix starting at `pos`.
///
/// Type 0 is 13 ASCII digits of epoch milliseconds, type 1 is a big-endian
/// u32 of epoch seconds.
pub fn parse_timestamp(data: &[u8], pos: usize) -> Result<(DateTime<Utc>, usize), ProtocolError> {
    let time_type = *data.get(pos).ok_or(ProtocolError::Length)?;
    let start = pos + 1;
    match time_type {
        0 => {
            let end = start + EPOCH_MILLIS_DIGITS;
            let digits = data.get(start..end).ok_or(ProtocolError::Length)?;
            let millis = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(ProtocolError::Format)?;
            let timestamp = DateTime::from_timestamp_millis(millis).ok_or(ProtocolError::Format)?;
            Ok((timestamp, end))
        }
        1 => {
            let end = start + 4;
            let bytes = data.get(start..end).ok_or(ProtocolError::Length)?;
            let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let timestamp =
                DateTime::from_timestamp(i64::from(secs), 0).ok_or(ProtocolError::Format)?;
            Ok((timestamp, end))
        }
        _ => Err(ProtocolError::Format),
    }
}

/// Parse records from `start` to the end of `data`.
///
/// Fewer than four trailing bytes are ignored.
pub fn parse_records(data: &[u8], start: usize) -> Result<Vec<DatapointRecord>, ProtocolError> {
    let mut records = Vec::new();
    let mut pos = start;
    while data.len().saturating_sub(pos) >= RECORD_MIN_REMAINING {
        let id = data[pos];
        let ty = DatapointType::from_u8(data[pos + 1]).ok_or(ProtocolError::Format)?;
        let len = usize::from(data[pos + 2]);
        pos += RECORD_HEADER_SIZE;

        let raw = data.get(pos..pos + len).ok_or(ProtocolError::Length)?;
        records.push(DatapointRecord {
            id,
            value: DatapointValue::decode(ty, raw)?,
        });
        pos += len;
    }
    Ok(records)
}

/// Encode records into a datapoint batch payload.
///
/// Fails with [`ProtocolError::Length`] when a value exceeds 255 bytes.
pub fn encode_records<'a, I>(records: I) -> Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = (u8, &'a DatapointValue)>,
{
    let mut out = Vec::new();
    for (id, value) in records {
        let encoded = value.encode();
        let len = u8::try_from(encoded.len()).map_err(|_| ProtocolError::Length)?;
        out.push(id);
        out.push(value.value_type().as_u8());
        out.push(len);
        out.extend_from_slice(&encoded);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    #[test]
    fn test_plain_report() {
        let payload = [
            0x2F, 0x01, 0x01, 0x01, // dp 47 bool true
            0x08, 0x02, 0x04, 0x00, 0x00, 0x00, 0x64, // dp 8 value 100
        ];
        let report = DatapointReport::parse(ReportKind::Plain, &payload, epoch()).unwrap();
        assert_eq!(report.timestamp, epoch());
        assert_eq!(report.device_seq, None);
        assert_eq!(
            report.records,
            vec![
                DatapointRecord {
                    id: 47,
                    value: DatapointValue::Bool(true)
                },
                DatapointRecord {
                    id: 8,
                    value: DatapointValue::Value(100)
                },
            ]
        );
        assert!(report.ack_payload().is_empty());
    }

    #[test]
    fn test_signed_report_ack() {
        let payload = [0x01, 0x02, 0x80, 0x06, 0x01, 0x01, 0x00];
        let report = DatapointReport::parse(ReportKind::Signed, &payload, epoch()).unwrap();
        assert_eq!(report.device_seq, Some(0x0102));
        assert_eq!(report.flags, 0x80);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].value, DatapointValue::Bool(false));
        assert_eq!(report.ack_payload(), vec![0x01, 0x02, 0x80, 0x00]);
    }

    #[test]
    fn test_signed_report_too_short() {
        assert_eq!(
            DatapointReport::parse(ReportKind::Signed, &[0x01, 0x02], epoch()),
            Err(ProtocolError::Length)
        );
    }

    #[test]
    fn test_millisecond_timestamp() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(b"1700000000123");
        payload.extend_from_slice(&[0x2F, 0x01, 0x01, 0x00]);

        let report = DatapointReport::parse(ReportKind::Timestamped, &payload, epoch()).unwrap();
        assert_eq!(report.timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(report.records[0].id, 47);
    }

    #[test]
    fn test_signed_timestamped_uses_parsed_time() {
        let mut payload = vec![0x00, 0x05, 0x00, 0x01];
        payload.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        payload.extend_from_slice(&[0x2F, 0x01, 0x01, 0x01]);

        let report =
            DatapointReport::parse(ReportKind::SignedTimestamped, &payload, epoch()).unwrap();
        assert_eq!(report.device_seq, Some(5));
        assert_eq!(report.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(report.records.len(), 1);
    }

    #[test]
    fn test_timestamp_errors() {
        assert_eq!(parse_timestamp(&[], 0), Err(ProtocolError::Length));
        assert_eq!(parse_timestamp(&[0x02, 0, 0, 0, 0], 0), Err(ProtocolError::Format));
        assert_eq!(parse_timestamp(&[0x01, 0, 0], 0), Err(ProtocolError::Length));
        assert_eq!(parse_timestamp(b"\x00170000000012", 0), Err(ProtocolError::Length));
        assert_eq!(parse_timestamp(b"\x00170000000012x", 0), Err(ProtocolError::Format));
    }

    #[test]
    fn test_record_errors() {
        // type 6 is unknown
        assert_eq!(parse_records(&[0x01, 0x06, 0x01, 0x00], 0), Err(ProtocolError::Format));
        // length runs past the payload
        assert_eq!(parse_records(&[0x01, 0x00, 0x04, 0xAA], 0), Err(ProtocolError::Length));
        // short tails ignored, even a bare record header
        assert_eq!(parse_records(&[0x01, 0x01], 0), Ok(vec![]));
        assert_eq!(parse_records(&[0x01, 0x00, 0x00], 0), Ok(vec![]));
    }

    #[test]
    fn test_empty_value_record_keeps_report() {
        let payload = [47, 1, 1, 1, 9, 2, 0, 8, 2, 1, 5];
        let report = DatapointReport::parse(ReportKind::Plain, &payload, epoch()).unwrap();
        assert_eq!(
            report.records,
            vec![
                DatapointRecord {
                    id: 47,
                    value: DatapointValue::Bool(true)
                },
                DatapointRecord {
                    id: 9,
                    value: DatapointValue::Value(0)
                },
                DatapointRecord {
                    id: 8,
                    value: DatapointValue::Value(5)
                },
            ]
        );
    }

    #[test]
    fn test_encode_batch() {
        let lock = DatapointValue::Bool(true);
        let mode = DatapointValue::Enum(2);
        let payload = encode_records([(46, &lock), (21, &mode)]).unwrap();
        assert_eq!(payload, vec![46, 1, 1, 1, 21, 4, 1, 2]);

        let parsed = parse_records(&payload, 0).unwrap();
        assert_eq!(parsed[0].value, lock);
        assert_eq!(parsed[1].value, mode);
    }

    #[test]
    fn test_encode_oversized_value() {
        let big = DatapointValue::Raw(vec![0; 256]);
        assert_eq!(encode_records([(1, &big)]), Err(ProtocolError::Length));
    }
}
