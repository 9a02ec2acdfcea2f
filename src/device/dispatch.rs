//! Interpretation of inbound frames and time replies.

use chrono::{DateTime, Datelike, FixedOffset, Local, Offset, TimeZone, Timelike, Utc};

use super::handshake::{DeviceInfo, parse_pair_result, single_byte};
use crate::core::{ProtocolError, TIMEZONE_UNIT_SECONDS};
use crate::datapoint::{DatapointReport, ReportKind};
use crate::transport::Opcode;

/// Which time format a device asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    /// 13 ASCII digits of epoch milliseconds.
    EpochMillis,
    /// Year, month, day, hour, minute, second and weekday bytes.
    Calendar,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Response to DEVICE_INFO.
    DeviceInfo(DeviceInfo),
    /// Response to PAIR, with "already paired" mapped to 0.
    PairResult(u8),
    /// Response to DEVICE_STATUS.
    StatusResult(u8),
    /// Response to DATAPOINT_SET.
    DatapointAck,
    /// The device asks for the current time.
    TimeRequest(TimeFormat),
    /// Datapoint report.
    Report(DatapointReport),
}

impl Inbound {
    /// Decode the payload of a frame carrying `opcode`.
    pub fn interpret(
        opcode: Opcode,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Self, ProtocolError> {
        if let Some(kind) = ReportKind::from_opcode(opcode) {
            return DatapointReport::parse(kind, payload, received_at).map(Self::Report);
        }
        match opcode {
            Opcode::DeviceInfo => DeviceInfo::parse(payload).map(Self::DeviceInfo),
            Opcode::Pair => parse_pair_result(payload).map(Self::PairResult),
            Opcode::DeviceStatus => single_byte(payload).map(Self::StatusResult),
            Opcode::DatapointSet => Ok(Self::DatapointAck),
            Opcode::TimeRequest1 => time_request(payload, TimeFormat::EpochMillis),
            Opcode::TimeRequest2 => time_request(payload, TimeFormat::Calendar),
            _ => Err(ProtocolError::Format),
        }
    }

    /// Result code completing a waiter for this frame.
    pub fn result_code(&self) -> u8 {
        match self {
            Self::PairResult(code) | Self::StatusResult(code) => *code,
            _ => 0,
        }
    }
}

fn time_request(payload: &[u8], format: TimeFormat) -> Result<Inbound, ProtocolError> {
    if !payload.is_empty() {
        return Err(ProtocolError::Length);
    }
    Ok(Inbound::TimeRequest(format))
}

/// Build the reply to a time request.
///
/// The date fields come from `now`; the timezone field carries `zone`,
/// which the device expects to be the standard offset without daylight
/// saving.
pub fn time_reply(format: TimeFormat, now: DateTime<FixedOffset>, zone: FixedOffset) -> Vec<u8> {
    let mut reply = match format {
        TimeFormat::EpochMillis => format!("{:013}", now.timestamp_millis()).into_bytes(),
        TimeFormat::Calendar => vec![
            (now.year().rem_euclid(100)) as u8,
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
            now.weekday().num_days_from_monday() as u8,
        ],
    };
    reply.extend_from_slice(&timezone_units(&zone).to_be_bytes());
    reply
}

/// Reply to a time request with the host's local time.
pub fn local_time_reply(format: TimeFormat) -> Vec<u8> {
    let now = Local::now();
    let zone = standard_offset(&Local, now.year()).unwrap_or_else(|| now.offset().fix());
    time_reply(format, now.fixed_offset(), zone)
}

/// Offset of `tz` in `year` without daylight saving: the smaller of the
/// January and July offsets.
pub fn standard_offset<Tz: TimeZone>(tz: &Tz, year: i32) -> Option<FixedOffset> {
    [1, 7]
        .into_iter()
        .filter_map(|month| tz.with_ymd_and_hms(year, month, 1, 12, 0, 0).earliest())
        .map(|at| at.offset().fix())
        .min_by_key(FixedOffset::local_minus_utc)
}

/// UTC offset in 36-second units, east positive.
fn timezone_units(offset: &FixedOffset) -> i16 {
    (offset.local_minus_utc() / TIMEZONE_UNIT_SECONDS) as i16
}
