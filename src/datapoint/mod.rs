//! Gimdow BLE protocol - Datapoint model
//!
//! Devices expose their state as numbered, typed datapoints:
//!
//! - [`value`]: the six datapoint types and their wire encoding
//! - [`store`]: per-device store with batched local updates
//! - [`message`]: report parsing and batch encoding

pub mod message;
pub mod store;
pub mod value;

pub use message::{DatapointRecord, DatapointReport, ReportKind, encode_records};
pub use store::{Datapoint, DatapointStore, SetOutcome};
pub use value::{DatapointType, DatapointValue};
