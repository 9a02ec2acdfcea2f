//! Datapoint store with batched local updates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::message::DatapointRecord;
use super::value::{DatapointType, DatapointValue};
use crate::core::DatapointError;

/// One device datapoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datapoint {
    id: u8,
    value: DatapointValue,
    timestamp: DateTime<Utc>,
    flags: u8,
    changed_by_device: bool,
}

impl Datapoint {
    fn new(id: u8, value: DatapointValue, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            value,
            timestamp,
            flags: 0,
            changed_by_device: false,
        }
    }

    /// Datapoint id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Datapoint type.
    pub fn datapoint_type(&self) -> DatapointType {
        self.value.value_type()
    }

    /// Current value.
    pub fn value(&self) -> &DatapointValue {
        &self.value
    }

    /// Time of the last update.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Flags of the last report.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Check if the last update came from the device.
    pub fn changed_by_device(&self) -> bool {
        self.changed_by_device
    }
}

/// What the caller must do after a local set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// No update scope is open; send the datapoint now.
    SendNow,
    /// An update scope is open; the id was queued.
    Deferred,
}

/// All datapoints of one device.
#[derive(Debug, Default)]
pub struct DatapointStore {
    datapoints: BTreeMap<u8, Datapoint>,
    pending: Vec<u8>,
    update_depth: u32,
}

impl DatapointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a datapoint.
    pub fn get(&self, id: u8) -> Option<&Datapoint> {
        self.datapoints.get(&id)
    }

    /// Check if a datapoint exists, optionally with a given type.
    pub fn has(&self, id: u8, ty: Option<DatapointType>) -> bool {
        self.datapoints
            .get(&id)
            .is_some_and(|dp| ty.is_none_or(|ty| dp.datapoint_type() == ty))
    }

    /// Get a datapoint, creating it with `default` coerced to `ty` if missing.
    ///
    /// An existing datapoint is returned as-is, even if its type differs.
    pub fn get_or_create(
        &mut self,
        id: u8,
        ty: DatapointType,
        default: Option<DatapointValue>,
    ) -> Result<&Datapoint, DatapointError> {
        if !self.datapoints.contains_key(&id) {
            let value = match default {
                Some(value) => value.coerce(ty)?,
                None => ty.default_value(),
            };
            self.datapoints
                .insert(id, Datapoint::new(id, value, Utc::now()));
        }
        self.datapoints.get(&id).ok_or(DatapointError::Unknown(id))
    }

    /// Set a datapoint from the host side.
    pub fn set_value(
        &mut self,
        id: u8,
        value: DatapointValue,
    ) -> Result<SetOutcome, DatapointError> {
        let dp = self
            .datapoints
            .get_mut(&id)
            .ok_or(DatapointError::Unknown(id))?;
        dp.value = value.coerce(dp.value.value_type())?;
        dp.changed_by_device = false;

        if self.update_depth > 0 {
            self.pending.retain(|&pending| pending != id);
            self.pending.push(id);
            Ok(SetOutcome::Deferred)
        } else {
            Ok(SetOutcome::SendNow)
        }
    }

    /// Open an update scope.
    pub fn begin_update(&mut self) {
        self.update_depth += 1;
    }

    /// Close an update scope.
    ///
    /// Returns the ids to send as one batch when the outermost scope closes,
    /// in the order they were last set.
    pub fn end_update(&mut self) -> Vec<u8> {
        if self.update_depth == 0 {
            return Vec::new();
        }
        self.update_depth -= 1;
        if self.update_depth == 0 {
            std::mem::take(&mut self.pending)
        } else {
            Vec::new()
        }
    }

    /// Number of open update scopes.
    pub fn update_depth(&self) -> u32 {
        self.update_depth
    }

    /// Apply reported records.
    ///
    /// The reported type replaces the stored one. Returns snapshots of the
    /// updated datapoints in report order.
    pub fn apply_report(
        &mut self,
        records: Vec<DatapointRecord>,
        timestamp: DateTime<Utc>,
        flags: u8,
    ) -> Vec<Datapoint> {
        records
            .into_iter()
            .map(|record| {
                let dp = self
                    .datapoints
                    .entry(record.id)
                    .or_insert_with(|| Datapoint::new(record.id, record.value.clone(), timestamp));
                dp.value = record.value;
                dp.timestamp = timestamp;
                dp.flags = flags;
                dp.changed_by_device = true;
                dp.clone()
            })
            .collect()
    }

    /// Values of the given ids, in order, for a datapoint batch.
    pub fn batch(&self, ids: &[u8]) -> Result<Vec<(u8, &DatapointValue)>, DatapointError> {
        ids.iter()
            .map(|&id| {
                self.datapoints
                    .get(&id)
                    .map(|dp| (id, &dp.value))
                    .ok_or(DatapointError::Unknown(id))
            })
            .collect()
    }

    /// Iterate over all datapoints by id.
    pub fn iter(&self) -> impl Iterator<Item = &Datapoint> {
        self.datapoints.values()
    }

    /// Number of datapoints.
    pub fn len(&self) -> usize {
        self.datapoints.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }
}
