//! Device credentials and functional schema.
//!
//! Credentials come from the cloud account the lock was registered with:
//! identity, the pairing secret, and two lists describing which datapoint
//! carries which function ("function" for commands, "status range" for
//! reported state).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::crypto::LocalKey;
use crate::datapoint::DatapointType;

/// Datapoint type as declared by the cloud schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloudType {
    /// Boolean.
    Boolean,
    /// Integer with optional range metadata.
    Integer,
    /// Enum with a label range.
    Enum,
    /// String.
    String,
    /// JSON document carried as a string.
    Json,
    /// Raw bytes.
    Raw,
    /// Bit set.
    Bitmap,
}

impl CloudType {
    /// Datapoint type used on the wire for this cloud type.
    pub fn datapoint_type(self) -> DatapointType {
        match self {
            Self::Boolean => DatapointType::Bool,
            Self::Integer => DatapointType::Value,
            Self::Enum => DatapointType::Enum,
            Self::String | Self::Json => DatapointType::String,
            Self::Raw => DatapointType::Raw,
            Self::Bitmap => DatapointType::Bitmap,
        }
    }
}

/// Allowed values of a function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionValues {
    /// Enum labels, in index order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub range: Vec<String>,
    /// Integer minimum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    /// Integer maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    /// Decimal places of an integer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Integer step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    /// Unit label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl FunctionValues {
    /// Index of an enum label.
    pub fn enum_index(&self, label: &str) -> Option<u32> {
        self.range
            .iter()
            .position(|l| l == label)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Label of an enum index.
    pub fn enum_label(&self, index: u32) -> Option<&str> {
        self.range.get(index as usize).map(String::as_str)
    }
}

/// One schema entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFunction {
    /// Function code, e.g. `"manual_lock"`.
    pub code: String,
    /// Datapoint carrying the function.
    pub dp_id: u8,
    /// Declared cloud type.
    #[serde(rename = "type")]
    pub cloud_type: CloudType,
    /// Allowed values; the cloud may send them as a JSON string.
    #[serde(
        default,
        deserialize_with = "deserialize_values",
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<FunctionValues>,
}

impl DeviceFunction {
    /// Wire type of the function's datapoint.
    pub fn datapoint_type(&self) -> DatapointType {
        self.cloud_type.datapoint_type()
    }
}

fn deserialize_values<'de, D>(deserializer: D) -> Result<Option<FunctionValues>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Values {
        Encoded(String),
        Decoded(FunctionValues),
    }

    match Option::<Values>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Values::Decoded(values)) => Ok(Some(values)),
        Some(Values::Encoded(text)) if text.trim().is_empty() => Ok(None),
        Some(Values::Encoded(text)) => serde_json::from_str(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Everything needed to talk to one device.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    /// Device UUID, sent in the pairing request.
    pub uuid: String,
    /// Pairing secret; its first six bytes are the local key.
    pub local_key: String,
    /// Cloud device id, sent in the pairing request.
    pub device_id: String,
    /// Product category, e.g. `"jtmspro"`.
    pub category: String,
    /// Product id.
    pub product_id: String,
    /// User-assigned device name.
    pub device_name: String,
    /// Product model.
    #[serde(default)]
    pub product_model: String,
    /// Product name.
    #[serde(default)]
    pub product_name: String,
    /// Command schema.
    #[serde(default)]
    pub functions: Vec<DeviceFunction>,
    /// Reported state schema.
    #[serde(default)]
    pub status_range: Vec<DeviceFunction>,
}

impl DeviceCredentials {
    /// Parse credentials from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Local key derived from the pairing secret.
    pub fn local_key(&self) -> LocalKey {
        LocalKey::from_secret(&self.local_key)
    }

    /// Look up a command schema entry.
    pub fn function(&self, code: &str) -> Option<&DeviceFunction> {
        self.functions.iter().find(|f| f.code == code)
    }

    /// Look up a state schema entry.
    pub fn status(&self, code: &str) -> Option<&DeviceFunction> {
        self.status_range.iter().find(|f| f.code == code)
    }

    /// Find the schema entry of a code in both lists.
    ///
    /// The state list is searched first unless `prefer_function` is set.
    pub fn find(&self, code: &str, prefer_function: bool) -> Option<&DeviceFunction> {
        if prefer_function {
            self.function(code).or_else(|| self.status(code))
        } else {
            self.status(code).or_else(|| self.function(code))
        }
    }

    /// Datapoint id of a code.
    pub fn find_dp_id(&self, code: &str, prefer_function: bool) -> Option<u8> {
        self.find(code, prefer_function).map(|f| f.dp_id)
    }

    /// Wire type of a code.
    pub fn datapoint_type(&self, code: &str, prefer_function: bool) -> Option<DatapointType> {
        self.find(code, prefer_function)
            .map(DeviceFunction::datapoint_type)
    }

    /// All schema entries, state list first.
    pub fn schema(&self) -> impl Iterator<Item = &DeviceFunction> {
        self.status_range.iter().chain(self.functions.iter())
    }
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("uuid", &self.uuid)
            .field("local_key", &"..")
            .field("device_id", &self.device_id)
            .field("category", &self.category)
            .field("product_id", &self.product_id)
            .field("device_name", &self.device_name)
            .field("product_model", &self.product_model)
            .field("product_name", &self.product_name)
            .field("functions", &self.functions.len())
            .field("status_range", &self.status_range.len())
            .finish()
    }
}
