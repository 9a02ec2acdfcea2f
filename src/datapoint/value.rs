//! Typed datapoint values and their wire encoding.

use std::fmt;

use crate::core::{DatapointError, ProtocolError};

/// Datapoint type ordinals as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DatapointType {
    /// Opaque bytes.
    Raw = 0,
    /// Boolean.
    Bool = 1,
    /// Signed 32-bit integer.
    Value = 2,
    /// UTF-8 string.
    String = 3,
    /// Unsigned enum index.
    Enum = 4,
    /// Bit set carried as bytes.
    Bitmap = 5,
}

impl DatapointType {
    /// Highest known ordinal.
    pub const MAX: u8 = DatapointType::Bitmap as u8;

    /// Parse a type ordinal.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Raw),
            1 => Some(Self::Bool),
            2 => Some(Self::Value),
            3 => Some(Self::String),
            4 => Some(Self::Enum),
            5 => Some(Self::Bitmap),
            _ => None,
        }
    }

    /// Get the wire ordinal.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Zero value of this type.
    pub fn default_value(self) -> DatapointValue {
        match self {
            Self::Raw => DatapointValue::Raw(Vec::new()),
            Self::Bool => DatapointValue::Bool(false),
            Self::Value => DatapointValue::Value(0),
            Self::String => DatapointValue::String(String::new()),
            Self::Enum => DatapointValue::Enum(0),
            Self::Bitmap => DatapointValue::Bitmap(Vec::new()),
        }
    }
}

impl fmt::Display for DatapointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Bool => "bool",
            Self::Value => "value",
            Self::String => "string",
            Self::Enum => "enum",
            Self::Bitmap => "bitmap",
        };
        f.write_str(name)
    }
}

/// A datapoint value; the variant always matches the datapoint type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointValue {
    /// Opaque bytes.
    Raw(Vec<u8>),
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Value(i32),
    /// UTF-8 string.
    String(String),
    /// Unsigned enum index.
    Enum(u32),
    /// Bit set.
    Bitmap(Vec<u8>),
}

impl DatapointValue {
    /// Type of this value.
    pub fn value_type(&self) -> DatapointType {
        match self {
            Self::Raw(_) => DatapointType::Raw,
            Self::Bool(_) => DatapointType::Bool,
            Self::Value(_) => DatapointType::Value,
            Self::String(_) => DatapointType::String,
            Self::Enum(_) => DatapointType::Enum,
            Self::Bitmap(_) => DatapointType::Bitmap,
        }
    }

    /// Truthiness of the value.
    ///
    /// Numbers are true when non-zero, strings and byte values when
    /// non-empty.
    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Value(v) => *v != 0,
            Self::Enum(v) => *v != 0,
            Self::String(s) => !s.is_empty(),
            Self::Raw(bytes) | Self::Bitmap(bytes) => !bytes.is_empty(),
        }
    }

    /// Integer view of numeric and boolean values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Value(v) => Some(i64::from(*v)),
            Self::Enum(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Convert into a value of type `target`.
    ///
    /// Numbers, booleans and numeric strings convert between each other;
    /// byte values only convert to byte values or from strings.
    pub fn coerce(self, target: DatapointType) -> Result<Self, DatapointError> {
        let found = self.value_type();
        if found == target {
            return Ok(self);
        }
        let mismatch = DatapointError::TypeMismatch {
            expected: target,
            found,
        };

        let integer = match &self {
            Self::String(s) => s.trim().parse::<i64>().ok(),
            other => other.as_i64(),
        };

        match target {
            DatapointType::Raw | DatapointType::Bitmap => {
                let bytes = match self {
                    Self::Raw(bytes) | Self::Bitmap(bytes) => bytes,
                    Self::String(s) => s.into_bytes(),
                    _ => return Err(mismatch),
                };
                Ok(if target == DatapointType::Raw {
                    Self::Raw(bytes)
                } else {
                    Self::Bitmap(bytes)
                })
            }
            DatapointType::Bool => match self {
                Self::Value(_) | Self::Enum(_) => Ok(Self::Bool(self.as_bool())),
                _ => Err(mismatch),
            },
            DatapointType::Value => integer
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::Value)
                .ok_or(mismatch),
            DatapointType::Enum => match integer {
                Some(v) if v < 0 => Err(DatapointError::EnumValue(v)),
                Some(v) => u32::try_from(v).map(Self::Enum).map_err(|_| mismatch),
                None => Err(mismatch),
            },
            DatapointType::String => match self {
                Self::Bool(b) => Ok(Self::String(b.to_string())),
                Self::Value(v) => Ok(Self::String(v.to_string())),
                Self::Enum(v) => Ok(Self::String(v.to_string())),
                _ => Err(mismatch),
            },
        }
    }

    /// Encode the value for a datapoint record.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Raw(bytes) | Self::Bitmap(bytes) => bytes.clone(),
            Self::Bool(b) => vec![u8::from(*b)],
            Self::Value(v) => v.to_be_bytes().to_vec(),
            Self::Enum(v) => {
                if *v > 0xFFFF {
                    v.to_be_bytes().to_vec()
                } else if *v > 0xFF {
                    (*v as u16).to_be_bytes().to_vec()
                } else {
                    vec![*v as u8]
                }
            }
            Self::String(s) => s.as_bytes().to_vec(),
        }
    }

    /// Decode a reported value of type `ty`.
    pub fn decode(ty: DatapointType, bytes: &[u8]) -> Result<Self, ProtocolError> {
        match ty {
            DatapointType::Raw => Ok(Self::Raw(bytes.to_vec())),
            DatapointType::Bitmap => Ok(Self::Bitmap(bytes.to_vec())),
            DatapointType::Bool => Ok(Self::Bool(bytes.iter().any(|&b| b != 0))),
            DatapointType::Value if bytes.is_empty() => Ok(Self::Value(0)),
            DatapointType::Value => {
                let unsigned = be_uint(bytes)?;
                let shift = 32 - 8 * bytes.len() as u32;
                Ok(Self::Value(((unsigned << shift) as i32) >> shift))
            }
            DatapointType::Enum => Ok(Self::Enum(be_uint(bytes)?)),
            DatapointType::String => String::from_utf8(bytes.to_vec())
                .map(Self::String)
                .map_err(|_| ProtocolError::Format),
        }
    }
}

/// Read an up to 4 byte big-endian unsigned integer; empty reads as 0.
fn be_uint(bytes: &[u8]) -> Result<u32, ProtocolError> {
    if bytes.len() > 4 {
        return Err(ProtocolError::Length);
    }
    Ok(bytes.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
}

impl From<bool> for DatapointValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for DatapointValue {
    fn from(value: i32) -> Self {
        Self::Value(value)
    }
}

impl From<u32> for DatapointValue {
    fn from(value: u32) -> Self {
        Self::Enum(value)
    }
}

impl From<&str> for DatapointValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for DatapointValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for DatapointValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Raw(value)
    }
}

impl fmt::Display for DatapointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(bytes) | Self::Bitmap(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Self::Bool(b) => write!(f, "{b}"),
            Self::Value(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Enum(v) => write!(f, "{v}"),
        }
    }
}
