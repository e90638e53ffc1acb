//! Column values and formats
//!
//! This module provides:
//! - [`Value`], a type-safe column value
//! - [`DataType`] and [`DataFormat`], the description of a column
//! - [`BoundRow`], the bound columns returned by a fetch

use bytes::Bytes;

use crate::constants::format_status;
use crate::error::{Error, Result};

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// 64-bit integer
    Int,
    /// Double precision float
    Float,
    /// Short character data
    Char,
    /// Short binary data (version tokens use this)
    Binary,
    /// Large character field
    Text,
    /// Large binary field
    Image,
}

impl DataType {
    /// Whether values of this type are large fields, read in chunks and
    /// updated through a descriptor
    pub fn is_large(&self) -> bool {
        matches!(self, DataType::Text | DataType::Image)
    }

    /// Short lowercase type name
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Char => "char",
            DataType::Binary => "binary",
            DataType::Text => "text",
            DataType::Image => "image",
        }
    }
}

/// Description of one column of a result set
#[derive(Debug, Clone, PartialEq)]
pub struct DataFormat {
    /// Column name
    pub name: String,
    /// Data type
    pub datatype: DataType,
    /// Maximum length in bytes (0 = unbounded)
    pub max_length: usize,
    /// Status flags (see [`format_status`])
    pub status: u32,
}

impl DataFormat {
    /// Create a format with no status flags
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        let max_length = match datatype {
            DataType::Int | DataType::Float => 8,
            _ => 0,
        };
        Self {
            name: name.into(),
            datatype,
            max_length,
            status: format_status::NONE,
        }
    }

    /// Set the maximum length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Add status flags
    pub fn with_status(mut self, status: u32) -> Self {
        self.status |= status;
        self
    }

    /// Check if the column is a version (timestamp) token
    pub fn is_timestamp(&self) -> bool {
        self.status & format_status::TIMESTAMP != 0
    }

    /// Short description used in errors
    pub fn describe_kind(&self) -> String {
        if self.is_timestamp() {
            "timestamp".to_string()
        } else {
            self.datatype.name().to_string()
        }
    }
}

/// A column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL value
    Null,
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// Short character value
    Char(String),
    /// Short binary value
    Binary(Bytes),
    /// Large character value
    Text(Bytes),
    /// Large binary value
    Image(Bytes),
}

impl Value {
    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as a float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as a string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Char(s) => Some(s),
            Value::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to get as raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) | Value::Text(b) | Value::Image(b) => Some(b),
            Value::Char(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Whether this value belongs in a column of `datatype`
    pub fn fits(&self, datatype: DataType) -> bool {
        matches!(
            (self, datatype),
            (Value::Null, _)
                | (Value::Integer(_), DataType::Int)
                | (Value::Float(_), DataType::Float)
                | (Value::Char(_), DataType::Char)
                | (Value::Binary(_), DataType::Binary)
                | (Value::Text(_), DataType::Text)
                | (Value::Image(_), DataType::Image)
        )
    }

    /// Raw bytes served by a chunked `get_data` on this value.
    /// Numbers are sent big-endian.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Value::Null => Bytes::new(),
            Value::Integer(i) => Bytes::copy_from_slice(&i.to_be_bytes()),
            Value::Float(f) => Bytes::copy_from_slice(&f.to_be_bytes()),
            Value::Char(s) => Bytes::copy_from_slice(s.as_bytes()),
            Value::Binary(b) | Value::Text(b) | Value::Image(b) => b.clone(),
        }
    }

    /// Decode bytes read with `get_data` back into a value of `datatype`
    ///
    /// An empty numeric read is `Null`.
    pub fn from_bytes(datatype: DataType, bytes: &[u8]) -> Result<Self> {
        let number = |bytes: &[u8]| -> Result<[u8; 8]> {
            bytes.try_into().map_err(|_| {
                Error::protocol(format!(
                    "{} value must be 8 bytes, got {}",
                    datatype.name(),
                    bytes.len()
                ))
            })
        };
        Ok(match datatype {
            DataType::Int | DataType::Float if bytes.is_empty() => Value::Null,
            DataType::Int => Value::Integer(i64::from_be_bytes(number(bytes)?)),
            DataType::Float => Value::Float(f64::from_be_bytes(number(bytes)?)),
            DataType::Char => Value::Char(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::protocol(format!("char value is not UTF-8: {}", e)))?,
            ),
            DataType::Binary => Value::Binary(Bytes::copy_from_slice(bytes)),
            DataType::Text => Value::Text(Bytes::copy_from_slice(bytes)),
            DataType::Image => Value::Image(Bytes::copy_from_slice(bytes)),
        })
    }

    /// Decode the leading bytes of a value whose read was cut short
    ///
    /// Character data is cut back to the last whole UTF-8 character.
    pub fn from_truncated_bytes(datatype: DataType, bytes: &[u8]) -> Result<Self> {
        if datatype != DataType::Char {
            return Self::from_bytes(datatype, bytes);
        }
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            // Incomplete sequence at the cut
            Err(e) if e.error_len().is_none() => std::str::from_utf8(&bytes[..e.valid_up_to()])
                .map_err(|e| Error::protocol(format!("char value is not UTF-8: {}", e)))?,
            Err(e) => return Err(Error::protocol(format!("char value is not UTF-8: {}", e))),
        };
        Ok(Value::Char(text.to_string()))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Char(v.to_string())
    }
}

/// The bound columns of one fetched row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundRow {
    /// (column index, value) pairs in column order
    pub columns: Vec<(usize, Value)>,
}

impl BoundRow {
    /// Create a bound row
    pub fn new(columns: Vec<(usize, Value)>) -> Self {
        Self { columns }
    }

    /// Get the value bound for `column`
    pub fn get(&self, column: usize) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(index, _)| *index == column)
            .map(|(_, value)| value)
    }

    /// Number of bound columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if nothing was bound
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
