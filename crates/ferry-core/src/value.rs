//! Ledger cells and rows.
//!
//! Collectors report sizes, counts and durations; the scheduler adds the file
//! name, target type and outcome. A missing measurement is `Value::Null` and
//! is written as a blank cell.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single ledger cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    /// Signed measurement, such as a size difference or a complexity score.
    Int(i64),
    /// Unsigned measurement, such as a model size or a duration in micros.
    UInt(u64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(n) => write!(f, "{n}"),
            Value::UInt(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::UInt(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::UInt(n as u64)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One ledger row, keyed by column name, in insertion order.
pub type Record = IndexMap<String, Value>;

/// Builder-style insertion for records.
pub trait RecordExt {
    fn with(self, column: impl Into<String>, value: impl Into<Value>) -> Self;
}

impl RecordExt for Record {
    fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column.into(), value.into());
        self
    }
}
