use std::fmt;

use serde::{Deserialize, Serialize};

/// The primitive kinds a record field can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Integer,
    String,
    Address,
    Float,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Integer => write!(f, "integer"),
            FieldKind::String => write!(f, "string"),
            FieldKind::Address => write!(f, "address"),
            FieldKind::Float => write!(f, "float"),
        }
    }
}

/// One decoded field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldValue {
    Integer(i64),
    String(String),
    Address(u64),
    Float(f64),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Address(_) => FieldKind::Address,
            FieldValue::Float(_) => FieldKind::Float,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{}", v),
            FieldValue::Address(v) => write!(f, "0x{:x}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One decoded trace event. Constructed by the decoder, handed to the record
/// handler, then discarded; handlers clone whatever they want to keep.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceRecord {
    /// Cookie of the clause that produced this record.
    pub cookie: u64,
    /// Rendered probe description of that clause.
    pub probe: String,
    /// Engine timestamp in nanoseconds.
    pub ts: u64,
    /// Source unit the record was drained from.
    pub source: u32,
    /// Field values in the clause's declared output order.
    pub values: Vec<FieldValue>,
}
