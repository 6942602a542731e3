use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per-shard WAL sequence number.
pub type SeqNo = u64;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(pub String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        DocId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        DocId(id.to_string())
    }
}

impl From<u64> for DocId {
    fn from(raw: u64) -> Self {
        DocId(format!("{:016x}", raw))
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Object(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Numeric view used by metric aggregations. Dates count as their
    /// millisecond timestamp.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Date(ts) => Some(ts.timestamp_millis() as f64),
            _ => None,
        }
    }

    /// Exact term this value indexes under for non-text matching.
    pub fn as_term(&self) -> Option<String> {
        match self {
            FieldValue::Text(_) | FieldValue::Object(_) => None,
            FieldValue::Integer(v) => Some(v.to_string()),
            FieldValue::Float(v) => Some(v.to_string()),
            FieldValue::Boolean(v) => Some(v.to_string()),
            FieldValue::Date(ts) => Some(ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new(id: impl Into<DocId>) -> Self {
        Document {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn add_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
