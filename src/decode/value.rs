//! Decoded value tree.

use apache_avro::types::Value as AvroValue;
use base64::prelude::*;
use indexmap::IndexMap;
use serde::Serialize;

/// A decoded payload value.
///
/// Closed over the shapes an event payload can take once normalized: binary
/// data never survives decoding and is carried as base64 text instead.
/// Serializes to plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<DecodedValue>),
    Map(IndexMap<String, DecodedValue>),
}

impl DecodedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DecodedValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DecodedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DecodedValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, DecodedValue>> {
        match self {
            DecodedValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DecodedValue]> {
        match self {
            DecodedValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Render as a `serde_json::Value` (for logging and sinks).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for DecodedValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => DecodedValue::Null,
            Value::Bool(b) => DecodedValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => DecodedValue::Int(i),
                None => n
                    .as_f64()
                    .map(DecodedValue::Float)
                    .unwrap_or(DecodedValue::Null),
            },
            Value::String(s) => DecodedValue::String(s),
            Value::Array(items) => {
                DecodedValue::List(items.into_iter().map(DecodedValue::from).collect())
            }
            Value::Object(fields) => DecodedValue::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, DecodedValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<AvroValue> for DecodedValue {
    fn from(value: AvroValue) -> Self {
        match value {
            AvroValue::Null => DecodedValue::Null,
            AvroValue::Boolean(b) => DecodedValue::Bool(b),
            AvroValue::Int(n) | AvroValue::Date(n) | AvroValue::TimeMillis(n) => {
                DecodedValue::Int(i64::from(n))
            }
            AvroValue::Long(n)
            | AvroValue::TimeMicros(n)
            | AvroValue::TimestampMillis(n)
            | AvroValue::TimestampMicros(n)
            | AvroValue::LocalTimestampMillis(n)
            | AvroValue::LocalTimestampMicros(n) => DecodedValue::Int(n),
            AvroValue::Float(f) => DecodedValue::Float(f64::from(f)),
            AvroValue::Double(f) => DecodedValue::Float(f),
            AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => {
                DecodedValue::String(BASE64_STANDARD.encode(bytes))
            }
            AvroValue::String(s) => DecodedValue::String(s),
            AvroValue::Enum(_, symbol) => DecodedValue::String(symbol),
            AvroValue::Uuid(uuid) => DecodedValue::String(uuid.to_string()),
            AvroValue::Union(_, inner) => DecodedValue::from(*inner),
            AvroValue::Array(items) => {
                DecodedValue::List(items.into_iter().map(DecodedValue::from).collect())
            }
            AvroValue::Map(entries) => {
                // HashMap iteration order is random; sort for stable output.
                let mut entries: Vec<_> = entries.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                DecodedValue::Map(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k, DecodedValue::from(v)))
                        .collect(),
                )
            }
            AvroValue::Record(fields) => DecodedValue::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, DecodedValue::from(v)))
                    .collect(),
            ),
            AvroValue::Decimal(decimal) => match Vec::<u8>::try_from(&decimal) {
                Ok(bytes) => DecodedValue::String(BASE64_STANDARD.encode(bytes)),
                Err(_) => DecodedValue::String(format!("{:?}", decimal)),
            },
            // Remaining logical types (durations, big decimals, nanosecond
            // timestamps) have no lossless scalar form here.
            other => DecodedValue::String(format!("{:?}", other)),
        }
    }
}
