//! Payload decoding.
//!
//! Two paths produce a [`DecodedFields`] mapping from raw event bytes:
//! - [`decode_with_schema`]: Avro binary datum read against a record schema.
//!   Strict; failures surface as [`DecodeError`].
//! - [`decode_schemaless`]: best-effort JSON, falling back to a sentinel
//!   mapping that carries the raw bytes. Never fails.

mod value;

pub use value::DecodedValue;

use apache_avro::types::Value as AvroValue;
use apache_avro::Schema;
use base64::prelude::*;
use indexmap::IndexMap;

/// Decoded event payload: field name to value, in schema declaration order.
pub type DecodedFields = IndexMap<String, DecodedValue>;

/// Key holding base64 payload bytes when schema-less decode cannot parse them.
pub const RAW_KEY: &str = "_raw";
/// Key holding the reason schema-less decode fell back to raw bytes.
pub const NOTE_KEY: &str = "_note";
/// Key wrapping a valid JSON payload that is not an object.
pub const VALUE_KEY: &str = "_value";

/// Errors from schema-aware decoding.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Avro(Box<apache_avro::Error>),

    #[error("{remaining} trailing bytes after datum (schema/data mismatch)")]
    TrailingBytes { remaining: usize },

    #[error("top-level datum is not a record")]
    NotARecord,
}

impl From<apache_avro::Error> for DecodeError {
    fn from(e: apache_avro::Error) -> Self {
        DecodeError::Avro(Box::new(e))
    }
}

/// Decode a payload against a schema, or schema-less when none is known.
pub fn decode_payload(
    schema: Option<&Schema>,
    payload: &[u8],
) -> Result<DecodedFields, DecodeError> {
    match schema {
        Some(schema) => decode_with_schema(schema, payload),
        None => Ok(decode_schemaless(payload)),
    }
}

/// Decode an Avro binary datum (no container header) against `schema`.
///
/// The whole payload must be consumed; leftover bytes mean the writer used a
/// different schema.
pub fn decode_with_schema(
    schema: &Schema,
    payload: &[u8],
) -> Result<DecodedFields, DecodeError> {
    let mut reader = payload;
    let value = apache_avro::from_avro_datum(schema, &mut reader, None)?;
    if !reader.is_empty() {
        return Err(DecodeError::TrailingBytes {
            remaining: reader.len(),
        });
    }

    let value = match value {
        AvroValue::Union(_, inner) => *inner,
        other => other,
    };
    match value {
        AvroValue::Record(_) => match DecodedValue::from(value) {
            DecodedValue::Map(fields) => Ok(fields),
            _ => Err(DecodeError::NotARecord),
        },
        _ => Err(DecodeError::NotARecord),
    }
}

/// Best-effort decode without a schema.
///
/// UTF-8 JSON objects come back as-is; other valid JSON is wrapped under
/// [`VALUE_KEY`]. Anything else yields `{_raw: base64, _note: reason}`.
pub fn decode_schemaless(payload: &[u8]) -> DecodedFields {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            return raw_fallback(
                payload,
                format!("payload is not UTF-8 text ({e}); no schema available"),
            )
        }
    };

    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(fields)) => fields
            .into_iter()
            .map(|(k, v)| (k, DecodedValue::from(v)))
            .collect(),
        Ok(other) => {
            let mut fields = DecodedFields::new();
            fields.insert(VALUE_KEY.to_string(), DecodedValue::from(other));
            fields
        }
        Err(e) => raw_fallback(
            payload,
            format!("payload is not JSON ({e}); no schema available"),
        ),
    }
}

fn raw_fallback(payload: &[u8], note: String) -> DecodedFields {
    let mut fields = DecodedFields::new();
    fields.insert(
        RAW_KEY.to_string(),
        DecodedValue::String(BASE64_STANDARD.encode(payload)),
    );
    fields.insert(NOTE_KEY.to_string(), DecodedValue::String(note));
    fields
}
