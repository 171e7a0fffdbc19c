//! Record fingerprints
//!
//! A fingerprint is the MD5 of a canonical rendering of the record: a JSON
//! object with keys sorted by field name, each value tagged with its type.
//! It is the only identity a synchronized row has, stored in the unique
//! `control_hash` column.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value as JsonValue};

use crate::types::{Record, Value};

/// Length of a rendered fingerprint (hex characters)
pub const FINGERPRINT_LEN: usize = 32;

/// Compute the fingerprint of a record.
///
/// Independent of field order; identical field values always yield the same
/// digest across processes and machines.
pub fn fingerprint(record: &Record) -> String {
    let digest = md5::compute(canonical_form(record).as_bytes());
    format!("{:x}", digest)
}

/// Canonical rendering hashed by [`fingerprint`].
///
/// `{"FIELD":{"TYPE":payload},...}` in compact form. The type tag keeps
/// `Int(1)` apart from `String("1")`.
pub fn canonical_form(record: &Record) -> String {
    let sorted: BTreeMap<&str, &Value> = record.iter().collect();
    let fields: Map<String, JsonValue> = sorted
        .into_iter()
        .map(|(name, value)| (name.to_string(), tagged(value)))
        .collect();
    JsonValue::Object(fields).to_string()
}

fn tagged(value: &Value) -> JsonValue {
    let payload = match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(n) => JsonValue::from(*n),
        Value::Float(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
    };

    let mut tag = Map::with_capacity(1);
    tag.insert(value.type_name().to_string(), payload);
    JsonValue::Object(tag)
}
