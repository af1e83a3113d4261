//! The closed value model the rest of the engine reasons about.
//!
//! Nothing outside this module knows about `bson::Bson`. Every other
//! component — the type lattice, the codec, the schema manager — is written
//! against [`Value`], which is total over the BSON scalar kinds the spec
//! enumerates plus a conservative fallback for the handful of BSON variants
//! (regex, JS code, min/max key, ...) that applications practically never
//! store as document fields.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, Bson};
use std::str::FromStr;

/// A source document value, closed over the kinds §3 of the spec enumerates.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(BigDecimal),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    ObjectId(String),
    String(String),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Scalar means "not array, not object" — used by the `text` compatibility rule.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectId(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Bson> for Value {
    fn from(bson: Bson) -> Self {
        match bson {
            Bson::Null => Value::Null,
            Bson::Undefined => Value::Null,
            Bson::Boolean(b) => Value::Bool(b),
            Bson::Int32(i) => Value::Int(i as i64),
            Bson::Int64(i) => Value::Int(i),
            Bson::Double(f) => Value::Float(f),
            Bson::Decimal128(d) => {
                // Decimal128's Display is its canonical decimal text form.
                let text = d.to_string();
                match BigDecimal::from_str(&text) {
                    Ok(dec) => Value::Decimal(dec),
                    // Decimal128 NaN/Infinity have no BigDecimal representation.
                    Err(_) => Value::String(text),
                }
            }
            Bson::DateTime(dt) => Value::Timestamp(dt.to_chrono()),
            Bson::Binary(bin) => Value::Bytes(bin.bytes),
            Bson::ObjectId(oid) => Value::ObjectId(oid.to_hex()),
            Bson::String(s) => Value::String(s),
            Bson::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            Bson::Document(doc) => Value::Object(
                doc.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
            // Regex, JS code, symbol, timestamp, min/max key, db pointer: rare
            // in application document fields. Preserve something rather than
            // panicking, via the type's own Display/Debug.
            other => Value::String(bson_fallback_string(other)),
        }
    }
}

fn bson_fallback_string(bson: Bson) -> String {
    match bson {
        Bson::JavaScriptCode(code) => code,
        Bson::Symbol(s) => s,
        other => format!("{other:?}"),
    }
}

/// Parses a top-level BSON document into field name / Value pairs, in
/// document order. `_id` is included; callers that need it separated (the
/// schema manager, which treats `_id` specially) filter it out themselves.
pub fn document_fields(doc: bson::Document) -> Vec<(String, Value)> {
    doc.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}

/// Stringifies a document's `_id` value for use as the sink's text primary
/// key. `_id` is conventionally an `ObjectId` or a string, both of which
/// round-trip exactly; anything else falls back to its display form, which
/// is stable but not necessarily how the source would render it.
pub fn stringify_id(value: &Value) -> String {
    match value {
        Value::ObjectId(s) | Value::String(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Timestamp(t) => t.to_rfc3339(),
        Value::Bytes(b) => hex::encode(b),
        Value::Null | Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(&crate::codec::normalize_json(value)).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};

    #[test]
    fn scalars_convert() {
        assert_eq!(Value::from(Bson::Boolean(true)), Value::Bool(true));
        assert_eq!(Value::from(Bson::Int32(5)), Value::Int(5));
        assert_eq!(Value::from(Bson::Int64(5)), Value::Int(5));
        assert_eq!(Value::from(Bson::Double(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(Bson::Null), Value::Null);
        assert_eq!(
            Value::from(Bson::String("hi".into())),
            Value::String("hi".into())
        );
    }

    #[test]
    fn object_id_becomes_hex_string() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        assert_eq!(
            Value::from(Bson::ObjectId(oid)),
            Value::ObjectId("507f1f77bcf86cd799439011".into())
        );
    }

    #[test]
    fn nested_document_recurses() {
        let doc = doc! { "a": 1, "b": { "c": "x" }, "d": [1, 2] };
        let value = Value::from(Bson::Document(doc));
        match value {
            Value::Object(fields) => {
                assert_eq!(fields.len(), 3);
                assert_eq!(fields[0], ("a".to_string(), Value::Int(1)));
                match &fields[1].1 {
                    Value::Object(inner) => {
                        assert_eq!(inner[0], ("c".to_string(), Value::String("x".into())))
                    }
                    other => panic!("expected object, got {other:?}"),
                }
                match &fields[2].1 {
                    Value::Array(items) => assert_eq!(items.len(), 2),
                    other => panic!("expected array, got {other:?}"),
                }
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn is_scalar_excludes_containers() {
        assert!(Value::Int(1).is_scalar());
        assert!(Value::String("x".into()).is_scalar());
        assert!(!Value::Array(vec![]).is_scalar());
        assert!(!Value::Object(vec![]).is_scalar());
    }
}
