//! Value codec (§4.3): JSON-normalization for `jsonb` columns, and the two
//! wire encodings — parameterized bind values and the bulk-copy text frame.

use crate::reference::extract_reference;
use crate::sink_type::SinkType;
use crate::Value;
use bigdecimal::ToPrimitive;
use chrono::SecondsFormat;
use thiserror::Error;

/// Raised when a value cannot be represented in its target column's type.
/// Per §4.3 this is an internal signal: the copy path's caller turns it into
/// a fallback to the parameterized path, it is never surfaced as an
/// operator-facing error.
#[derive(Debug, Error, PartialEq)]
#[error("value {value:?} cannot be encoded as {sink_type:?}")]
pub struct TypeConflict {
    pub value: Value,
    pub sink_type: SinkType,
}

/// Recursively normalizes `value` into a `serde_json::Value` suitable for a
/// `jsonb` column, per the rules of §4.3. Total and idempotent: normalizing
/// an already-normalized `serde_json::Value` round-tripped back through
/// [`Value`] produces the same output again.
pub fn normalize_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        Value::Null => J::Null,
        Value::Bool(b) => J::Bool(*b),
        Value::Int(i) => J::Number((*i).into()),
        Value::Float(f) => {
            if f.is_finite() {
                serde_json::Number::from_f64(*f).map(J::Number).unwrap_or(J::Null)
            } else {
                J::Null
            }
        }
        Value::Decimal(d) => match d.to_f64() {
            Some(f) if f.is_finite() => J::String(d.to_string()),
            _ => J::Null,
        },
        Value::Timestamp(ts) => J::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Value::Bytes(bytes) => J::String(hex::encode(bytes)),
        Value::ObjectId(hex) => J::String(hex.clone()),
        Value::String(s) => J::String(s.clone()),
        Value::Array(items) => J::Array(items.iter().map(normalize_json).collect()),
        Value::Object(fields) => J::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), normalize_json(v)))
                .collect(),
        ),
    }
}

/// The sink-side scalar form of one cell, used to build parameter bindings
/// for the fallback path and, stringified, the bulk-copy text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Null,
    Bool(bool),
    BigInt(i64),
    Double(f64),
    Numeric(bigdecimal::BigDecimal),
    Timestamptz(chrono::DateTime<chrono::Utc>),
    Text(String),
    Bytea(Vec<u8>),
    Jsonb(serde_json::Value),
}

/// Encodes `value` for `sink_type`, honoring the fk-extract fallback
/// (extract-or-`str(value)`) for `text` columns. Returns [`TypeConflict`]
/// when `value` cannot be represented as `sink_type` — callers are expected
/// to have already checked `compatible` for non-fk-extract text columns, but
/// this function re-derives the same answer so it never silently corrupts
/// data if that invariant is ever violated upstream.
pub fn encode(value: &Value, sink_type: SinkType, is_fk_extract_field: bool) -> Result<Encoded, TypeConflict> {
    if value.is_null() {
        return Ok(Encoded::Null);
    }
    let conflict = || TypeConflict {
        value: value.clone(),
        sink_type,
    };
    Ok(match sink_type {
        SinkType::Jsonb => Encoded::Jsonb(normalize_json(value)),
        SinkType::Boolean => match value {
            Value::Bool(b) => Encoded::Bool(*b),
            _ => return Err(conflict()),
        },
        SinkType::BigInt => match value {
            Value::Int(i) => Encoded::BigInt(*i),
            _ => return Err(conflict()),
        },
        SinkType::DoublePrecision => match value {
            Value::Int(i) => Encoded::Double(*i as f64),
            Value::Float(f) => Encoded::Double(*f),
            _ => return Err(conflict()),
        },
        SinkType::Numeric => match value {
            Value::Int(i) => Encoded::Numeric(bigdecimal::BigDecimal::from(*i)),
            Value::Float(f) => bigdecimal::BigDecimal::try_from(*f)
                .map(Encoded::Numeric)
                .map_err(|_| conflict())?,
            Value::Decimal(d) => Encoded::Numeric(d.clone()),
            _ => return Err(conflict()),
        },
        SinkType::Timestamptz => match value {
            Value::Timestamp(ts) => Encoded::Timestamptz(*ts),
            _ => return Err(conflict()),
        },
        SinkType::Bytea => match value {
            Value::Bytes(b) => Encoded::Bytea(b.clone()),
            _ => return Err(conflict()),
        },
        SinkType::Text => {
            if is_fk_extract_field {
                if let Some(hex) = extract_reference(value) {
                    Encoded::Text(hex)
                } else {
                    Encoded::Text(display_value(value))
                }
            } else if value.is_scalar() {
                Encoded::Text(display_value(value))
            } else {
                return Err(conflict());
            }
        }
    })
}

/// `str(value)` for the fk-extract fallback: the plain textual form of a
/// scalar, matching what an operator would expect to see for a logged value.
fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        Value::Bytes(b) => hex::encode(b),
        Value::ObjectId(hex) => hex.clone(),
        Value::String(s) => s.clone(),
        // Non-scalar: only reached via the fk-extract fallback branch.
        other => normalize_json(other).to_string(),
    }
}

/// Textual copy-frame encoding of one already-[`encode`]d cell (§4.3): `\N`
/// for null, backslash-escaping of tab/newline/CR/backslash for everything
/// else.
pub fn encode_copy_field(encoded: &Encoded) -> String {
    match encoded {
        Encoded::Null => "\\N".to_string(),
        Encoded::Bool(b) => escape_copy_text(if *b { "t" } else { "f" }),
        Encoded::BigInt(i) => i.to_string(),
        Encoded::Double(f) => f.to_string(),
        Encoded::Numeric(d) => d.to_string(),
        Encoded::Timestamptz(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
        Encoded::Text(s) => escape_copy_text(s),
        Encoded::Bytea(bytes) => escape_copy_text(&format!("\\x{}", hex::encode(bytes))),
        Encoded::Jsonb(json) => escape_copy_text(&json.to_string()),
    }
}

fn escape_copy_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sink_type::SinkType::*;

    #[test]
    fn null_encodes_regardless_of_type() {
        for t in [Boolean, BigInt, DoublePrecision, Numeric, Timestamptz, Text, Bytea, Jsonb] {
            assert_eq!(encode(&Value::Null, t, false), Ok(Encoded::Null));
        }
    }

    #[test]
    fn bool_conflicts_with_bigint() {
        let err = encode(&Value::Bool(true), BigInt, false).unwrap_err();
        assert_eq!(err.sink_type, BigInt);
    }

    #[test]
    fn int_widens_into_double_and_numeric() {
        assert_eq!(encode(&Value::Int(3), DoublePrecision, false), Ok(Encoded::Double(3.0)));
        assert!(matches!(
            encode(&Value::Int(3), Numeric, false),
            Ok(Encoded::Numeric(_))
        ));
    }

    #[test]
    fn array_conflicts_with_text_unless_fk_extract_succeeds() {
        let arr = Value::Array(vec![Value::Int(1)]);
        assert!(encode(&arr, Text, false).is_err());
        assert!(encode(&arr, Text, true).is_ok()); // falls back to str(value)
    }

    #[test]
    fn fk_extract_field_prefers_extracted_reference() {
        let oid = Value::ObjectId("507f1f77bcf86cd799439011".into());
        assert_eq!(
            encode(&oid, Text, true),
            Ok(Encoded::Text("507f1f77bcf86cd799439011".into()))
        );
    }

    #[test]
    fn json_normalize_handles_non_finite_floats() {
        assert_eq!(normalize_json(&Value::Float(f64::NAN)), serde_json::Value::Null);
        assert_eq!(normalize_json(&Value::Float(f64::INFINITY)), serde_json::Value::Null);
    }

    #[test]
    fn json_normalize_is_idempotent() {
        let v = Value::Object(vec![
            ("a".into(), Value::Int(1)),
            ("b".into(), Value::Array(vec![Value::String("x".into())])),
        ]);
        let once = normalize_json(&v);
        // Reinterpreting the normalized JSON back through our Value model
        // and normalizing again must be a no-op.
        let roundtrip = json_to_value(&once);
        let twice = normalize_json(&roundtrip);
        assert_eq!(once, twice);
    }

    fn json_to_value(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap())
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(json_to_value).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), json_to_value(v)))
                    .collect(),
            ),
        }
    }

    #[test]
    fn copy_text_escapes_control_characters() {
        assert_eq!(
            encode_copy_field(&Encoded::Text("a\tb\nc\\d".into())),
            "a\\tb\\nc\\\\d"
        );
        assert_eq!(encode_copy_field(&Encoded::Null), "\\N");
    }

    #[test]
    fn bytea_copy_uses_hex_format() {
        assert_eq!(
            encode_copy_field(&Encoded::Bytea(vec![0xde, 0xad])),
            "\\\\xdead"
        );
    }
}
