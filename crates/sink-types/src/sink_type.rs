//! The sink's type lattice: inference from a [`Value`], the `compatible`
//! predicate, and the one-way promotion rule (§4.2).
//!
//! `Jsonb` is absorbing: every other type can promote to it, and it can
//! promote to nothing. There is intentionally no `promote(T) -> T'` function
//! beyond "become Jsonb" — the lattice has exactly two levels.

use crate::reference::extract_reference;
use crate::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkType {
    Boolean,
    BigInt,
    DoublePrecision,
    Numeric,
    Timestamptz,
    Text,
    Bytea,
    Jsonb,
}

impl SinkType {
    /// The Postgres type name used in DDL (`ALTER TABLE ... ADD COLUMN col <sql()>`).
    pub fn sql(&self) -> &'static str {
        match self {
            SinkType::Boolean => "boolean",
            SinkType::BigInt => "bigint",
            SinkType::DoublePrecision => "double precision",
            SinkType::Numeric => "numeric",
            SinkType::Timestamptz => "timestamptz",
            SinkType::Text => "text",
            SinkType::Bytea => "bytea",
            SinkType::Jsonb => "jsonb",
        }
    }

    /// Round-trips through `schema_registry.pg_type`.
    pub fn as_registry_str(&self) -> &'static str {
        self.sql()
    }

    pub fn from_registry_str(s: &str) -> Option<SinkType> {
        Some(match s {
            "boolean" => SinkType::Boolean,
            "bigint" => SinkType::BigInt,
            "double precision" => SinkType::DoublePrecision,
            "numeric" => SinkType::Numeric,
            "timestamptz" => SinkType::Timestamptz,
            "text" => SinkType::Text,
            "bytea" => SinkType::Bytea,
            "jsonb" => SinkType::Jsonb,
            _ => return None,
        })
    }
}

/// Infers the sink type for `value`, honoring the fk-extract context override
/// of §4.2. `is_fk_extract_field` is true when `(collection, field)` appears
/// in the projection config's `fk_extract_fields`.
pub fn infer(value: &Value, is_fk_extract_field: bool) -> SinkType {
    if is_fk_extract_field && extract_reference(value).is_some() {
        return SinkType::Text;
    }
    match value {
        Value::Null => SinkType::Jsonb,
        Value::Bool(_) => SinkType::Boolean,
        Value::Int(_) => SinkType::BigInt,
        Value::Float(_) => SinkType::DoublePrecision,
        Value::Decimal(_) => SinkType::Numeric,
        Value::Timestamp(_) => SinkType::Timestamptz,
        Value::ObjectId(_) | Value::String(_) => SinkType::Text,
        Value::Bytes(_) => SinkType::Bytea,
        Value::Array(_) | Value::Object(_) => SinkType::Jsonb,
    }
}

/// `compatible(v, T)` of §4.2. Null is always compatible with every type.
pub fn compatible(value: &Value, sink_type: SinkType, is_fk_extract_field: bool) -> bool {
    if value.is_null() {
        return true;
    }
    match sink_type {
        SinkType::Jsonb => true,
        SinkType::Text => {
            value.is_scalar() || (is_fk_extract_field && extract_reference(value).is_some())
        }
        SinkType::BigInt => matches!(value, Value::Int(_)),
        SinkType::DoublePrecision => matches!(value, Value::Int(_) | Value::Float(_)),
        SinkType::Numeric => matches!(value, Value::Int(_) | Value::Float(_) | Value::Decimal(_)),
        SinkType::Boolean => matches!(value, Value::Bool(_)),
        SinkType::Timestamptz => matches!(value, Value::Timestamp(_)),
        SinkType::Bytea => matches!(value, Value::Bytes(_)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn infer_covers_every_variant() {
        assert_eq!(infer(&Value::Null, false), SinkType::Jsonb);
        assert_eq!(infer(&Value::Bool(true), false), SinkType::Boolean);
        assert_eq!(infer(&Value::Int(1), false), SinkType::BigInt);
        assert_eq!(infer(&Value::Float(1.0), false), SinkType::DoublePrecision);
        assert_eq!(
            infer(&Value::Timestamp(chrono::Utc::now()), false),
            SinkType::Timestamptz
        );
        assert_eq!(infer(&Value::String("x".into()), false), SinkType::Text);
        assert_eq!(infer(&Value::Bytes(vec![1]), false), SinkType::Bytea);
        assert_eq!(infer(&Value::Array(vec![]), false), SinkType::Jsonb);
        assert_eq!(infer(&Value::Object(vec![]), false), SinkType::Jsonb);
    }

    #[test]
    fn fk_extract_override_applies_only_when_extractable() {
        let oid = Value::ObjectId("507f1f77bcf86cd799439011".into());
        assert_eq!(infer(&oid, true), SinkType::Text);

        // Not extractable (nested object without $oid/_id key) falls through
        // to ordinary inference: jsonb.
        let not_a_ref = Value::Object(vec![("foo".into(), Value::Int(1))]);
        assert_eq!(infer(&not_a_ref, true), SinkType::Jsonb);
    }

    #[test]
    fn compatible_null_is_universal() {
        for t in [
            SinkType::Boolean,
            SinkType::BigInt,
            SinkType::DoublePrecision,
            SinkType::Numeric,
            SinkType::Timestamptz,
            SinkType::Text,
            SinkType::Bytea,
            SinkType::Jsonb,
        ] {
            assert!(compatible(&Value::Null, t, false));
        }
    }

    #[test]
    fn compatible_widening_chain() {
        // int is compatible with bigint, double, numeric, jsonb but not bool/text/bytea/timestamptz
        let v = Value::Int(1);
        assert!(compatible(&v, SinkType::BigInt, false));
        assert!(compatible(&v, SinkType::DoublePrecision, false));
        assert!(compatible(&v, SinkType::Numeric, false));
        assert!(compatible(&v, SinkType::Jsonb, false));
        assert!(!compatible(&v, SinkType::Boolean, false));
        assert!(!compatible(&v, SinkType::Text, false));
        assert!(!compatible(&v, SinkType::Bytea, false));
        assert!(!compatible(&v, SinkType::Timestamptz, false));
    }

    #[test]
    fn bool_is_not_an_integer() {
        // bools must never satisfy bigint/double/numeric compatibility.
        let v = Value::Bool(true);
        assert!(!compatible(&v, SinkType::BigInt, false));
        assert!(!compatible(&v, SinkType::DoublePrecision, false));
        assert!(!compatible(&v, SinkType::Numeric, false));
        assert!(compatible(&v, SinkType::Boolean, false));
    }

    #[test]
    fn text_accepts_fk_extractable_non_scalar() {
        let single_key_oid = Value::Object(vec![("_id".into(), Value::String("abc".into()))]);
        assert!(!single_key_oid.is_scalar());
        assert!(compatible(&single_key_oid, SinkType::Text, true));
        assert!(!compatible(&single_key_oid, SinkType::Text, false));
    }

    #[test]
    fn array_and_object_require_jsonb() {
        let arr = Value::Array(vec![Value::Int(1)]);
        assert!(!compatible(&arr, SinkType::Text, false));
        assert!(compatible(&arr, SinkType::Jsonb, false));
    }
}
