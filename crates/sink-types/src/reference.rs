//! Reference extraction, shared by fk-extract fields (§4.2) and junction
//! projection (§4.7): turning a value that *names* another document into the
//! hex string of its `_id`.

use crate::Value;

/// Extracts a reference hex string from `value`, if `value` is one of:
/// - an object-id (already hex in our `Value` model),
/// - a bare string that looks like a 24-char hex object id,
/// - `{"$oid": "..."}`,
/// - `{"_id": "..."}` or `{"_id": {"$oid": "..."}}`.
///
/// Anything else — including multi-key objects, arrays, and non-hex strings
/// — fails extraction.
pub fn extract_reference(value: &Value) -> Option<String> {
    match value {
        Value::ObjectId(hex) => Some(hex.clone()),
        Value::String(s) if is_hex24(s) => Some(s.to_lowercase()),
        Value::Object(fields) if fields.len() == 1 => {
            let (key, inner) = &fields[0];
            match key.as_str() {
                "$oid" => extract_hex_from_scalar(inner),
                "_id" => extract_reference(inner).or_else(|| extract_hex_from_scalar(inner)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn extract_hex_from_scalar(value: &Value) -> Option<String> {
    match value {
        Value::ObjectId(hex) => Some(hex.clone()),
        Value::String(s) if is_hex24(s) => Some(s.to_lowercase()),
        _ => None,
    }
}

fn is_hex24(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod test {
    use super::*;

    const HEX: &str = "507f1f77bcf86cd799439011";

    #[test]
    fn object_id_value_extracts_directly() {
        assert_eq!(
            extract_reference(&Value::ObjectId(HEX.into())),
            Some(HEX.into())
        );
    }

    #[test]
    fn hex_string_extracts() {
        assert_eq!(
            extract_reference(&Value::String(HEX.into())),
            Some(HEX.into())
        );
    }

    #[test]
    fn non_hex_string_fails() {
        assert_eq!(extract_reference(&Value::String("not-a-ref".into())), None);
    }

    #[test]
    fn dollar_oid_form_extracts() {
        let v = Value::Object(vec![("$oid".into(), Value::String(HEX.into()))]);
        assert_eq!(extract_reference(&v), Some(HEX.into()));
    }

    #[test]
    fn nested_id_form_extracts() {
        let v = Value::Object(vec![("_id".into(), Value::ObjectId(HEX.into()))]);
        assert_eq!(extract_reference(&v), Some(HEX.into()));

        let v2 = Value::Object(vec![(
            "_id".into(),
            Value::Object(vec![("$oid".into(), Value::String(HEX.into()))]),
        )]);
        assert_eq!(extract_reference(&v2), Some(HEX.into()));
    }

    #[test]
    fn multi_key_object_fails() {
        let v = Value::Object(vec![
            ("_id".into(), Value::String(HEX.into())),
            ("name".into(), Value::String("x".into())),
        ]);
        assert_eq!(extract_reference(&v), None);
    }

    #[test]
    fn array_fails() {
        assert_eq!(
            extract_reference(&Value::Array(vec![Value::String(HEX.into())])),
            None
        );
    }
}
