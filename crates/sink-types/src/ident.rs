//! Sink identifier sanitization (§4.1). Pure functions: same input always
//! produces the same output, which is what lets the registry's
//! insert-then-select-on-conflict allocator (crate `registry`) retry safely.

use sha1::{Digest, Sha1};

const MAX_IDENT_LEN: usize = 63;

/// Sanitizes `name` into a legal, lowercase `[a-z0-9_]` identifier no longer
/// than [`MAX_IDENT_LEN`], falling back to `prefix` if sanitization empties
/// the name, and disambiguating overlong names with a hash suffix.
pub fn sanitize_identifier(name: &str, prefix: &str) -> String {
    let base = collapse(name);
    let base = if base.is_empty() {
        collapse(prefix)
    } else {
        base
    };
    let base = if base.is_empty() {
        "field".to_string()
    } else {
        base
    };

    if base.len() <= MAX_IDENT_LEN {
        return base;
    }

    truncate_with_hash(&base, &hash8(name))
}

/// Produces a retry candidate for `base` that differs per `attempt`,
/// derived from `original + ":" + attempt` so that a fresh hash suffix is
/// used on every collision retry.
pub fn make_hashed_name(base: &str, original: &str, attempt: u32) -> String {
    let salted = format!("{original}:{attempt}");
    truncate_with_hash(base, &hash8(&salted))
}

fn truncate_with_hash(base: &str, hash8: &str) -> String {
    // "_" + 8 hash chars must fit alongside the truncated base.
    let suffix_len = 1 + hash8.len();
    let keep = MAX_IDENT_LEN.saturating_sub(suffix_len);
    let truncated: String = base.chars().take(keep).collect();
    let truncated = truncated.trim_matches('_');
    format!("{truncated}_{hash8}")
}

fn hash8(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

/// Double-quotes `name` for use as a SQL identifier, escaping embedded
/// quotes. `sanitize_identifier`'s output never needs this (it only produces
/// `[a-z0-9_]+`), but collection/field names chosen elsewhere in the SQL
/// text (table aliases, etc.) still go through it defensively.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn collapse(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;
    for ch in name.chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '_' {
            ch.to_ascii_lowercase()
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replaces_illegal_characters_and_lowercases() {
        assert_eq!(sanitize_identifier("Foo-Bar!Baz", "x"), "foo_bar_baz");
    }

    #[test]
    fn collapses_runs_and_trims() {
        assert_eq!(sanitize_identifier("--foo___bar--", "x"), "foo_bar");
    }

    #[test]
    fn empty_input_uses_prefix() {
        assert_eq!(sanitize_identifier("###", "col"), "col");
        assert_eq!(sanitize_identifier("", "col"), "col");
    }

    #[test]
    fn short_names_pass_through_unmodified() {
        assert_eq!(sanitize_identifier("users", "x"), "users");
    }

    #[test]
    fn overlong_names_get_hash_suffix() {
        let long = "a".repeat(100);
        let out = sanitize_identifier(&long, "x");
        assert!(out.len() <= MAX_IDENT_LEN);
        assert!(out.contains('_'));
        let suffix = out.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn sanitize_is_pure() {
        assert_eq!(
            sanitize_identifier("Some Field", "x"),
            sanitize_identifier("Some Field", "x")
        );
    }

    #[test]
    fn hashed_name_differs_per_attempt() {
        let a = make_hashed_name("base", "original", 1);
        let b = make_hashed_name("base", "original", 2);
        assert_ne!(a, b);
        // Deterministic given the same inputs.
        assert_eq!(a, make_hashed_name("base", "original", 1));
    }

    #[test]
    fn hashed_name_stays_within_limit() {
        let long_base = "b".repeat(200);
        let out = make_hashed_name(&long_base, "orig", 7);
        assert!(out.len() <= MAX_IDENT_LEN);
    }
}
