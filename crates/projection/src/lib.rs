//! Static projection configuration (§3, §4.12): `fk_extract_fields` and
//! `junction_fields`, supplied at build time and loaded once at startup from
//! a YAML file. Neither map is learned or mutated at runtime.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectionConfigError {
    #[error("failed to read projection config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse projection config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawProjectionConfig {
    #[serde(default)]
    fk_extract_fields: HashMap<String, Vec<String>>,
    #[serde(default)]
    junction_fields: HashMap<String, HashMap<String, String>>,
}

/// The fk-extract and junction-field maps, indexed for O(1) membership and
/// target lookup.
#[derive(Debug, Clone, Default)]
pub struct ProjectionConfig {
    fk_extract_fields: HashMap<String, HashSet<String>>,
    junction_fields: HashMap<String, HashMap<String, String>>,
}

impl ProjectionConfig {
    /// Loads the config from `path`, or returns an empty config if `path` is
    /// `None` — an unconfigured worker simply has no fk-extract or junction
    /// fields.
    pub fn load(path: Option<&Path>) -> Result<Self, ProjectionConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ProjectionConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawProjectionConfig =
            serde_yaml::from_str(&text).map_err(|source| ProjectionConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawProjectionConfig) -> Self {
        let fk_extract_fields = raw
            .fk_extract_fields
            .into_iter()
            .map(|(collection, fields)| (collection, fields.into_iter().collect()))
            .collect();
        Self {
            fk_extract_fields,
            junction_fields: raw.junction_fields,
        }
    }

    pub fn is_fk_extract_field(&self, collection: &str, field: &str) -> bool {
        self.fk_extract_fields
            .get(collection)
            .is_some_and(|fields| fields.contains(field))
    }

    /// Returns the target collection for a junction field, if `(collection,
    /// field)` is declared as one.
    pub fn junction_target(&self, collection: &str, field: &str) -> Option<&str> {
        self.junction_fields
            .get(collection)
            .and_then(|fields| fields.get(field))
            .map(String::as_str)
    }

    /// All junction fields declared for `collection`, as `(field,
    /// target_collection)` pairs — used by the junction projector to iterate
    /// a document's declared junctions without re-walking the whole map.
    pub fn junction_fields_for(&self, collection: &str) -> Vec<(&str, &str)> {
        self.junction_fields
            .get(collection)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(field, target)| (field.as_str(), target.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_has_no_overrides() {
        let config = ProjectionConfig::default();
        assert!(!config.is_fk_extract_field("users", "department"));
        assert!(config.junction_target("users", "branch").is_none());
        assert!(config.junction_fields_for("users").is_empty());
    }

    #[test]
    fn parses_yaml_shape() {
        let yaml = r#"
fk_extract_fields:
  users:
    - department
junction_fields:
  users:
    branch: branches
"#;
        let raw: RawProjectionConfig = serde_yaml::from_str(yaml).unwrap();
        let config = ProjectionConfig::from_raw(raw);
        assert!(config.is_fk_extract_field("users", "department"));
        assert!(!config.is_fk_extract_field("users", "other"));
        assert_eq!(config.junction_target("users", "branch"), Some("branches"));
        assert_eq!(config.junction_fields_for("users"), vec![("branch", "branches")]);
    }
}
