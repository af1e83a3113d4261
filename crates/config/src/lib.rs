//! Environment-shaped configuration (C12, §4.12/§6). A thin boundary-only
//! loader: read each variable, apply the documented default, fail on the
//! first missing required setting. No retry, no inference beyond "is this
//! value present and well-formed".

use std::env::VarError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("environment variable {name} is not valid unicode")]
    NotUnicode { name: &'static str },
    #[error("environment variable {name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mongo_uri: String,
    pub db_name: String,
    pub pg_dsn: String,
    pub collections: Option<Vec<String>>,
    pub exclude_collections: Vec<String>,
    pub backfill: bool,
    pub watch: bool,
    pub batch_size: usize,
    pub copy_enabled: bool,
    pub copy_min_rows: usize,
    pub log_level: String,
    pub projection_config: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mongo_uri = var_or("MONGO_URI", "mongodb://localhost:27017")?;
        let db_name = require_var("DB_NAME")?;
        let pg_dsn = resolve_pg_dsn()?;
        let collections = var_opt("COLLECTIONS")?.map(|raw| split_csv(&raw));
        let exclude_collections = var_opt("EXCLUDE_COLLECTIONS")?
            .map(|raw| split_csv(&raw))
            .unwrap_or_default();
        let backfill = bool_var("BACKFILL", true)?;
        let watch = bool_var("WATCH", true)?;
        let batch_size = usize_var("BATCH_SIZE", 500)?;
        let copy_enabled = bool_var("COPY_ENABLED", true)?;
        let copy_min_rows = usize_var("COPY_MIN_ROWS", 200)?;
        let log_level = var_or("LOG_LEVEL", "INFO")?;
        let projection_config = var_opt("PROJECTION_CONFIG")?;

        if copy_min_rows == 0 {
            return Err(ConfigError::Invalid {
                name: "COPY_MIN_ROWS",
                value: "0".to_string(),
                reason: "must be at least 1",
            });
        }

        Ok(Self {
            mongo_uri,
            db_name,
            pg_dsn,
            collections,
            exclude_collections,
            backfill,
            watch,
            batch_size,
            copy_enabled,
            copy_min_rows,
            log_level,
            projection_config,
        })
    }
}

fn resolve_pg_dsn() -> Result<String, ConfigError> {
    if let Some(dsn) = var_opt("PG_DSN")? {
        return Ok(dsn);
    }
    let host = var_or("PGHOST", "localhost")?;
    let port = var_or("PGPORT", "5432")?;
    let database = require_var("PGDATABASE")?;
    let user = var_or("PGUSER", "postgres")?;
    let password = var_opt("PGPASSWORD")?.unwrap_or_default();
    Ok(format!("postgres://{user}:{password}@{host}:{port}/{database}"))
}

fn var_opt(name: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode { name }),
    }
}

fn var_or(name: &'static str, default: &str) -> Result<String, ConfigError> {
    Ok(var_opt(name)?.unwrap_or_else(|| default.to_string()))
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    var_opt(name)?.ok_or(ConfigError::Missing(name))
}

fn bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var_opt(name)? {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: raw,
                reason: "expected a boolean (true/false/1/0/yes/no/on/off)",
            }),
        },
    }
}

fn usize_var(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match var_opt(name)? {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw,
            reason: "expected a non-negative integer",
        }),
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_csv_trims_and_drops_empties() {
        assert_eq!(split_csv(" a, b ,,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn bool_var_parses_common_spellings() {
        std::env::set_var("CONFIG_TEST_BOOL_A", "yes");
        assert!(bool_var("CONFIG_TEST_BOOL_A", false).unwrap());
        std::env::set_var("CONFIG_TEST_BOOL_A", "off");
        assert!(!bool_var("CONFIG_TEST_BOOL_A", true).unwrap());
        std::env::remove_var("CONFIG_TEST_BOOL_A");
    }

    #[test]
    fn bool_var_rejects_garbage() {
        std::env::set_var("CONFIG_TEST_BOOL_B", "maybe");
        assert!(bool_var("CONFIG_TEST_BOOL_B", true).is_err());
        std::env::remove_var("CONFIG_TEST_BOOL_B");
    }

    #[test]
    fn usize_var_falls_back_to_default_when_unset() {
        std::env::remove_var("CONFIG_TEST_USIZE");
        assert_eq!(usize_var("CONFIG_TEST_USIZE", 500).unwrap(), 500);
    }
}
