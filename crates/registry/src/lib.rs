//! The registry (C4): durable collection/table and field/column mappings,
//! plus resume tokens. See SPEC_FULL.md §4.4.
//!
//! Table and column names are chosen at runtime, so every statement here is
//! built and bound through `sqlx`'s runtime `query`/`query_as` API rather
//! than the `query!`/`query_as!` compile-time macros (see DESIGN.md).

use sink_types::{sanitize_identifier, make_hashed_name, SinkType};
use sqlx::error::DatabaseError;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use thiserror::Error;

const PENDING: &str = "pending";

/// Maximum number of collision-retry attempts before giving up. The hash
/// space is effectively unbounded, so this is purely a backstop against a
/// logic error turning into an infinite loop.
const MAX_ALLOCATION_ATTEMPTS: u32 = 64;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("exhausted {0} name-allocation attempts for {1:?}")]
    AllocationExhausted(u32, String),
    #[error("column {collection}.{field} has unrecognized persisted type {persisted:?}")]
    UnknownPersistedType { collection: String, field: String, persisted: String },
}

pub struct Registry {
    pool: PgPool,
}

impl Registry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the three registry tables if they don't already exist. Safe
    /// to call on every startup and safe to race against another process
    /// doing the same (the guards are `IF NOT EXISTS`).
    #[tracing::instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_registry (
                collection_name TEXT PRIMARY KEY,
                pg_table_name TEXT UNIQUE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_registry (
                collection_name TEXT NOT NULL REFERENCES collection_registry(collection_name) ON DELETE CASCADE,
                mongo_key TEXT NOT NULL,
                pg_column_name TEXT NOT NULL,
                pg_type TEXT NOT NULL,
                first_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_seen_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (collection_name, mongo_key),
                UNIQUE (collection_name, pg_column_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS schema_registry_collection_idx ON schema_registry(collection_name)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resume_tokens (
                scope TEXT PRIMARY KEY,
                token BYTEA NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns the sink table name for `collection`, allocating and
    /// persisting one on first sighting.
    #[tracing::instrument(skip(self))]
    pub async fn get_or_create_table(&self, collection: &str) -> Result<String, RegistryError> {
        let base = sanitize_identifier(collection, "collection");
        let mut attempt = 0u32;
        let mut candidate = base.clone();

        loop {
            let inserted = sqlx::query(
                "INSERT INTO collection_registry (collection_name, pg_table_name) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(collection)
            .bind(&candidate)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(result) if result.rows_affected() == 1 => return Ok(candidate),
                Ok(_) => {
                    // Either `collection_name` or `pg_table_name` already had
                    // a row. Disambiguate by re-reading.
                    if let Some(existing) = self.lookup_table(collection).await? {
                        return Ok(existing);
                    }
                    // Our collection_name isn't registered, so the conflict
                    // was on pg_table_name: another collection already
                    // claimed this name. Retry with a hashed variant.
                    attempt += 1;
                    if attempt > MAX_ALLOCATION_ATTEMPTS {
                        return Err(RegistryError::AllocationExhausted(
                            MAX_ALLOCATION_ATTEMPTS,
                            collection.to_string(),
                        ));
                    }
                    candidate = make_hashed_name(&base, collection, attempt);
                }
                Err(sqlx::Error::Database(db_err)) if is_unique_violation(&*db_err) => {
                    if let Some(existing) = self.lookup_table(collection).await? {
                        return Ok(existing);
                    }
                    attempt += 1;
                    if attempt > MAX_ALLOCATION_ATTEMPTS {
                        return Err(RegistryError::AllocationExhausted(
                            MAX_ALLOCATION_ATTEMPTS,
                            collection.to_string(),
                        ));
                    }
                    candidate = make_hashed_name(&base, collection, attempt);
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// The already-registered table name for `collection`, if any — used by
    /// the junction projector to resolve a reference's target table without
    /// creating one (§4.7 falls back to the collection name itself when
    /// unregistered).
    pub async fn existing_table_name(&self, collection: &str) -> Result<Option<String>, RegistryError> {
        self.lookup_table(collection).await
    }

    async fn lookup_table(&self, collection: &str) -> Result<Option<String>, RegistryError> {
        let row = sqlx::query("SELECT pg_table_name FROM collection_registry WHERE collection_name = $1")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("pg_table_name")))
    }

    /// Returns the column name for `(collection, field)`, registering a
    /// `pending`-typed row on first sighting. Callers must follow up with
    /// [`Registry::update_column_type`] once the physical column exists.
    #[tracing::instrument(skip(self))]
    pub async fn get_or_create_column(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<String, RegistryError> {
        let base = sanitize_identifier(field, "field");
        let mut attempt = 0u32;
        let mut candidate = base.clone();

        loop {
            let inserted = sqlx::query(
                "INSERT INTO schema_registry (collection_name, mongo_key, pg_column_name, pg_type)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT DO NOTHING",
            )
            .bind(collection)
            .bind(field)
            .bind(&candidate)
            .bind(PENDING)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(result) if result.rows_affected() == 1 => return Ok(candidate),
                Ok(_) => {
                    if let Some(existing) = self.lookup_column(collection, field).await? {
                        return Ok(existing);
                    }
                    attempt += 1;
                    if attempt > MAX_ALLOCATION_ATTEMPTS {
                        return Err(RegistryError::AllocationExhausted(
                            MAX_ALLOCATION_ATTEMPTS,
                            field.to_string(),
                        ));
                    }
                    candidate = make_hashed_name(&base, field, attempt);
                }
                Err(sqlx::Error::Database(db_err)) if is_unique_violation(&*db_err) => {
                    if let Some(existing) = self.lookup_column(collection, field).await? {
                        return Ok(existing);
                    }
                    attempt += 1;
                    if attempt > MAX_ALLOCATION_ATTEMPTS {
                        return Err(RegistryError::AllocationExhausted(
                            MAX_ALLOCATION_ATTEMPTS,
                            field.to_string(),
                        ));
                    }
                    candidate = make_hashed_name(&base, field, attempt);
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    async fn lookup_column(
        &self,
        collection: &str,
        field: &str,
    ) -> Result<Option<String>, RegistryError> {
        let row = sqlx::query(
            "SELECT pg_column_name FROM schema_registry WHERE collection_name = $1 AND mongo_key = $2",
        )
        .bind(collection)
        .bind(field)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>("pg_column_name")))
    }

    /// Loads every non-pending `(field -> (column, type))` mapping for
    /// `collection`.
    #[tracing::instrument(skip(self))]
    pub async fn load_columns(
        &self,
        collection: &str,
    ) -> Result<HashMap<String, (String, SinkType)>, RegistryError> {
        let rows = sqlx::query(
            "SELECT mongo_key, pg_column_name, pg_type FROM schema_registry
             WHERE collection_name = $1 AND pg_type <> $2",
        )
        .bind(collection)
        .bind(PENDING)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let field: String = row.get("mongo_key");
            let column: String = row.get("pg_column_name");
            let persisted: String = row.get("pg_type");
            let sink_type = SinkType::from_registry_str(&persisted).ok_or_else(|| {
                RegistryError::UnknownPersistedType {
                    collection: collection.to_string(),
                    field: field.clone(),
                    persisted: persisted.clone(),
                }
            })?;
            out.insert(field, (column, sink_type));
        }
        Ok(out)
    }

    /// Commits the concrete type for `(collection, field)`, e.g. right after
    /// `ALTER TABLE ... ADD COLUMN` or `... ALTER COLUMN ... TYPE jsonb`.
    #[tracing::instrument(skip(self))]
    pub async fn update_column_type(
        &self,
        collection: &str,
        field: &str,
        sink_type: SinkType,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            "UPDATE schema_registry SET pg_type = $3, last_seen_at = now()
             WHERE collection_name = $1 AND mongo_key = $2",
        )
        .bind(collection)
        .bind(field)
        .bind(sink_type.as_registry_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn save_resume_token(&self, scope: &str, token: &[u8]) -> Result<(), RegistryError> {
        sqlx::query(
            "INSERT INTO resume_tokens (scope, token, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (scope) DO UPDATE SET token = EXCLUDED.token, updated_at = now()",
        )
        .bind(scope)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn load_resume_token(&self, scope: &str) -> Result<Option<Vec<u8>>, RegistryError> {
        let row = sqlx::query("SELECT token FROM resume_tokens WHERE scope = $1")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("token")))
    }
}

fn is_unique_violation(db_err: &(dyn DatabaseError + '_)) -> bool {
    // Postgres SQLSTATE 23505 is unique_violation.
    db_err.code().as_deref() == Some("23505")
}
