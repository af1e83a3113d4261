//! The bulk writer (C6): upserts a batch of documents through either the
//! `COPY`-into-staging-table fast path or a parameterized multi-row
//! fallback. See SPEC_FULL.md §4.6.

use schema::TableState;
use sink_types::{encode, encode_copy_field, quote_ident, Encoded, TypeConflict, Value};
use sqlx::{PgPool, Postgres};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("value cannot be encoded: {0}")]
    TypeConflict(#[from] TypeConflict),
}

/// One document ready to be upserted: its sink `_id` and the fields it
/// currently has a column for, in arbitrary order (the writer reorders them
/// to match [`TableState::ordered_fields`]).
pub struct DocumentRow {
    pub id: String,
    pub fields: Vec<(String, Value)>,
}

pub struct BulkWriter {
    pool: PgPool,
    copy_enabled: bool,
    copy_min_rows: usize,
}

impl BulkWriter {
    pub fn new(pool: PgPool, copy_enabled: bool, copy_min_rows: usize) -> Self {
        Self {
            pool,
            copy_enabled,
            copy_min_rows,
        }
    }

    /// Upserts `rows` into `state`'s table, choosing the copy path when
    /// enabled and the batch is large enough, else the parameterized path.
    /// A copy-path failure is never surfaced directly: the whole batch is
    /// retried through the parameterized path, which is the correctness
    /// fallback of record.
    #[tracing::instrument(skip(self, state, rows, is_fk_extract_field))]
    pub async fn upsert_batch(
        &self,
        state: &TableState,
        rows: &[DocumentRow],
        is_fk_extract_field: impl Fn(&str) -> bool,
    ) -> Result<(), WriterError> {
        if rows.is_empty() {
            return Ok(());
        }

        if choose_path(self.copy_enabled, self.copy_min_rows, rows.len()) == WritePath::Copy {
            match self.upsert_copy(state, rows, &is_fk_extract_field).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(error = %err, "copy path failed, retrying via parameterized upsert");
                }
            }
        }

        self.upsert_parameterized(state, rows, &is_fk_extract_field).await
    }

    async fn upsert_copy(
        &self,
        state: &TableState,
        rows: &[DocumentRow],
        is_fk_extract_field: &impl Fn(&str) -> bool,
    ) -> Result<(), WriterError> {
        let ordered = state.ordered_fields();
        let quoted_table = quote_ident(&state.table);
        let staging = format!("stg_{}", sanitize_staging_suffix(&state.table));
        let quoted_staging = quote_ident(&staging);

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {quoted_staging}"))
            .execute(&mut tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TEMP TABLE {quoted_staging} (LIKE {quoted_table}) ON COMMIT DROP"
        ))
        .execute(&mut tx)
        .await?;

        let mut buffer = String::new();
        for row in rows {
            let mut line_fields = Vec::with_capacity(ordered.len() + 1);
            line_fields.push(encode_copy_field(&Encoded::Text(row.id.clone())));
            for (field, _column, sink_type) in &ordered {
                let value = row
                    .fields
                    .iter()
                    .find(|(f, _)| f == field)
                    .map(|(_, v)| v)
                    .unwrap_or(&Value::Null);
                let encoded = encode(value, *sink_type, is_fk_extract_field(field))?;
                line_fields.push(encode_copy_field(&encoded));
            }
            buffer.push_str(&line_fields.join("\t"));
            buffer.push('\n');
        }

        let copy_sql = format!(
            "COPY {quoted_staging} FROM STDIN WITH (FORMAT text, DELIMITER E'\\t', NULL '\\N')"
        );
        let mut copy_in = tx.copy_in_raw(&copy_sql).await?;
        copy_in.send(buffer.into_bytes()).await?;
        copy_in.finish().await?;

        let column_names: Vec<String> = ordered.iter().map(|(_, c, _)| (*c).to_string()).collect();
        let upsert_sql = if column_names.is_empty() {
            format!(
                "INSERT INTO {quoted_table} (_id) SELECT _id FROM {quoted_staging} \
                 ON CONFLICT (_id) DO NOTHING"
            )
        } else {
            let quoted_cols = column_names
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let assignments = column_names
                .iter()
                .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {quoted_table} (_id, {quoted_cols}) \
                 SELECT _id, {quoted_cols} FROM {quoted_staging} \
                 ON CONFLICT (_id) DO UPDATE SET {assignments}"
            )
        };
        sqlx::query(&upsert_sql).execute(&mut tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_parameterized(
        &self,
        state: &TableState,
        rows: &[DocumentRow],
        is_fk_extract_field: &impl Fn(&str) -> bool,
    ) -> Result<(), WriterError> {
        let ordered = state.ordered_fields();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let mut query = sqlx::query(state.upsert_sql()).bind(row.id.clone());
            for (field, _column, sink_type) in &ordered {
                let value = row
                    .fields
                    .iter()
                    .find(|(f, _)| f == field)
                    .map(|(_, v)| v)
                    .unwrap_or(&Value::Null);
                let encoded = encode(value, *sink_type, is_fk_extract_field(field))?;
                query = bind_encoded(query, encoded);
            }
            query.execute(&mut tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn bind_encoded<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    encoded: Encoded,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    match encoded {
        Encoded::Null => query.bind(Option::<String>::None),
        Encoded::Bool(b) => query.bind(b),
        Encoded::BigInt(i) => query.bind(i),
        Encoded::Double(f) => query.bind(f),
        Encoded::Numeric(d) => query.bind(d),
        Encoded::Timestamptz(t) => query.bind(t),
        Encoded::Text(s) => query.bind(s),
        Encoded::Bytea(b) => query.bind(b),
        Encoded::Jsonb(j) => query.bind(j),
    }
}

fn sanitize_staging_suffix(table: &str) -> String {
    table.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePath {
    Copy,
    Parameterized,
}

/// Which path `upsert_batch` takes for a batch of `row_count` documents.
/// Pure, so the threshold behavior is covered without a database: copy is
/// only chosen when enabled and the batch meets `copy_min_rows`, since the
/// staging-table round trip only pays for itself on larger batches.
fn choose_path(copy_enabled: bool, copy_min_rows: usize, row_count: usize) -> WritePath {
    if copy_enabled && row_count >= copy_min_rows {
        WritePath::Copy
    } else {
        WritePath::Parameterized
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn staging_suffix_strips_quotes_and_punctuation() {
        assert_eq!(sanitize_staging_suffix("widgets"), "widgets");
    }

    #[test]
    fn choose_path_is_parameterized_when_copy_disabled() {
        assert_eq!(choose_path(false, 1, 1000), WritePath::Parameterized);
    }

    #[test]
    fn choose_path_is_parameterized_below_threshold() {
        assert_eq!(choose_path(true, 100, 50), WritePath::Parameterized);
    }

    #[test]
    fn choose_path_is_copy_at_or_above_threshold() {
        assert_eq!(choose_path(true, 100, 100), WritePath::Copy);
        assert_eq!(choose_path(true, 100, 500), WritePath::Copy);
    }
}
