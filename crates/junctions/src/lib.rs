//! The junction projector (C7): maintains auxiliary edge tables for
//! declared array-of-reference fields by full delete-then-insert
//! replacement per parent row. See SPEC_FULL.md §4.7, §3.

use projection::ProjectionConfig;
use registry::{Registry, RegistryError};
use sink_types::{extract_reference, quote_ident, sanitize_identifier, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JunctionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct JunctionProjector<'a> {
    registry: &'a Registry,
    projection: &'a ProjectionConfig,
}

impl<'a> JunctionProjector<'a> {
    pub fn new(registry: &'a Registry, projection: &'a ProjectionConfig) -> Self {
        Self { registry, projection }
    }

    /// Re-derives every junction row for `parent_id` in `collection` from
    /// `fields`, one field at a time. Fields not declared as junctions in
    /// the projection config are ignored entirely — this only ever touches
    /// tables for fields the operator opted into.
    pub async fn project(
        &self,
        collection: &str,
        parent_id: &str,
        fields: &[(String, Value)],
    ) -> Result<(), JunctionError> {
        for (field, target_collection) in self.projection.junction_fields_for(collection) {
            let value = fields
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, v)| v);
            self.project_field(collection, parent_id, field, target_collection, value)
                .await?;
        }
        Ok(())
    }

    async fn project_field(
        &self,
        collection: &str,
        parent_id: &str,
        field: &str,
        target_collection: &str,
        value: Option<&Value>,
    ) -> Result<(), JunctionError> {
        let elements = elements_of(value);
        let targets: Vec<String> = elements.iter().filter_map(extract_reference).collect();

        let parent_table = self.resolve_table_name(collection).await?;
        let target_table = self.resolve_table_name(target_collection).await?;

        let junction_table = junction_table_name(&parent_table, field);
        let parent_column = sanitize_identifier(&format!("{parent_table}_id"), "parent_id");
        let target_column = sanitize_identifier(&format!("{target_table}_id"), "target_id");

        self.ensure_junction_table(&junction_table, &parent_column, &target_column)
            .await?;

        let quoted_junction = quote_ident(&junction_table);
        let quoted_parent_col = quote_ident(&parent_column);
        let quoted_target_col = quote_ident(&target_column);
        let mut tx = self.registry.pool().begin().await?;

        sqlx::query(&format!(
            "DELETE FROM {quoted_junction} WHERE {quoted_parent_col} = $1"
        ))
        .bind(parent_id)
        .execute(&mut tx)
        .await?;

        if !targets.is_empty() {
            let mut sql = format!(
                "INSERT INTO {quoted_junction} ({quoted_parent_col}, {quoted_target_col}) VALUES "
            );
            let mut binds = Vec::with_capacity(targets.len());
            for (i, target_id) in targets.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                let base = i * 2;
                sql.push_str(&format!("(${}, ${})", base + 1, base + 2));
                binds.push((parent_id.to_string(), target_id.clone()));
            }
            sql.push_str(" ON CONFLICT DO NOTHING");

            let mut query = sqlx::query(&sql);
            for (p, t) in binds {
                query = query.bind(p).bind(t);
            }
            query.execute(&mut tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// The registered sink table name for `collection`, falling back to the
    /// sanitized collection name itself if it isn't registered yet — the
    /// table is ensured when that collection is first seen regardless.
    async fn resolve_table_name(&self, collection: &str) -> Result<String, JunctionError> {
        Ok(self
            .registry
            .existing_table_name(collection)
            .await?
            .unwrap_or_else(|| sanitize_identifier(collection, "collection")))
    }

    async fn ensure_junction_table(
        &self,
        junction_table: &str,
        parent_column: &str,
        target_column: &str,
    ) -> Result<(), JunctionError> {
        let quoted = quote_ident(junction_table);
        let quoted_parent = quote_ident(parent_column);
        let quoted_target = quote_ident(target_column);

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {quoted} (
                {quoted_parent} TEXT NOT NULL,
                {quoted_target} TEXT NOT NULL,
                PRIMARY KEY ({quoted_parent}, {quoted_target})
            )
            "#
        ))
        .execute(self.registry.pool())
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {quoted} ({quoted_parent})",
            quote_ident(&format!("{junction_table}_parent_idx"))
        ))
        .execute(self.registry.pool())
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {quoted} ({quoted_target})",
            quote_ident(&format!("{junction_table}_target_idx"))
        ))
        .execute(self.registry.pool())
        .await?;

        Ok(())
    }
}

/// A junction field's value reduced to a list of elements to extract
/// references from: missing/null becomes empty, a scalar is wrapped as a
/// single-element array, and an array is used as-is.
fn elements_of(value: Option<&Value>) -> Vec<Value> {
    match value {
        None => Vec::new(),
        Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(scalar) => vec![scalar.clone()],
    }
}

/// `{parent_table}_{field}`, per §3 — named from the resolved parent
/// *table*, not the raw collection name, so it tracks table renames caused
/// by identifier collisions.
fn junction_table_name(parent_table: &str, field: &str) -> String {
    sanitize_identifier(&format!("{parent_table}_{field}"), "junction")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn elements_of_missing_is_empty() {
        assert!(elements_of(None).is_empty());
        assert!(elements_of(Some(&Value::Null)).is_empty());
    }

    #[test]
    fn elements_of_scalar_wraps_single() {
        let v = Value::String("abc".into());
        assert_eq!(elements_of(Some(&v)), vec![v]);
    }

    #[test]
    fn elements_of_array_passes_through() {
        let v = Value::Array(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(elements_of(Some(&v)), vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn junction_table_name_uses_parent_table() {
        assert_eq!(junction_table_name("orders", "tags"), "orders_tags");
    }

    #[test]
    fn column_names_are_sanitized_per_side() {
        let parent_col = sanitize_identifier(&format!("{}_id", "orders"), "parent_id");
        let target_col = sanitize_identifier(&format!("{}_id", "branches"), "target_id");
        assert_eq!(parent_col, "orders_id");
        assert_eq!(target_col, "branches_id");
    }
}
