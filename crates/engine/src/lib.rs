//! The worker core (C8 backfill driver, C9 change-stream consumer):
//! single-writer, cooperative scheduling over one sink connection pool. See
//! SPEC_FULL.md §4.8, §4.9, §5.

mod resume;

pub use resume::resume_scope;

use futures::StreamExt;
use junctions::JunctionProjector;
use projection::ProjectionConfig;
use schema::SchemaManager;
use sink_types::{quote_ident, Value};
use source::{ChangeEvent, SourceClient, SourceDocument, SourceError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use writer::{BulkWriter, DocumentRow, WriterError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] schema::SchemaError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Junction(#[from] junctions::JunctionError),
    #[error(transparent)]
    Registry(#[from] registry::RegistryError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The delay between reconnect/retry attempts on either a source-side or
/// sink-side error in the change-stream loop (§4.9).
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct Engine {
    source: Arc<dyn SourceClient>,
    schema: SchemaManager,
    writer: BulkWriter,
    projection: ProjectionConfig,
    batch_size: usize,
}

impl Engine {
    pub fn new(
        source: Arc<dyn SourceClient>,
        schema: SchemaManager,
        writer: BulkWriter,
        projection: ProjectionConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            schema,
            writer,
            projection,
            batch_size,
        }
    }

    /// Runs the backfill driver (§4.8) over `collections`, in order.
    /// Failures propagate; a full re-run is idempotent because `_id` is the
    /// sink's primary key.
    pub async fn backfill(&mut self, collections: &[String]) -> Result<(), EngineError> {
        for collection in collections {
            self.backfill_collection(collection).await?;
        }
        Ok(())
    }

    async fn backfill_collection(&mut self, collection: &str) -> Result<(), EngineError> {
        let mut stream = self.source.scan_collection(collection).await?;
        let mut batch: Vec<SourceDocument> = Vec::with_capacity(self.batch_size);

        while let Some(doc) = stream.next().await {
            batch.push(doc?);
            if batch.len() >= self.batch_size {
                self.flush_batch(collection, &batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.flush_batch(collection, &batch).await?;
        }
        Ok(())
    }

    /// Runs C5 (schema widening) against every document, flushes through C6
    /// (bulk write), then runs C7 (junction projection) per document.
    async fn flush_batch(
        &mut self,
        collection: &str,
        batch: &[SourceDocument],
    ) -> Result<(), EngineError> {
        let mut rows = Vec::with_capacity(batch.len());
        for doc in batch {
            let schema_fields = non_junction_fields(&self.projection, collection, &doc.fields);
            let projection = &self.projection;
            self.schema
                .apply_document(collection, &schema_fields, |field| {
                    projection.is_fk_extract_field(collection, field)
                })
                .await?;
            rows.push(DocumentRow {
                id: doc.id.clone(),
                fields: schema_fields,
            });
        }

        let state = self.schema.table_state(collection).await?.clone();
        let projection = &self.projection;
        self.writer
            .upsert_batch(&state, &rows, |field| {
                projection.is_fk_extract_field(collection, field)
            })
            .await?;

        let registry = self.schema.registry();
        let projector = JunctionProjector::new(registry, &self.projection);
        for doc in batch {
            projector.project(collection, &doc.id, &doc.fields).await?;
        }

        Ok(())
    }

    async fn delete_row(&mut self, collection: &str, id: &str) -> Result<(), EngineError> {
        let state = self.schema.table_state(collection).await?;
        let sql = format!("DELETE FROM {} WHERE _id = $1", quote_ident(&state.table));
        sqlx::query(&sql)
            .bind(id)
            .execute(self.schema.registry().pool())
            .await?;
        Ok(())
    }

    /// Runs the change-stream consumer (§4.9) until `shutdown` resolves.
    /// `collections` scopes both the filter passed to the source and the
    /// resume-token scope name; `None` means "all collections in the db".
    pub async fn watch(
        &mut self,
        db_name: &str,
        collections: Option<Vec<String>>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), EngineError> {
        tokio::pin!(shutdown);
        let scope = resume_scope(db_name, collections.as_deref());
        let mut resume_token = self.schema.registry().load_resume_token(&scope).await?;

        'reconnect: loop {
            let opened = self.source.watch(collections.as_deref(), resume_token.clone()).await;
            let stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "change stream open failed; reconnecting fresh");
                    resume_token = None;
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_DELAY) => continue 'reconnect,
                        _ = &mut shutdown => return Ok(()),
                    }
                }
            };
            tokio::pin!(stream);

            loop {
                let next = tokio::select! {
                    item = stream.next() => item,
                    _ = &mut shutdown => return Ok(()),
                };

                let item = match next {
                    None => continue 'reconnect,
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "change stream read failed; reconnecting fresh");
                        resume_token = None;
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue 'reconnect;
                    }
                    Some(Ok(item)) => item,
                };

                match self.dispatch_event(&item.event).await {
                    Ok(()) => {
                        self.schema
                            .registry()
                            .save_resume_token(&scope, &item.resume_token)
                            .await?;
                        resume_token = Some(item.resume_token);
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            "sink error processing change event; retrying without advancing token"
                        );
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue 'reconnect;
                    }
                }
            }
        }
    }

    async fn dispatch_event(&mut self, event: &ChangeEvent) -> Result<(), EngineError> {
        match event {
            ChangeEvent::Upsert { collection, document } => {
                self.flush_batch(collection, std::slice::from_ref(document)).await
            }
            ChangeEvent::Delete { collection, id } => self.delete_row(collection, id).await,
            ChangeEvent::Other { operation_type } => {
                tracing::info!(operation_type, "skipping unhandled change-stream event");
                Ok(())
            }
        }
    }
}

/// Drops fields declared as junction fields for `collection` — they never
/// become a column of the parent table (§3).
fn non_junction_fields(
    projection: &ProjectionConfig,
    collection: &str,
    fields: &[(String, Value)],
) -> Vec<(String, Value)> {
    fields
        .iter()
        .filter(|(field, _)| projection.junction_target(collection, field).is_none())
        .cloned()
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn non_junction_fields_is_identity_with_no_declared_junctions() {
        let projection = ProjectionConfig::default();
        let fields = vec![
            ("color".to_string(), Value::String("red".into())),
            ("branch".to_string(), Value::Int(1)),
        ];
        let kept = non_junction_fields(&projection, "users", &fields);
        assert_eq!(kept, fields);
    }

    /// S3 (array-of-reference projection): a field declared as a junction
    /// never becomes a column on the parent table, regardless of the value
    /// it carries in any given document.
    #[test]
    fn non_junction_fields_drops_declared_junction_field() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "junction_fields:\n  users:\n    branches: branches\n"
        )
        .unwrap();
        let projection = ProjectionConfig::load(Some(file.path())).unwrap();

        let fields = vec![
            ("color".to_string(), Value::String("red".into())),
            (
                "branches".to_string(),
                Value::Array(vec![Value::ObjectId("507f1f77bcf86cd799439011".into())]),
            ),
        ];
        let kept = non_junction_fields(&projection, "users", &fields);
        assert_eq!(kept, vec![("color".to_string(), Value::String("red".into()))]);
    }

    /// S6 (resume respects collection scope): a filtered watch only ever
    /// dispatches events for collections in the filter, and the resume
    /// scope name used to persist a token for that filter is stable and
    /// order-independent (see resume::test for the hashing itself).
    #[tokio::test]
    async fn filtered_watch_only_sees_collections_in_scope() {
        use source::InMemorySource;

        let source = InMemorySource::new().with_events(vec![
            ChangeEvent::Delete {
                collection: "widgets".into(),
                id: "1".into(),
            },
            ChangeEvent::Delete {
                collection: "gadgets".into(),
                id: "2".into(),
            },
        ]);
        let filter = vec!["widgets".to_string()];
        let mut stream = source.watch(Some(&filter), None).await.unwrap();
        let item = stream.next().await.unwrap().unwrap();
        match item.event {
            ChangeEvent::Delete { collection, id } => {
                assert_eq!(collection, "widgets");
                assert_eq!(id, "1");
            }
            _ => panic!("expected delete"),
        }
        assert!(stream.next().await.is_none(), "gadgets event must be filtered out");
    }
}
