//! The source client (C10): the trait boundary between the engine and a
//! live MongoDB deployment, plus an in-memory fake for tests. See
//! SPEC_FULL.md §4.10.

mod memory;
mod mongo;

pub use memory::InMemorySource;
pub use mongo::MongoSource;

use async_trait::async_trait;
use futures::stream::BoxStream;
use sink_types::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("malformed resume token: {0}")]
    InvalidResumeToken(String),
}

/// A document read from the source, reduced to its stringified `_id` and
/// its remaining top-level fields. `_id` is never present in `fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub fields: Vec<(String, Value)>,
}

/// One change-stream event, already classified per the dispatch table of
/// §4.9. `other` collapses rename/drop/invalidate/etc., which the engine
/// only logs and skips.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Upsert {
        collection: String,
        document: SourceDocument,
    },
    Delete {
        collection: String,
        id: String,
    },
    Other {
        operation_type: String,
    },
}

/// A single change-stream event paired with the resume token that should be
/// persisted once the engine has finished processing it.
#[derive(Debug, Clone)]
pub struct ChangeBatchItem {
    pub event: ChangeEvent,
    pub resume_token: Vec<u8>,
}

/// The three operations the backfill driver (C8) and change-stream
/// consumer (C9) need from a source. The only real implementation is
/// [`MongoSource`]; [`InMemorySource`] substitutes for it in tests.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn list_collections(&self) -> Result<Vec<String>, SourceError>;

    /// Streams every document in `collection`, in natural order, with no
    /// further ordering guarantee.
    async fn scan_collection(
        &self,
        collection: &str,
    ) -> Result<BoxStream<'_, Result<SourceDocument, SourceError>>, SourceError>;

    /// Opens a change stream, optionally scoped to `filter`'s collection
    /// names and optionally resuming from `resume_token`.
    async fn watch(
        &self,
        filter: Option<&[String]>,
        resume_token: Option<Vec<u8>>,
    ) -> Result<BoxStream<'_, Result<ChangeBatchItem, SourceError>>, SourceError>;
}
