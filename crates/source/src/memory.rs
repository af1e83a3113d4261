//! An in-memory [`SourceClient`] fake so the engine's tests can exercise
//! backfill and change-stream dispatch without a live MongoDB deployment.

use crate::{ChangeBatchItem, ChangeEvent, SourceClient, SourceDocument, SourceError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemorySource {
    collections: HashMap<String, Vec<SourceDocument>>,
    /// The full change log, in delivery order. `watch` replays from just
    /// after the event whose `resume_token` matches the caller's, or from
    /// the start if no token is given or it isn't found.
    events: Mutex<Vec<ChangeBatchItem>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, docs: Vec<SourceDocument>) -> Self {
        self.collections.insert(name.into(), docs);
        self
    }

    pub fn with_events(self, events: Vec<ChangeEvent>) -> Self {
        let items = events
            .into_iter()
            .enumerate()
            .map(|(i, event)| ChangeBatchItem {
                event,
                resume_token: (i as u64).to_be_bytes().to_vec(),
            })
            .collect();
        *self.events.lock().unwrap() = items;
        self
    }
}

#[async_trait]
impl SourceClient for InMemorySource {
    async fn list_collections(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.collections.keys().cloned().collect())
    }

    async fn scan_collection(
        &self,
        collection: &str,
    ) -> Result<BoxStream<'_, Result<SourceDocument, SourceError>>, SourceError> {
        let docs = self.collections.get(collection).cloned().unwrap_or_default();
        Ok(stream::iter(docs.into_iter().map(Ok)).boxed())
    }

    async fn watch(
        &self,
        filter: Option<&[String]>,
        resume_token: Option<Vec<u8>>,
    ) -> Result<BoxStream<'_, Result<ChangeBatchItem, SourceError>>, SourceError> {
        let events = self.events.lock().unwrap().clone();
        let start = resume_token
            .and_then(|token| events.iter().position(|item| item.resume_token == token))
            .map(|i| i + 1)
            .unwrap_or(0);

        let filter_names: Option<Vec<String>> = filter.map(|f| f.to_vec());
        let filtered: Vec<ChangeBatchItem> = events
            .into_iter()
            .skip(start)
            .filter(|item| match (&filter_names, &item.event) {
                (Some(names), ChangeEvent::Upsert { collection, .. }) => names.contains(collection),
                (Some(names), ChangeEvent::Delete { collection, .. }) => names.contains(collection),
                _ => true,
            })
            .collect();

        Ok(stream::iter(filtered.into_iter().map(Ok)).boxed())
    }
}
