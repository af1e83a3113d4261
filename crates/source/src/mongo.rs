//! The only real [`SourceClient`]: a thin wrapper over `mongodb::Client`.

use crate::{ChangeBatchItem, ChangeEvent, SourceClient, SourceDocument, SourceError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use mongodb::bson::{self, doc, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Client;
use sink_types::{document_fields, stringify_id, Value};

pub struct MongoSource {
    client: Client,
    db_name: String,
}

impl MongoSource {
    pub fn new(client: Client, db_name: impl Into<String>) -> Self {
        Self {
            client,
            db_name: db_name.into(),
        }
    }

    fn db(&self) -> mongodb::Database {
        self.client.database(&self.db_name)
    }
}

fn to_source_document(doc: Document) -> SourceDocument {
    let mut fields = document_fields(doc);
    let id_value = fields
        .iter()
        .position(|(k, _)| k == "_id")
        .map(|i| fields.remove(i).1)
        .unwrap_or(Value::Null);
    SourceDocument {
        id: stringify_id(&id_value),
        fields,
    }
}

/// The driver doesn't expose a standalone "current resume token" accessor
/// that survives past the borrowed stream, so we read it back out of the
/// event's own `_id` field, which *is* the resume token per the change
/// streams spec.
fn event_resume_token(event: &ChangeStreamEvent<Document>) -> Vec<u8> {
    bson::to_document(event)
        .ok()
        .and_then(|d| d.get_document("_id").ok().cloned())
        .and_then(|token| bson::to_vec(&token).ok())
        .unwrap_or_default()
}

fn classify(event: ChangeStreamEvent<Document>) -> ChangeEvent {
    let collection = event.ns.as_ref().and_then(|ns| ns.coll.clone()).unwrap_or_default();
    match event.operation_type {
        OperationType::Insert | OperationType::Replace | OperationType::Update => {
            match event.full_document {
                Some(doc) => ChangeEvent::Upsert {
                    collection,
                    document: to_source_document(doc),
                },
                None => ChangeEvent::Other {
                    operation_type: "update-without-full-document".to_string(),
                },
            }
        }
        OperationType::Delete => {
            let id = event
                .document_key
                .and_then(|key| key.get("_id").cloned())
                .map(|bson| stringify_id(&Value::from(bson)))
                .unwrap_or_default();
            ChangeEvent::Delete { collection, id }
        }
        other => ChangeEvent::Other {
            operation_type: format!("{other:?}"),
        },
    }
}

#[async_trait]
impl SourceClient for MongoSource {
    async fn list_collections(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.db().list_collection_names(None).await?)
    }

    async fn scan_collection(
        &self,
        collection: &str,
    ) -> Result<BoxStream<'_, Result<SourceDocument, SourceError>>, SourceError> {
        let cursor = self
            .db()
            .collection::<Document>(collection)
            .find(doc! {}, None)
            .await?;
        let stream = cursor.map(|item| item.map(to_source_document).map_err(SourceError::from));
        Ok(stream.boxed())
    }

    async fn watch(
        &self,
        filter: Option<&[String]>,
        resume_token: Option<Vec<u8>>,
    ) -> Result<BoxStream<'_, Result<ChangeBatchItem, SourceError>>, SourceError> {
        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();

        if let Some(token_bytes) = resume_token {
            let token_doc: Document = bson::from_slice(&token_bytes)
                .map_err(|e| SourceError::InvalidResumeToken(e.to_string()))?;
            options.resume_after = Some(token_doc);
        }

        let pipeline = match filter {
            Some(collections) => vec![doc! { "$match": { "ns.coll": { "$in": collections } } }],
            None => Vec::new(),
        };

        let change_stream = self.db().watch(pipeline, options).await?;

        let items = stream::unfold(change_stream, |mut cs| async move {
            match cs.next().await {
                Some(Ok(event)) => {
                    let resume_token = event_resume_token(&event);
                    let item = ChangeBatchItem {
                        event: classify(event),
                        resume_token,
                    };
                    Some((Ok(item), cs))
                }
                Some(Err(err)) => Some((Err(SourceError::from(err)), cs)),
                None => None,
            }
        });

        Ok(items.boxed())
    }
}
