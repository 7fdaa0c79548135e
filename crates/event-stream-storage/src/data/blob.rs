// File: src/data/blob.rs
//
// Blob-substrate event streams: one JSON container object per stream
// (or per chunk), rewritten wholesale under ETag preconditions.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::model::{Event, ObjectDocument, UNCOMMITTED_HASH};
use event_stream_core::serializer::EventStreamRecord;
use event_stream_core::substrate::{KvBlob, Precondition};

use super::{in_range, stamp_timestamps, validate_append, DataStore, EventReadStream};
use crate::cancel::guard;
use crate::containers::ensure_blob_container;

/// Event stream store writing one JSON blob per stream chunk
pub struct BlobDataStore {
    blob: Arc<dyn KvBlob>,
    container: String,
    auto_create: bool,
}

impl BlobDataStore {
    pub fn new(blob: Arc<dyn KvBlob>, container: impl Into<String>) -> Self {
        Self {
            blob,
            container: container.into(),
            auto_create: false,
        }
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.container)
    }

    fn conflict(&self, document: &ObjectDocument) -> StoreError {
        StoreError::ConcurrencyConflict {
            message: format!(
                "stream {} was modified since the document was loaded",
                document.active.stream_id
            ),
        }
    }

    fn stream_blob_path(document: &ObjectDocument, chunk: Option<i32>) -> String {
        let logical = match chunk {
            Some(chunk_id) => document.active.chunk_data_path(chunk_id),
            None => document.active.data_path(),
        };
        format!("{}.json", logical.to_lowercase())
    }

    /// Path an append lands in: the chunk covering the first new
    /// version, so a freshly rolled empty tail never swallows events
    /// that belong to its predecessor.
    fn append_blob_path(document: &ObjectDocument, first_version: i64) -> String {
        let chunk = if document.active.chunking_enabled {
            document
                .active
                .chunk_for_append(first_version)
                .map(|chunk| chunk.chunk_id)
        } else {
            None
        };
        Self::stream_blob_path(document, chunk)
    }

    /// Load a container record, or `None` when the blob is absent
    async fn load_record(
        &self,
        path: &str,
        precondition: &Precondition,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<(EventStreamRecord, String)>> {
        match self.blob.read(&self.container, path, precondition, ctx).await {
            Ok(content) => {
                let record = EventStreamRecord::from_bytes(&content.data)?;
                Ok(Some((record, content.etag)))
            }
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => Ok(None),
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}

#[async_trait]
impl DataStore for BlobDataStore {
    async fn append(
        &self,
        document: &ObjectDocument,
        preserve_timestamps: bool,
        mut events: Vec<Event>,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        validate_append(document, &events)?;
        stamp_timestamps(&mut events, preserve_timestamps);
        ensure_blob_container(self.blob.as_ref(), &self.container, self.auto_create, ctx).await?;
        guard(ctx, "append")?;

        let path = Self::append_blob_path(document, events[0].event_version);
        let properties = match self.blob.get_properties(&self.container, &path, ctx).await {
            Ok(properties) => properties,
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => {
                // First append on this chunk: create-if-absent so a
                // racing bootstrap loses cleanly.
                let mut record = EventStreamRecord::new(
                    document.object_id.clone(),
                    document.object_name.clone(),
                    document.hash_or_star(),
                );
                let count = events.len();
                record.events = events;
                guard(ctx, "append")?;
                return match self
                    .blob
                    .write(
                        &self.container,
                        &path,
                        record.to_bytes()?,
                        &Precondition::CreateOnly,
                        ctx,
                    )
                    .await
                {
                    Ok(_) => {
                        info!(
                            stream = document.active.stream_id.as_str(),
                            events = count,
                            "bootstrapped event stream"
                        );
                        Ok(())
                    }
                    Err(SubstrateError::PreconditionFailed) | Err(SubstrateError::Conflict) => {
                        Err(self.conflict(document))
                    }
                    Err(other) => Err(self.map_substrate(other)),
                };
            }
            Err(other) => return Err(self.map_substrate(other)),
        };

        guard(ctx, "append")?;
        let (mut record, etag) = match self
            .load_record(&path, &Precondition::match_version(properties.etag), ctx)
            .await
        {
            Ok(Some(loaded)) => loaded,
            // Deleted between the properties call and the read.
            Ok(None) => return Err(self.conflict(document)),
            Err(StoreError::ConcurrencyConflict { .. }) => return Err(self.conflict(document)),
            Err(other) => return Err(other),
        };

        if record.last_event().is_some_and(Event::is_stream_closure) {
            return Err(StoreError::StreamClosed {
                stream_id: document.active.stream_id.clone(),
            });
        }
        let stored_hash = record.last_object_document_hash.as_str();
        if stored_hash != UNCOMMITTED_HASH && Some(stored_hash) != document.prev_hash.as_deref() {
            return Err(self.conflict(document));
        }

        let count = events.len();
        record.events.append(&mut events);
        record.last_object_document_hash = document.hash_or_star();
        guard(ctx, "append")?;
        match self
            .blob
            .write(
                &self.container,
                &path,
                record.to_bytes()?,
                &Precondition::match_version(etag),
                ctx,
            )
            .await
        {
            Ok(_) => {
                debug!(
                    stream = document.active.stream_id.as_str(),
                    events = count,
                    "appended events"
                );
                Ok(())
            }
            Err(SubstrateError::PreconditionFailed) | Err(SubstrateError::Conflict) => {
                Err(self.conflict(document))
            }
            Err(other) => Err(self.map_substrate(other)),
        }
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        chunk: Option<i32>,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<Vec<Event>>> {
        guard(ctx, "read")?;
        let path = Self::stream_blob_path(document, chunk);
        let Some((record, _)) = self.load_record(&path, &Precondition::None, ctx).await? else {
            return Ok(None);
        };
        Ok(Some(
            record
                .events
                .into_iter()
                .filter(|event| in_range(event.event_version, start_version, until_version))
                .collect(),
        ))
    }

    fn read_stream(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        ctx: CancellationToken,
    ) -> EventReadStream {
        let blob = Arc::clone(&self.blob);
        let container = self.container.clone();
        let path = Self::stream_blob_path(document, None);

        // The blob substrate has no server-side event pagination: the
        // container is fetched once, then yielded per event.
        let stream = async_stream::try_stream! {
            guard(&ctx, "read stream")?;
            let content = match blob.read(&container, &path, &Precondition::None, &ctx).await {
                Ok(content) => Some(content),
                Err(SubstrateError::NotFound { kind: NotFoundKind::Blob }) => None,
                Err(other) => Err(StoreError::from_substrate(other, &container))?,
            };
            if let Some(content) = content {
                let record = EventStreamRecord::from_bytes(&content.data)?;
                for event in record.events {
                    guard(&ctx, "read stream")?;
                    if in_range(event.event_version, start_version, until_version) {
                        yield event;
                    }
                }
            }
        };
        stream.boxed()
    }

    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        from_version: i64,
        to_version: i64,
        ctx: &CancellationToken,
    ) -> StoreResult<usize> {
        guard(ctx, "remove events")?;
        let path = Self::stream_blob_path(document, None);
        let Some((mut record, etag)) = self.load_record(&path, &Precondition::None, ctx).await?
        else {
            return Ok(0);
        };

        let before = record.events.len();
        record
            .events
            .retain(|event| !in_range(event.event_version, from_version, Some(to_version)));
        let removed = before - record.events.len();
        if removed == 0 {
            return Ok(0);
        }

        guard(ctx, "remove events")?;
        match self
            .blob
            .write(
                &self.container,
                &path,
                record.to_bytes()?,
                &Precondition::match_version(etag),
                ctx,
            )
            .await
        {
            Ok(_) => {
                info!(
                    stream = document.active.stream_id.as_str(),
                    from = from_version,
                    to = to_version,
                    removed = removed,
                    "removed events for failed commit"
                );
                Ok(removed)
            }
            Err(SubstrateError::PreconditionFailed) | Err(SubstrateError::Conflict) => {
                Err(self.conflict(document))
            }
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_stream_core::substrate::InMemoryBlobStore;
    use serde_json::json;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn store() -> BlobDataStore {
        let blob = Arc::new(InMemoryBlobStore::new());
        blob.create_container_if_not_exists("items", &ctx())
            .await
            .unwrap();
        BlobDataStore::new(blob, "items")
    }

    fn document() -> ObjectDocument {
        ObjectDocument::new("Item", "A", false, 0)
    }

    #[tokio::test]
    async fn bootstrap_append_creates_the_container_document() {
        let store = store().await;
        let document = document();
        store
            .append(
                &document,
                false,
                vec![Event::new(0, "Created", json!({"x": 1}))],
                &ctx(),
            )
            .await
            .unwrap();

        let content = store
            .blob
            .read("items", "a-0000000000.json", &Precondition::None, &ctx())
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&content.data).unwrap();
        assert_eq!(value["objectId"], "A");
        assert_eq!(value["objectName"], "Item");
        assert_eq!(value["lastObjectDocumentHash"], "*");
        assert_eq!(value["events"][0]["eventVersion"], 0);
    }

    #[tokio::test]
    async fn empty_append_is_invalid() {
        let store = store().await;
        let error = store
            .append(&document(), false, vec![], &ctx())
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn append_to_closed_stream_is_rejected() {
        let store = store().await;
        let document = document();
        store
            .append(
                &document,
                false,
                vec![
                    Event::new(0, "Created", json!({})),
                    Event::stream_closed(1, "done"),
                ],
                &ctx(),
            )
            .await
            .unwrap();

        let error = store
            .append(
                &document,
                false,
                vec![Event::new(2, "TooLate", json!({}))],
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::StreamClosed { .. }));

        // No write happened.
        let events = store
            .read(&document, 0, None, None, &ctx())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn stale_document_hash_is_a_conflict() {
        let store = store().await;
        let mut document = document();
        document.hash = Some("hash-a".to_string());
        store
            .append(&document, false, vec![Event::new(0, "Created", json!({}))], &ctx())
            .await
            .unwrap();

        // A writer whose document chain does not include hash-a.
        let mut stale = ObjectDocument::new("Item", "A", false, 0);
        stale.hash = Some("hash-x".to_string());
        stale.prev_hash = Some("hash-w".to_string());
        let error = store
            .append(&stale, false, vec![Event::new(1, "Updated", json!({}))], &ctx())
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn read_filters_inclusive_range() {
        let store = store().await;
        let document = document();
        let events: Vec<Event> = (0..5)
            .map(|v| Event::new(v, "E", json!({"v": v})))
            .collect();
        store.append(&document, false, events, &ctx()).await.unwrap();

        let events = store
            .read(&document, 1, Some(3), None, &ctx())
            .await
            .unwrap()
            .unwrap();
        let versions: Vec<i64> = events.iter().map(|e| e.event_version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn read_of_absent_stream_is_none() {
        let store = store().await;
        let result = store.read(&document(), 0, None, None, &ctx()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_stream_yields_lazily_and_honors_cancellation() {
        let store = store().await;
        let document = document();
        let events: Vec<Event> = (0..10).map(|v| Event::new(v, "E", json!({}))).collect();
        store.append(&document, false, events, &ctx()).await.unwrap();

        let token = CancellationToken::new();
        let mut stream = store.read_stream(&document, 0, None, token.clone());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event_version, 0);

        token.cancel();
        let next = stream.next().await.unwrap();
        assert!(matches!(next, Err(StoreError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn failed_commit_removal_is_idempotent() {
        let store = store().await;
        let document = document();
        let events: Vec<Event> = (0..6).map(|v| Event::new(v, "E", json!({}))).collect();
        store.append(&document, false, events, &ctx()).await.unwrap();

        let removed = store
            .remove_events_for_failed_commit(&document, 4, 5, &ctx())
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let removed_again = store
            .remove_events_for_failed_commit(&document, 4, 5, &ctx())
            .await
            .unwrap();
        assert_eq!(removed_again, 0);

        let remaining = store
            .read(&document, 0, None, None, &ctx())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remaining.len(), 4);
    }

    #[tokio::test]
    async fn removal_on_absent_stream_is_a_noop() {
        let store = store().await;
        let removed = store
            .remove_events_for_failed_commit(&document(), 0, 3, &ctx())
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
