// File: src/stream.rs
//
// The event stream facade: one type composed over a data store, a
// snapshot store, and the document store. Substrate differences live
// entirely behind the capability traits; routing picks the data store
// named on the document.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chrono::Utc;
use event_stream_core::error::{StoreError, StoreResult};
use event_stream_core::model::{
    Event, ObjectDocument, Snapshot, StreamChunk, StreamInformation, TerminatedStream,
};

use crate::data::{DataStore, EventReadStream};
use crate::document::DocumentStore;
use crate::snapshot::SnapshotStore;

/// Event stream operations for one object, spanning append, read,
/// snapshotting, and stream closure with continuation.
pub struct EventStream {
    documents: Arc<dyn DocumentStore>,
    default_data: Arc<dyn DataStore>,
    named_data: HashMap<String, Arc<dyn DataStore>>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl EventStream {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        data: Arc<dyn DataStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            documents,
            default_data: data,
            named_data: HashMap::new(),
            snapshots,
        }
    }

    /// Register a data store reachable through the document's store
    /// routing.
    pub fn with_named_data_store(
        mut self,
        name: impl Into<String>,
        data: Arc<dyn DataStore>,
    ) -> Self {
        self.named_data.insert(name.into(), data);
        self
    }

    /// Pick the data store the document routes to, falling back to
    /// the default when the name is unknown or unset.
    fn resolve_data_store(&self, document: &ObjectDocument) -> &Arc<dyn DataStore> {
        match document.active.stores.resolved_data_store() {
            Some(name) => match self.named_data.get(name) {
                Some(store) => store,
                None => {
                    warn!(
                        store = name,
                        stream = document.active.stream_id.as_str(),
                        "document routes to an unregistered data store, using the default"
                    );
                    &self.default_data
                }
            },
            None => &self.default_data,
        }
    }

    /// Append events and advance the document.
    ///
    /// Event versions must be contiguous starting at
    /// `current_version + 1`. The document commits first: a stale
    /// document loses on its version tag before any event is written,
    /// so the loser's events are never observable. When the append
    /// itself fails after the document advanced, the document is
    /// rolled back and any half-committed tail compensated away.
    pub async fn append(
        &self,
        document: &mut ObjectDocument,
        preserve_timestamps: bool,
        events: Vec<Event>,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        if events.is_empty() {
            return Err(StoreError::InvalidArgument {
                message: "append requires at least one event".to_string(),
            });
        }
        let from_version = document.active.current_version + 1;
        let to_version = from_version + events.len() as i64 - 1;
        for (offset, event) in events.iter().enumerate() {
            let expected = from_version + offset as i64;
            if event.event_version != expected {
                return Err(StoreError::InvalidArgument {
                    message: format!(
                        "event version {} does not continue the stream at {}",
                        event.event_version, expected
                    ),
                });
            }
        }

        let version_before = document.active.current_version;
        let chunks_before = document.active.chunks.clone();
        document.active.current_version = to_version;
        if let Some(tail) = document.active.chunks.last_mut() {
            tail.last_event_version = to_version;
        }
        self.roll_chunk_if_full(document);
        if let Err(error) = self.documents.set(document, ctx).await {
            document.active.current_version = version_before;
            document.active.chunks = chunks_before;
            return Err(error);
        }

        let data = self.resolve_data_store(document);
        if let Err(error) = data.append(document, preserve_timestamps, events, ctx).await {
            warn!(
                stream = document.active.stream_id.as_str(),
                from = from_version,
                to = to_version,
                "append failed after the document advanced, compensating"
            );
            document.active.current_version = version_before;
            document.active.chunks = chunks_before;
            let _ = data
                .remove_events_for_failed_commit(document, from_version, to_version, ctx)
                .await;
            let _ = self.documents.set(document, ctx).await;
            return Err(error);
        }
        Ok(())
    }

    /// Seal the tail chunk once it reaches the configured size and
    /// open an empty successor for the next append.
    fn roll_chunk_if_full(&self, document: &mut ObjectDocument) {
        let stream = &mut document.active;
        if !stream.chunking_enabled || stream.chunk_size <= 0 {
            return;
        }
        let Some(tail) = stream.chunks.last() else {
            return;
        };
        if tail.is_empty() {
            return;
        }
        let events_in_tail = tail.last_event_version - tail.first_event_version + 1;
        if events_in_tail >= stream.chunk_size {
            let next = StreamChunk {
                chunk_id: tail.chunk_id + 1,
                first_event_version: tail.last_event_version + 1,
                last_event_version: -1,
            };
            stream.chunks.push(next);
        }
    }

    /// Read events from the active stream
    pub async fn read(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<Vec<Event>>> {
        self.resolve_data_store(document)
            .read(document, start_version, until_version, None, ctx)
            .await
    }

    /// Lazy streaming read from the active stream
    pub fn read_stream(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        ctx: CancellationToken,
    ) -> EventReadStream {
        self.resolve_data_store(document)
            .read_stream(document, start_version, until_version, ctx)
    }

    /// Close the active stream and open its continuation.
    ///
    /// Appends the closure marker, records the terminated stream on
    /// the document, and swaps in a fresh stream pointer whose id
    /// continues the numeric suffix.
    pub async fn close(
        &self,
        document: &mut ObjectDocument,
        reason: impl Into<String>,
        ctx: &CancellationToken,
    ) -> StoreResult<String> {
        let reason = reason.into();
        let closed_version = document.active.current_version + 1;
        let continuation_stream_id = document.next_stream_id()?;

        let data = self.resolve_data_store(document);
        data.append(
            document,
            false,
            vec![Event::stream_closed(closed_version, reason.clone())],
            ctx,
        )
        .await?;

        let previous_active = document.active.clone();
        let closed = TerminatedStream {
            stream_id: document.active.stream_id.clone(),
            reason,
            continuation_stream_id: Some(continuation_stream_id.clone()),
            termination_timestamp: Utc::now(),
            version: closed_version,
            deleted: false,
            deletion_timestamp: None,
        };
        document.terminated_streams.push(closed);

        let mut next = StreamInformation {
            stream_id: continuation_stream_id.clone(),
            current_version: -1,
            chunking_enabled: previous_active.chunking_enabled,
            chunk_size: previous_active.chunk_size,
            chunks: Vec::new(),
            stores: previous_active.stores.clone(),
            types: previous_active.types.clone(),
        };
        if next.chunking_enabled {
            next.chunks.push(StreamChunk::initial());
        }
        document.active = next;

        if let Err(error) = self.documents.set(document, ctx).await {
            // Undo the swap and compensate the closure marker so the
            // stream stays open.
            document.active = previous_active;
            document.terminated_streams.pop();
            let _ = data
                .remove_events_for_failed_commit(document, closed_version, closed_version, ctx)
                .await;
            return Err(error);
        }
        info!(
            continuation = continuation_stream_id.as_str(),
            "closed stream and opened continuation"
        );
        Ok(continuation_stream_id)
    }

    /// Store a snapshot of the aggregate at the stream's current
    /// version.
    pub async fn snapshot(
        &self,
        document: &ObjectDocument,
        data: serde_json::Value,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<Snapshot> {
        let mut snapshot = Snapshot::new(
            document.active.stream_id.clone(),
            document.active.current_version,
            document.object_name.clone(),
            data,
        );
        if let Some(name) = name {
            snapshot = snapshot.with_name(name);
        }
        self.snapshots.set(document, &snapshot, ctx).await?;
        Ok(snapshot)
    }

    /// Load the newest usable snapshot plus the event suffix after it.
    ///
    /// The standard fold path: apply the snapshot, then the returned
    /// events, to materialize the aggregate.
    pub async fn read_from_snapshot(
        &self,
        document: &ObjectDocument,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<(Option<Snapshot>, Vec<Event>)> {
        let snapshot = self
            .snapshots
            .list(document, ctx)
            .await?
            .into_iter()
            .find(|snapshot| {
                snapshot.version <= document.active.current_version
                    && snapshot.name.as_deref() == name
            });

        let start_version = snapshot.as_ref().map(|s| s.version + 1).unwrap_or(0);
        let events = self
            .resolve_data_store(document)
            .read(document, start_version, None, None, ctx)
            .await?
            .unwrap_or_default();
        Ok((snapshot, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BlobDataStore;
    use crate::document::BlobDocumentStore;
    use crate::snapshot::BlobSnapshotStore;
    use crate::tags::BlobTagStore;
    use event_stream_core::substrate::{InMemoryBlobStore, KvBlob};
    use serde_json::json;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn stream() -> EventStream {
        let blob = Arc::new(InMemoryBlobStore::new());
        for container in ["documents", "items", "snapshots"] {
            blob.create_container_if_not_exists(container, &ctx())
                .await
                .unwrap();
        }
        let tags = Arc::new(BlobTagStore::new(blob.clone(), "documents", false));
        let documents = Arc::new(BlobDocumentStore::new(blob.clone(), "documents", tags));
        let data = Arc::new(BlobDataStore::new(blob.clone(), "items"));
        let snapshots = Arc::new(BlobSnapshotStore::new(blob, "snapshots"));
        EventStream::new(documents, data, snapshots)
    }

    #[tokio::test]
    async fn append_advances_the_document() {
        let stream = stream().await;
        let mut document = stream.documents.create("Item", "A", &ctx()).await.unwrap();

        stream
            .append(
                &mut document,
                false,
                vec![
                    Event::new(0, "Created", json!({"x": 1})),
                    Event::new(1, "Updated", json!({"x": 2})),
                ],
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(document.active.current_version, 1);

        let reloaded = stream.documents.get("Item", "A", &ctx()).await.unwrap();
        assert_eq!(reloaded.active.current_version, 1);
    }

    #[tokio::test]
    async fn append_rejects_version_gaps() {
        let stream = stream().await;
        let mut document = stream.documents.create("Item", "A", &ctx()).await.unwrap();
        let error = stream
            .append(
                &mut document,
                false,
                vec![Event::new(5, "Created", json!({}))],
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn close_opens_a_continuation_stream() {
        let stream = stream().await;
        let mut document = stream.documents.create("Item", "A", &ctx()).await.unwrap();
        stream
            .append(
                &mut document,
                false,
                vec![Event::new(0, "Created", json!({}))],
                &ctx(),
            )
            .await
            .unwrap();

        let continuation = stream.close(&mut document, "migrated", &ctx()).await.unwrap();
        assert_eq!(continuation, "A-0000000001");
        assert_eq!(document.active.stream_id, "A-0000000001");
        assert_eq!(document.active.current_version, -1);
        assert_eq!(document.terminated_streams.len(), 1);
        let closed = &document.terminated_streams[0];
        assert_eq!(closed.stream_id, "A-0000000000");
        assert_eq!(closed.version, 1);
        assert_eq!(closed.continuation_stream_id.as_deref(), Some("A-0000000001"));

        // The continuation accepts appends from version 0.
        stream
            .append(
                &mut document,
                false,
                vec![Event::new(0, "Migrated", json!({}))],
                &ctx(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_then_read_from_snapshot() {
        let stream = stream().await;
        let mut document = stream.documents.create("Item", "A", &ctx()).await.unwrap();
        let events: Vec<Event> = (0..4).map(|v| Event::new(v, "E", json!({"v": v}))).collect();
        stream.append(&mut document, false, events, &ctx()).await.unwrap();

        stream
            .snapshot(&document, json!({"sum": 6}), None, &ctx())
            .await
            .unwrap();

        let more: Vec<Event> = (4..6).map(|v| Event::new(v, "E", json!({"v": v}))).collect();
        stream.append(&mut document, false, more, &ctx()).await.unwrap();

        let (snapshot, suffix) = stream
            .read_from_snapshot(&document, None, &ctx())
            .await
            .unwrap();
        assert_eq!(snapshot.unwrap().version, 3);
        let versions: Vec<i64> = suffix.iter().map(|e| e.event_version).collect();
        assert_eq!(versions, vec![4, 5]);
    }

    #[tokio::test]
    async fn chunked_stream_rolls_over_at_chunk_size() {
        let blob = Arc::new(InMemoryBlobStore::new());
        for container in ["documents", "items", "snapshots"] {
            blob.create_container_if_not_exists(container, &ctx())
                .await
                .unwrap();
        }
        let tags = Arc::new(BlobTagStore::new(blob.clone(), "documents", false));
        let documents = Arc::new(
            BlobDocumentStore::new(blob.clone(), "documents", tags).with_chunking(2),
        );
        let data = Arc::new(BlobDataStore::new(blob.clone(), "items"));
        let snapshots = Arc::new(BlobSnapshotStore::new(blob, "snapshots"));
        let stream = EventStream::new(documents, data, snapshots);

        let mut document = stream.documents.create("Item", "A", &ctx()).await.unwrap();
        stream
            .append(
                &mut document,
                false,
                vec![Event::new(0, "E", json!({})), Event::new(1, "E", json!({}))],
                &ctx(),
            )
            .await
            .unwrap();

        // The full chunk was sealed and an empty tail opened.
        assert_eq!(document.active.chunks.len(), 2);
        assert_eq!(document.active.chunks[0].last_event_version, 1);
        assert_eq!(document.active.chunks[1].first_event_version, 2);
        assert!(document.active.chunks[1].is_empty());
        assert!(document.active.validate_chunks().is_ok());

        // The next append lands in the new chunk's partition.
        stream
            .append(
                &mut document,
                false,
                vec![Event::new(2, "E", json!({}))],
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(document.active.chunks[1].last_event_version, 2);
    }
}
