// File: src/tiering.rs
//
// Storage tiering and stream metrics for blob-backed streams: move
// stream data to the cold tier, rehydrate it, and report per-stream
// size metrics.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::model::ObjectDocument;
use event_stream_core::substrate::{BlobTier, KvBlob, RehydratePriority};

use crate::cancel::guard;

/// Size and shape of one stream's stored data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetrics {
    pub stream_id: String,
    pub event_count: i64,
    pub chunk_count: usize,
    pub approximate_size_bytes: u64,
}

/// Every blob path holding data for the document's active stream
fn stream_blob_paths(document: &ObjectDocument) -> Vec<String> {
    if document.active.chunking_enabled && !document.active.chunks.is_empty() {
        document
            .active
            .chunks
            .iter()
            .map(|chunk| {
                format!(
                    "{}.json",
                    document.active.chunk_data_path(chunk.chunk_id).to_lowercase()
                )
            })
            .collect()
    } else {
        vec![format!("{}.json", document.active.data_path().to_lowercase())]
    }
}

/// Moves stream blobs between storage tiers
pub struct BlobTierProvider {
    blob: Arc<dyn KvBlob>,
    container: String,
}

impl BlobTierProvider {
    pub fn new(blob: Arc<dyn KvBlob>, container: impl Into<String>) -> Self {
        Self {
            blob,
            container: container.into(),
        }
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.container)
    }

    /// Move every chunk of the stream to the cold tier
    pub async fn set_cold_tier(
        &self,
        document: &ObjectDocument,
        ctx: &CancellationToken,
    ) -> StoreResult<usize> {
        let mut moved = 0usize;
        for path in stream_blob_paths(document) {
            guard(ctx, "set tier")?;
            match self
                .blob
                .set_tier(&self.container, &path, BlobTier::Cold, None, ctx)
                .await
            {
                Ok(()) => moved += 1,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Blob,
                }) => {}
                Err(other) => return Err(self.map_substrate(other)),
            }
        }
        info!(
            stream = document.active.stream_id.as_str(),
            chunks = moved,
            "moved stream to cold tier"
        );
        Ok(moved)
    }

    /// Bring a cold or archived stream back to the hot tier
    pub async fn rehydrate(
        &self,
        document: &ObjectDocument,
        priority: RehydratePriority,
        ctx: &CancellationToken,
    ) -> StoreResult<usize> {
        let mut moved = 0usize;
        for path in stream_blob_paths(document) {
            guard(ctx, "rehydrate")?;
            match self
                .blob
                .set_tier(&self.container, &path, BlobTier::Hot, Some(priority), ctx)
                .await
            {
                Ok(()) => moved += 1,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Blob,
                }) => {}
                Err(other) => return Err(self.map_substrate(other)),
            }
        }
        info!(
            stream = document.active.stream_id.as_str(),
            chunks = moved,
            "rehydrating stream"
        );
        Ok(moved)
    }

    /// The tier of the stream's active chunk, if stored
    pub async fn current_tier(
        &self,
        document: &ObjectDocument,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<BlobTier>> {
        guard(ctx, "current tier")?;
        let path = format!("{}.json", document.active.data_path().to_lowercase());
        match self.blob.get_properties(&self.container, &path, ctx).await {
            Ok(properties) => Ok(properties.tier),
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => Ok(None),
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}

/// Reports per-stream storage metrics
pub struct StreamMetricsProvider {
    blob: Arc<dyn KvBlob>,
    container: String,
}

impl StreamMetricsProvider {
    pub fn new(blob: Arc<dyn KvBlob>, container: impl Into<String>) -> Self {
        Self {
            blob,
            container: container.into(),
        }
    }

    /// Event count comes from the stream pointer; byte sizes come
    /// from blob properties, skipping chunks not yet written.
    pub async fn metrics(
        &self,
        document: &ObjectDocument,
        ctx: &CancellationToken,
    ) -> StoreResult<StreamMetrics> {
        let paths = stream_blob_paths(document);
        let mut size = 0u64;
        let mut stored_chunks = 0usize;
        for path in &paths {
            guard(ctx, "stream metrics")?;
            match self.blob.get_properties(&self.container, path, ctx).await {
                Ok(properties) => {
                    size += properties.content_length;
                    stored_chunks += 1;
                }
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Blob,
                }) => {}
                Err(other) => return Err(StoreError::from_substrate(other, &self.container)),
            }
        }
        Ok(StreamMetrics {
            stream_id: document.active.stream_id.clone(),
            event_count: document.active.current_version + 1,
            chunk_count: stored_chunks,
            approximate_size_bytes: size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use event_stream_core::substrate::{InMemoryBlobStore, Precondition};

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn seeded() -> (Arc<InMemoryBlobStore>, ObjectDocument) {
        let blob = Arc::new(InMemoryBlobStore::new());
        blob.create_container_if_not_exists("items", &ctx())
            .await
            .unwrap();
        let mut document = ObjectDocument::new("Item", "A", false, 0);
        document.active.current_version = 4;
        blob.write(
            "items",
            "a-0000000000.json",
            Bytes::from_static(b"0123456789"),
            &Precondition::None,
            &ctx(),
        )
        .await
        .unwrap();
        (blob, document)
    }

    #[tokio::test]
    async fn cold_tier_round_trip() {
        let (blob, document) = seeded().await;
        let provider = BlobTierProvider::new(blob, "items");

        assert_eq!(provider.set_cold_tier(&document, &ctx()).await.unwrap(), 1);
        assert_eq!(
            provider.current_tier(&document, &ctx()).await.unwrap(),
            Some(BlobTier::Cold)
        );

        provider
            .rehydrate(&document, RehydratePriority::High, &ctx())
            .await
            .unwrap();
        assert_eq!(
            provider.current_tier(&document, &ctx()).await.unwrap(),
            Some(BlobTier::Hot)
        );
    }

    #[tokio::test]
    async fn metrics_report_counts_and_sizes() {
        let (blob, document) = seeded().await;
        let provider = StreamMetricsProvider::new(blob, "items");
        let metrics = provider.metrics(&document, &ctx()).await.unwrap();
        assert_eq!(metrics.event_count, 5);
        assert_eq!(metrics.chunk_count, 1);
        assert_eq!(metrics.approximate_size_bytes, 10);
    }

    #[tokio::test]
    async fn absent_stream_yields_empty_metrics() {
        let blob = Arc::new(InMemoryBlobStore::new());
        blob.create_container_if_not_exists("items", &ctx())
            .await
            .unwrap();
        let document = ObjectDocument::new("Item", "B", false, 0);
        let provider = StreamMetricsProvider::new(blob, "items");
        let metrics = provider.metrics(&document, &ctx()).await.unwrap();
        assert_eq!(metrics.chunk_count, 0);
        assert_eq!(metrics.approximate_size_bytes, 0);
    }
}
