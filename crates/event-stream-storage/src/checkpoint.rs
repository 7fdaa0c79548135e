// File: src/checkpoint.rs
//
// Projection checkpoint storage: gzip-compressed state split into
// fingerprint-addressed chunk rows, with a mutable pointer row per
// projection and historical retention of older fingerprints. A legacy
// single-row layout is still readable.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use event_stream_core::canonical::sha256_hex;
use event_stream_core::codec::{gzip_compress, gzip_decompress, split_chunks, MAX_PAYLOAD_CHUNK_SIZE_BYTES};
use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::model::CheckpointFingerprint;
use event_stream_core::substrate::{
    BatchOp, RowQuery, TableRow, UpsertMode, WideTable, MAX_BATCH_OPERATIONS,
};

use crate::cancel::guard;
use crate::containers::ensure_table;

/// Partition holding every chunk and pointer row
const CHECKPOINT_PARTITION: &str = "checkpoint";

const COL_DATA: &str = "Data";
const COL_TOTAL_CHUNKS: &str = "TotalChunks";
const COL_CHUNK_INDEX: &str = "ChunkIndex";
const COL_CREATED_AT: &str = "CreatedAt";
const COL_PROJECTION_NAME: &str = "ProjectionName";
const COL_FINGERPRINT: &str = "Fingerprint";
const COL_LAST_UPDATED: &str = "LastUpdated";
const COL_STATUS: &str = "Status";

// Legacy single-row layout
const COL_LEGACY_JSON: &str = "CheckpointJson";
const COL_LEGACY_DATA: &str = "CheckpointData";

/// The mutable pointer row for a projection's current checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointPointer {
    pub fingerprint: CheckpointFingerprint,
    pub last_updated: DateTime<Utc>,
    pub status: String,
}

/// A loaded checkpoint; the pointer is absent for the legacy layout
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub state: serde_json::Value,
    pub pointer: Option<CheckpointPointer>,
}

/// Wide-column checkpoint store
pub struct TableCheckpointStore {
    table: Arc<dyn WideTable>,
    table_name: String,
    auto_create: bool,
}

impl TableCheckpointStore {
    pub fn new(table: Arc<dyn WideTable>, table_name: impl Into<String>) -> Self {
        Self {
            table,
            table_name: table_name.into(),
            auto_create: false,
        }
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    fn pointer_row_key(projection: &str) -> String {
        format!("{}_current", projection)
    }

    fn chunk_row_key(fingerprint: &CheckpointFingerprint, index: usize) -> String {
        format!("{}_{}", fingerprint.as_str(), index)
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.table_name)
    }

    /// Compress, fingerprint, and persist a checkpoint, then move the
    /// pointer. Saving the same state twice is idempotent: chunks are
    /// upserts addressed by the fingerprint, and older fingerprints
    /// stay behind for historical loads.
    pub async fn save(
        &self,
        projection: &str,
        state: &serde_json::Value,
        status: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<CheckpointFingerprint> {
        ensure_table(self.table.as_ref(), &self.table_name, self.auto_create, ctx).await?;

        let serialized = serde_json::to_vec(state)?;
        let fingerprint = CheckpointFingerprint(sha256_hex(&serialized));
        let compressed = gzip_compress(&serialized)?;
        let chunks = split_chunks(&compressed, MAX_PAYLOAD_CHUNK_SIZE_BYTES);
        let total = chunks.len() as i32;
        let now = Utc::now();

        let operations: Vec<BatchOp> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                BatchOp::Upsert(
                    TableRow::new(CHECKPOINT_PARTITION, Self::chunk_row_key(&fingerprint, index))
                        .with_bytes(COL_DATA, chunk)
                        .with_i32(COL_TOTAL_CHUNKS, total)
                        .with_i32(COL_CHUNK_INDEX, index as i32)
                        .with_datetime(COL_CREATED_AT, now)
                        .with_string(COL_PROJECTION_NAME, projection),
                )
            })
            .collect();
        for batch in operations.chunks(MAX_BATCH_OPERATIONS) {
            guard(ctx, "checkpoint save")?;
            self.table
                .submit_batch(&self.table_name, CHECKPOINT_PARTITION, batch.to_vec(), ctx)
                .await
                .map_err(|e| self.map_substrate(e))?;
        }

        guard(ctx, "checkpoint save")?;
        let pointer = TableRow::new(CHECKPOINT_PARTITION, Self::pointer_row_key(projection))
            .with_string(COL_FINGERPRINT, fingerprint.as_str())
            .with_datetime(COL_LAST_UPDATED, now)
            .with_string(COL_STATUS, status);
        self.table
            .upsert(&self.table_name, pointer, UpsertMode::Replace, ctx)
            .await
            .map_err(|e| self.map_substrate(e))?;

        info!(
            projection = projection,
            fingerprint = fingerprint.as_str(),
            chunks = total,
            "saved projection checkpoint"
        );
        Ok(fingerprint)
    }

    /// Load the current checkpoint, falling back to the legacy layout
    /// when no pointer row exists.
    pub async fn load(
        &self,
        projection: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<LoadedCheckpoint>> {
        guard(ctx, "checkpoint load")?;
        let pointer = match self
            .table
            .get(
                &self.table_name,
                CHECKPOINT_PARTITION,
                &Self::pointer_row_key(projection),
                ctx,
            )
            .await
        {
            Ok(row) => {
                let fingerprint = row
                    .string(COL_FINGERPRINT)
                    .ok_or_else(|| StoreError::SerializationError {
                        message: format!("checkpoint pointer for {} has no fingerprint", projection),
                    })?
                    .to_string();
                Some(CheckpointPointer {
                    fingerprint: CheckpointFingerprint(fingerprint),
                    last_updated: row.datetime(COL_LAST_UPDATED).unwrap_or_else(Utc::now),
                    status: row.string(COL_STATUS).unwrap_or_default().to_string(),
                })
            }
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => None,
            Err(other) => return Err(self.map_substrate(other)),
        };

        match pointer {
            Some(pointer) => {
                let Some(state) = self.load_from_fingerprint(&pointer.fingerprint, ctx).await?
                else {
                    return Err(StoreError::CorruptPayload {
                        message: format!(
                            "checkpoint pointer for {} references missing fingerprint {}",
                            projection, pointer.fingerprint
                        ),
                    });
                };
                Ok(Some(LoadedCheckpoint {
                    state,
                    pointer: Some(pointer),
                }))
            }
            None => self.load_legacy(projection, ctx).await,
        }
    }

    /// Load a historical checkpoint by fingerprint
    pub async fn load_from_fingerprint(
        &self,
        fingerprint: &CheckpointFingerprint,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<serde_json::Value>> {
        let prefix = format!("{}_", fingerprint.as_str());
        let mut rows = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "checkpoint load")?;
            let query = RowQuery::partition(CHECKPOINT_PARTITION)
                .with_row_key_prefix(prefix.clone())
                .with_continuation(continuation.take());
            let page = self
                .table
                .query(&self.table_name, &query, ctx)
                .await
                .map_err(|e| self.map_substrate(e))?;
            rows.extend(page.rows);
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }

        // Chunk indexes in the row key are not zero-padded, so order
        // by the index column rather than lexically.
        rows.sort_by_key(|row| row.i32(COL_CHUNK_INDEX).unwrap_or(0));
        let total = rows[0].i32(COL_TOTAL_CHUNKS).unwrap_or(rows.len() as i32);
        if rows.len() as i32 != total {
            return Err(StoreError::CorruptPayload {
                message: format!(
                    "checkpoint {} has {} of {} chunks",
                    fingerprint,
                    rows.len(),
                    total
                ),
            });
        }

        let mut compressed = Vec::new();
        for row in &rows {
            let data = row.bytes(COL_DATA).ok_or_else(|| StoreError::CorruptPayload {
                message: format!("checkpoint chunk row {} has no data", row.row_key),
            })?;
            compressed.extend_from_slice(data);
        }
        let serialized = gzip_decompress(&compressed)?;
        let state =
            serde_json::from_slice(&serialized).map_err(|e| StoreError::CorruptPayload {
                message: format!("checkpoint {} is not valid JSON: {}", fingerprint, e),
            })?;
        Ok(Some(state))
    }

    async fn load_legacy(
        &self,
        projection: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<LoadedCheckpoint>> {
        guard(ctx, "checkpoint load")?;
        let row = match self
            .table
            .get(&self.table_name, projection, projection, ctx)
            .await
        {
            Ok(row) => row,
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => return Ok(None),
            Err(other) => return Err(self.map_substrate(other)),
        };

        debug!(projection = projection, "loading legacy checkpoint row");
        let state = if let Some(json) = row.string(COL_LEGACY_JSON) {
            serde_json::from_str(json).map_err(|e| StoreError::CorruptPayload {
                message: format!("legacy checkpoint for {} is not valid JSON: {}", projection, e),
            })?
        } else if let Some(data) = row.bytes(COL_LEGACY_DATA) {
            let serialized = gzip_decompress(data)?;
            serde_json::from_slice(&serialized).map_err(|e| StoreError::CorruptPayload {
                message: format!("legacy checkpoint for {} is not valid JSON: {}", projection, e),
            })?
        } else {
            return Err(StoreError::CorruptPayload {
                message: format!("legacy checkpoint row for {} holds no state", projection),
            });
        };
        Ok(Some(LoadedCheckpoint {
            state,
            pointer: None,
        }))
    }

    /// Delete the pointer, every chunk of every fingerprint this
    /// projection ever saved, and any legacy row. Returns the number
    /// of rows removed.
    pub async fn delete_all(
        &self,
        projection: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<usize> {
        let mut removed = 0usize;

        guard(ctx, "checkpoint delete")?;
        match self
            .table
            .delete(
                &self.table_name,
                CHECKPOINT_PARTITION,
                &Self::pointer_row_key(projection),
                None,
                ctx,
            )
            .await
        {
            Ok(()) => removed += 1,
            Err(SubstrateError::NotFound { .. }) => {}
            Err(other) => return Err(self.map_substrate(other)),
        }

        // Chunk rows carry the projection name, which is the only way
        // to find historical fingerprints.
        let mut to_delete = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "checkpoint delete")?;
            let query = RowQuery::partition(CHECKPOINT_PARTITION)
                .with_select(vec!["RowKey".to_string(), COL_PROJECTION_NAME.to_string()])
                .with_continuation(continuation.take());
            let page = match self.table.query(&self.table_name, &query, ctx).await {
                Ok(page) => page,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Table,
                }) => return Ok(removed),
                Err(other) => return Err(self.map_substrate(other)),
            };
            for row in page.rows {
                if row.string(COL_PROJECTION_NAME) == Some(projection) {
                    to_delete.push(row.row_key);
                }
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        removed += to_delete.len();
        let operations: Vec<BatchOp> = to_delete
            .into_iter()
            .map(|row_key| BatchOp::Delete { row_key })
            .collect();
        for batch in operations.chunks(MAX_BATCH_OPERATIONS) {
            guard(ctx, "checkpoint delete")?;
            self.table
                .submit_batch(&self.table_name, CHECKPOINT_PARTITION, batch.to_vec(), ctx)
                .await
                .map_err(|e| self.map_substrate(e))?;
        }

        guard(ctx, "checkpoint delete")?;
        match self
            .table
            .delete(&self.table_name, projection, projection, None, ctx)
            .await
        {
            Ok(()) => removed += 1,
            Err(SubstrateError::NotFound { .. }) => {}
            Err(other) => return Err(self.map_substrate(other)),
        }

        info!(projection = projection, rows = removed, "deleted checkpoints");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_stream_core::substrate::InMemoryTableStore;
    use serde_json::json;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn store() -> TableCheckpointStore {
        let table = Arc::new(InMemoryTableStore::new());
        table
            .create_table_if_not_exists("checkpoints", &ctx())
            .await
            .unwrap();
        TableCheckpointStore::new(table, "checkpoints")
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = store().await;
        let state = json!({"position": 42, "entities": {"a": 1, "b": 2}});
        let fingerprint = store.save("P", &state, "caught-up", &ctx()).await.unwrap();

        let loaded = store.load("P", &ctx()).await.unwrap().unwrap();
        assert_eq!(loaded.state, state);
        let pointer = loaded.pointer.unwrap();
        assert_eq!(pointer.fingerprint, fingerprint);
        assert_eq!(pointer.status, "caught-up");
    }

    #[tokio::test]
    async fn load_of_unknown_projection_is_none() {
        let store = store().await;
        assert!(store.load("missing", &ctx()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_is_idempotent_per_fingerprint() {
        let store = store().await;
        let state = json!({"position": 1});
        let first = store.save("P", &state, "ok", &ctx()).await.unwrap();
        let second = store.save("P", &state, "ok", &ctx()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn history_survives_newer_saves() {
        let store = store().await;
        let old_state = json!({"position": 1});
        let old_fingerprint = store.save("P", &old_state, "ok", &ctx()).await.unwrap();

        let new_state = json!({"position": 2});
        store.save("P", &new_state, "ok", &ctx()).await.unwrap();

        // The pointer moved, but the old fingerprint still loads.
        let current = store.load("P", &ctx()).await.unwrap().unwrap();
        assert_eq!(current.state, new_state);
        let historical = store
            .load_from_fingerprint(&old_fingerprint, &ctx())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(historical, old_state);
    }

    #[tokio::test]
    async fn large_checkpoint_splits_into_chunks() {
        let store = store().await;
        // Hard-to-compress state so multiple chunks survive gzip.
        let blob: String = (0..400 * 1024)
            .map(|i| char::from(b'a' + ((i * 131 + i / 89) % 26) as u8))
            .collect();
        let state = json!({ "blob": blob });
        let fingerprint = store.save("P", &state, "ok", &ctx()).await.unwrap();

        let loaded = store
            .load_from_fingerprint(&fingerprint, &ctx())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn legacy_row_is_readable() {
        let table = Arc::new(InMemoryTableStore::new());
        table
            .create_table_if_not_exists("checkpoints", &ctx())
            .await
            .unwrap();
        let legacy_state = json!({"legacy": true});
        table
            .upsert(
                "checkpoints",
                TableRow::new("P", "P").with_string(COL_LEGACY_JSON, legacy_state.to_string()),
                event_stream_core::substrate::UpsertMode::Replace,
                &ctx(),
            )
            .await
            .unwrap();
        let store = TableCheckpointStore::new(table, "checkpoints");

        let loaded = store.load("P", &ctx()).await.unwrap().unwrap();
        assert_eq!(loaded.state, legacy_state);
        assert!(loaded.pointer.is_none());
    }

    #[tokio::test]
    async fn legacy_compressed_row_is_readable() {
        let table = Arc::new(InMemoryTableStore::new());
        table
            .create_table_if_not_exists("checkpoints", &ctx())
            .await
            .unwrap();
        let legacy_state = json!({"legacy": "compressed"});
        let compressed = gzip_compress(legacy_state.to_string().as_bytes()).unwrap();
        table
            .upsert(
                "checkpoints",
                TableRow::new("P", "P").with_bytes(COL_LEGACY_DATA, compressed),
                event_stream_core::substrate::UpsertMode::Replace,
                &ctx(),
            )
            .await
            .unwrap();
        let store = TableCheckpointStore::new(table, "checkpoints");

        let loaded = store.load("P", &ctx()).await.unwrap().unwrap();
        assert_eq!(loaded.state, legacy_state);
    }

    #[tokio::test]
    async fn delete_all_removes_pointer_and_history() {
        let store = store().await;
        store.save("P", &json!({"position": 1}), "ok", &ctx()).await.unwrap();
        store.save("P", &json!({"position": 2}), "ok", &ctx()).await.unwrap();
        store.save("Q", &json!({"other": true}), "ok", &ctx()).await.unwrap();

        let removed = store.delete_all("P", &ctx()).await.unwrap();
        assert!(removed >= 3);
        assert!(store.load("P", &ctx()).await.unwrap().is_none());

        // The other projection is untouched.
        assert!(store.load("Q", &ctx()).await.unwrap().is_some());
    }
}
