// File: src/snapshot.rs
//
// Versioned aggregate snapshots keyed by (stream, version, name), with
// blob and wide-column implementations. Writes are upserts; reads
// return None when absent.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::model::{ObjectDocument, Snapshot};
use event_stream_core::substrate::{
    KvBlob, Precondition, RowQuery, TableRow, UpsertMode, WideTable,
};

use crate::cancel::guard;
use crate::containers::{ensure_blob_container, ensure_table};

const COL_STREAM_IDENTIFIER: &str = "StreamIdentifier";
const COL_VERSION: &str = "Version";
const COL_NAME: &str = "Name";
const COL_AGGREGATE_TYPE: &str = "AggregateType";
const COL_DATA: &str = "Data";
const COL_CREATED_AT: &str = "CreatedAt";

/// Snapshot persistence contract
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upsert a snapshot under its (stream, version, name) key
    async fn set(
        &self,
        document: &ObjectDocument,
        snapshot: &Snapshot,
        ctx: &CancellationToken,
    ) -> StoreResult<()>;

    /// Load a snapshot; None when absent
    async fn get(
        &self,
        document: &ObjectDocument,
        version: i64,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<Snapshot>>;

    /// All snapshots for the document's active stream, newest first
    async fn list(
        &self,
        document: &ObjectDocument,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<Snapshot>>;

    /// Delete a snapshot; true when one existed
    async fn delete(
        &self,
        document: &ObjectDocument,
        version: i64,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<bool>;
}

/// Blob-backed snapshot store:
/// `snapshot/{streamId}-{version:020}[_name].json`
pub struct BlobSnapshotStore {
    blob: Arc<dyn KvBlob>,
    container: String,
    auto_create: bool,
}

impl BlobSnapshotStore {
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

    fn snapshot_path(stream_id: &str, version: i64, name: Option<&str>) -> String {
        format!(
            "snapshot/{}-{}.json",
            stream_id,
            Snapshot::key_suffix(version, name)
        )
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.container)
    }
}

#[async_trait]
impl SnapshotStore for BlobSnapshotStore {
    async fn set(
        &self,
        document: &ObjectDocument,
        snapshot: &Snapshot,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_blob_container(self.blob.as_ref(), &self.container, self.auto_create, ctx).await?;
        guard(ctx, "snapshot set")?;
        let path = Self::snapshot_path(
            &document.active.stream_id,
            snapshot.version,
            snapshot.name.as_deref(),
        );
        let data = Bytes::from(serde_json::to_vec(snapshot)?);
        self.blob
            .write(&self.container, &path, data, &Precondition::None, ctx)
            .await
            .map_err(|e| self.map_substrate(e))?;
        debug!(
            stream = document.active.stream_id.as_str(),
            version = snapshot.version,
            "stored snapshot"
        );
        Ok(())
    }

    async fn get(
        &self,
        document: &ObjectDocument,
        version: i64,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<Snapshot>> {
        guard(ctx, "snapshot get")?;
        let path = Self::snapshot_path(&document.active.stream_id, version, name);
        match self
            .blob
            .read(&self.container, &path, &Precondition::None, ctx)
            .await
        {
            Ok(content) => {
                let snapshot = serde_json::from_slice(&content.data).map_err(|e| {
                    StoreError::SerializationError {
                        message: format!("snapshot {} is not valid JSON: {}", path, e),
                    }
                })?;
                Ok(Some(snapshot))
            }
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => Ok(None),
            Err(other) => Err(self.map_substrate(other)),
        }
    }

    async fn list(
        &self,
        document: &ObjectDocument,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<Snapshot>> {
        let prefix = format!("snapshot/{}-", document.active.stream_id);
        let mut snapshots = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "snapshot list")?;
            let page = self
                .blob
                .list(&self.container, &prefix, continuation.take(), 100, ctx)
                .await
                .map_err(|e| self.map_substrate(e))?;
            for path in page.items {
                guard(ctx, "snapshot list")?;
                let content = self
                    .blob
                    .read(&self.container, &path, &Precondition::None, ctx)
                    .await
                    .map_err(|e| self.map_substrate(e))?;
                let snapshot: Snapshot = serde_json::from_slice(&content.data).map_err(|e| {
                    StoreError::SerializationError {
                        message: format!("snapshot {} is not valid JSON: {}", path, e),
                    }
                })?;
                snapshots.push(snapshot);
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        snapshots.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(snapshots)
    }

    async fn delete(
        &self,
        document: &ObjectDocument,
        version: i64,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<bool> {
        guard(ctx, "snapshot delete")?;
        let path = Self::snapshot_path(&document.active.stream_id, version, name);
        match self
            .blob
            .delete(&self.container, &path, &Precondition::None, ctx)
            .await
        {
            Ok(()) => Ok(true),
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => Ok(false),
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}

/// Wide-column snapshot store:
/// partition `{objectName_lc}_{streamId}`, row `{version:020}[_name]`
pub struct TableSnapshotStore {
    table: Arc<dyn WideTable>,
    table_name: String,
    auto_create: bool,
}

impl TableSnapshotStore {
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

    fn partition(document: &ObjectDocument) -> String {
        format!(
            "{}_{}",
            document.object_name.to_lowercase(),
            document.active.stream_id
        )
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.table_name)
    }

    fn row_to_snapshot(row: &TableRow) -> StoreResult<Snapshot> {
        let data_json = row
            .string(COL_DATA)
            .ok_or_else(|| StoreError::SerializationError {
                message: format!("snapshot row {} has no data", row.row_key),
            })?;
        Ok(Snapshot {
            stream_id: row
                .string(COL_STREAM_IDENTIFIER)
                .unwrap_or_default()
                .to_string(),
            version: row.i64(COL_VERSION).unwrap_or(-1),
            name: row.string(COL_NAME).map(str::to_string),
            aggregate_type: row
                .string(COL_AGGREGATE_TYPE)
                .unwrap_or_default()
                .to_string(),
            data: serde_json::from_str(data_json).map_err(|e| StoreError::SerializationError {
                message: format!("snapshot row {} data is not valid JSON: {}", row.row_key, e),
            })?,
            created_timestamp: row
                .datetime(COL_CREATED_AT)
                .unwrap_or_else(chrono::Utc::now),
        })
    }
}

#[async_trait]
impl SnapshotStore for TableSnapshotStore {
    async fn set(
        &self,
        document: &ObjectDocument,
        snapshot: &Snapshot,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_table(self.table.as_ref(), &self.table_name, self.auto_create, ctx).await?;
        guard(ctx, "snapshot set")?;
        let mut row = TableRow::new(
            Self::partition(document),
            Snapshot::key_suffix(snapshot.version, snapshot.name.as_deref()),
        )
        .with_string(COL_STREAM_IDENTIFIER, snapshot.stream_id.clone())
        .with_i64(COL_VERSION, snapshot.version)
        .with_string(COL_AGGREGATE_TYPE, snapshot.aggregate_type.clone())
        .with_string(COL_DATA, serde_json::to_string(&snapshot.data)?)
        .with_datetime(COL_CREATED_AT, snapshot.created_timestamp);
        if let Some(name) = &snapshot.name {
            row = row.with_string(COL_NAME, name.clone());
        }
        self.table
            .upsert(&self.table_name, row, UpsertMode::Replace, ctx)
            .await
            .map_err(|e| self.map_substrate(e))?;
        debug!(
            stream = document.active.stream_id.as_str(),
            version = snapshot.version,
            "stored snapshot"
        );
        Ok(())
    }

    async fn get(
        &self,
        document: &ObjectDocument,
        version: i64,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<Snapshot>> {
        guard(ctx, "snapshot get")?;
        match self
            .table
            .get(
                &self.table_name,
                &Self::partition(document),
                &Snapshot::key_suffix(version, name),
                ctx,
            )
            .await
        {
            Ok(row) => Ok(Some(Self::row_to_snapshot(&row)?)),
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => Ok(None),
            Err(other) => Err(self.map_substrate(other)),
        }
    }

    async fn list(
        &self,
        document: &ObjectDocument,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<Snapshot>> {
        let partition = Self::partition(document);
        let mut snapshots = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "snapshot list")?;
            let query = RowQuery::partition(&partition).with_continuation(continuation.take());
            let page = self
                .table
                .query(&self.table_name, &query, ctx)
                .await
                .map_err(|e| self.map_substrate(e))?;
            for row in &page.rows {
                snapshots.push(Self::row_to_snapshot(row)?);
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        snapshots.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(snapshots)
    }

    async fn delete(
        &self,
        document: &ObjectDocument,
        version: i64,
        name: Option<&str>,
        ctx: &CancellationToken,
    ) -> StoreResult<bool> {
        guard(ctx, "snapshot delete")?;
        match self
            .table
            .delete(
                &self.table_name,
                &Self::partition(document),
                &Snapshot::key_suffix(version, name),
                None,
                ctx,
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => Ok(false),
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}
