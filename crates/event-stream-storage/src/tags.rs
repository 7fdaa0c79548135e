// File: src/tags.rs
//
// Tag secondary indexes: document tags map a tag to object ids,
// stream tags map a tag to stream ids. Blob and wide-column
// implementations share the same first-writer-wins create protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::substrate::{KvBlob, Precondition, RowQuery, TableRow, UpsertMode, WideTable};

use crate::cancel::guard;
use crate::containers::{ensure_blob_container, ensure_table};

const TAG_SCHEMA_VERSION: &str = "1.0.0";

const COL_TAG: &str = "Tag";
const COL_OBJECT_NAME: &str = "ObjectName";
const COL_OBJECT_ID: &str = "ObjectId";
const COL_STREAM_IDENTIFIER: &str = "StreamIdentifier";

/// Strip characters the blob substrate rejects in names
pub fn sanitize_blob_tag(tag: &str) -> String {
    tag.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | '<' | '>' | '|' | '"' | '\r' | '\n'))
        .collect()
}

/// Strip characters the table substrate rejects in keys
pub fn sanitize_table_tag(tag: &str) -> String {
    tag.chars()
        .filter(|c| {
            !matches!(c, '/' | '\\' | '#' | '?')
                && !('\u{0000}'..='\u{001F}').contains(c)
                && !('\u{007F}'..='\u{009F}').contains(c)
        })
        .collect()
}

/// Secondary index from document tags to object ids
#[async_trait]
pub trait DocumentTagStore: Send + Sync {
    async fn set(
        &self,
        object_name: &str,
        object_id: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()>;

    async fn get(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<String>>;

    async fn remove(
        &self,
        object_name: &str,
        object_id: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()>;
}

/// Secondary index from stream tags to stream ids
#[async_trait]
pub trait StreamTagStore: Send + Sync {
    async fn set(&self, stream_id: &str, tag: &str, ctx: &CancellationToken) -> StoreResult<()>;

    async fn get(&self, tag: &str, ctx: &CancellationToken) -> StoreResult<Vec<String>>;
}

/// Persisted shape of a blob tag index entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagRecord {
    tag: String,
    #[serde(default)]
    object_ids: Vec<String>,
    schema_version: String,
}

impl TagRecord {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            object_ids: Vec::new(),
            schema_version: TAG_SCHEMA_VERSION.to_string(),
        }
    }
}

/// Blob-backed tag store writing one JSON index document per tag
pub struct BlobTagStore {
    blob: Arc<dyn KvBlob>,
    container: String,
    auto_create: bool,
}

impl BlobTagStore {
    pub fn new(blob: Arc<dyn KvBlob>, container: impl Into<String>, auto_create: bool) -> Self {
        Self {
            blob,
            container: container.into(),
            auto_create,
        }
    }

    fn document_tag_path(tag: &str) -> String {
        format!("tags/document/{}.json", sanitize_blob_tag(tag))
    }

    fn stream_tag_path(tag: &str) -> String {
        format!("tags/stream/{}.json", sanitize_blob_tag(tag))
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.container)
    }

    /// Add an id to a tag index document. Creation uses
    /// If-None-Match "*"; losing the create race falls through to the
    /// etag-matched update path.
    async fn add_to_index(
        &self,
        path: &str,
        tag: &str,
        id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_blob_container(self.blob.as_ref(), &self.container, self.auto_create, ctx).await?;
        guard(ctx, "tag set")?;

        match self
            .blob
            .read(&self.container, path, &Precondition::None, ctx)
            .await
        {
            Ok(content) => {
                let mut record = TagRecord::from_bytes(&content.data)?;
                if record.object_ids.iter().any(|existing| existing == id) {
                    return Ok(());
                }
                record.object_ids.push(id.to_string());
                guard(ctx, "tag set")?;
                self.blob
                    .write(
                        &self.container,
                        path,
                        record.to_bytes()?,
                        &Precondition::match_version(content.etag),
                        ctx,
                    )
                    .await
                    .map_err(|e| self.map_substrate(e))?;
                Ok(())
            }
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => {
                let mut record = TagRecord::new(tag);
                record.object_ids.push(id.to_string());
                guard(ctx, "tag set")?;
                match self
                    .blob
                    .write(
                        &self.container,
                        path,
                        record.to_bytes()?,
                        &Precondition::CreateOnly,
                        ctx,
                    )
                    .await
                {
                    Ok(_) => Ok(()),
                    // Lost the create race; another writer got there
                    // first, so merge into their document.
                    Err(SubstrateError::PreconditionFailed) | Err(SubstrateError::Conflict) => {
                        debug!(path = path, "tag create raced, updating instead");
                        let content = self
                            .blob
                            .read(&self.container, path, &Precondition::None, ctx)
                            .await
                            .map_err(|e| self.map_substrate(e))?;
                        let mut record = TagRecord::from_bytes(&content.data)?;
                        if !record.object_ids.iter().any(|existing| existing == id) {
                            record.object_ids.push(id.to_string());
                            self.blob
                                .write(
                                    &self.container,
                                    path,
                                    record.to_bytes()?,
                                    &Precondition::match_version(content.etag),
                                    ctx,
                                )
                                .await
                                .map_err(|e| self.map_substrate(e))?;
                        }
                        Ok(())
                    }
                    Err(other) => Err(self.map_substrate(other)),
                }
            }
            Err(other) => Err(self.map_substrate(other)),
        }
    }

    async fn read_index(&self, path: &str, ctx: &CancellationToken) -> StoreResult<Vec<String>> {
        guard(ctx, "tag get")?;
        match self
            .blob
            .read(&self.container, path, &Precondition::None, ctx)
            .await
        {
            Ok(content) => Ok(TagRecord::from_bytes(&content.data)?.object_ids),
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => Ok(Vec::new()),
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}

impl TagRecord {
    fn to_bytes(&self) -> StoreResult<bytes::Bytes> {
        Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
    }

    fn from_bytes(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data).map_err(|e| StoreError::SerializationError {
            message: format!("tag index document is not valid JSON: {}", e),
        })
    }
}

#[async_trait]
impl DocumentTagStore for BlobTagStore {
    async fn set(
        &self,
        _object_name: &str,
        object_id: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        self.add_to_index(&Self::document_tag_path(tag), tag, object_id, ctx)
            .await
    }

    async fn get(
        &self,
        _object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<String>> {
        self.read_index(&Self::document_tag_path(tag), ctx).await
    }

    async fn remove(
        &self,
        _object_name: &str,
        object_id: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        let path = Self::document_tag_path(tag);
        guard(ctx, "tag remove")?;
        match self
            .blob
            .read(&self.container, &path, &Precondition::None, ctx)
            .await
        {
            Ok(content) => {
                let mut record = TagRecord::from_bytes(&content.data)?;
                let before = record.object_ids.len();
                record.object_ids.retain(|existing| existing != object_id);
                if record.object_ids.len() == before {
                    return Ok(());
                }
                self.blob
                    .write(
                        &self.container,
                        &path,
                        record.to_bytes()?,
                        &Precondition::match_version(content.etag),
                        ctx,
                    )
                    .await
                    .map_err(|e| self.map_substrate(e))?;
                Ok(())
            }
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => Ok(()),
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}

#[async_trait]
impl StreamTagStore for BlobTagStore {
    async fn set(&self, stream_id: &str, tag: &str, ctx: &CancellationToken) -> StoreResult<()> {
        self.add_to_index(&Self::stream_tag_path(tag), tag, stream_id, ctx)
            .await
    }

    async fn get(&self, tag: &str, ctx: &CancellationToken) -> StoreResult<Vec<String>> {
        self.read_index(&Self::stream_tag_path(tag), ctx).await
    }
}

/// Wide-column tag store keeping one row per (tag, id) pair
pub struct TableTagStore {
    table: Arc<dyn WideTable>,
    table_name: String,
    auto_create: bool,
}

impl TableTagStore {
    pub fn new(table: Arc<dyn WideTable>, table_name: impl Into<String>, auto_create: bool) -> Self {
        Self {
            table,
            table_name: table_name.into(),
            auto_create,
        }
    }

    fn document_partition(object_name: &str, tag: &str) -> String {
        format!("{}_{}", object_name.to_lowercase(), sanitize_table_tag(tag))
    }

    fn stream_partition(tag: &str) -> String {
        format!("stream_{}", sanitize_table_tag(tag))
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.table_name)
    }

    async fn partition_row_keys(
        &self,
        partition: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "tag get")?;
            let query = RowQuery::partition(partition)
                .with_select(vec!["RowKey".to_string()])
                .with_continuation(continuation.take());
            let page = self
                .table
                .query(&self.table_name, &query, ctx)
                .await
                .map_err(|e| self.map_substrate(e))?;
            ids.extend(page.rows.into_iter().map(|row| row.row_key));
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl DocumentTagStore for TableTagStore {
    async fn set(
        &self,
        object_name: &str,
        object_id: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_table(self.table.as_ref(), &self.table_name, self.auto_create, ctx).await?;
        guard(ctx, "tag set")?;
        let row = TableRow::new(Self::document_partition(object_name, tag), object_id)
            .with_string(COL_TAG, tag)
            .with_string(COL_OBJECT_NAME, object_name)
            .with_string(COL_OBJECT_ID, object_id);
        self.table
            .upsert(&self.table_name, row, UpsertMode::Replace, ctx)
            .await
            .map_err(|e| self.map_substrate(e))
    }

    async fn get(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<String>> {
        self.partition_row_keys(&Self::document_partition(object_name, tag), ctx)
            .await
    }

    async fn remove(
        &self,
        object_name: &str,
        object_id: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        guard(ctx, "tag remove")?;
        match self
            .table
            .delete(
                &self.table_name,
                &Self::document_partition(object_name, tag),
                object_id,
                None,
                ctx,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => Ok(()),
            Err(other) => Err(self.map_substrate(other)),
        }
    }
}

#[async_trait]
impl StreamTagStore for TableTagStore {
    async fn set(&self, stream_id: &str, tag: &str, ctx: &CancellationToken) -> StoreResult<()> {
        ensure_table(self.table.as_ref(), &self.table_name, self.auto_create, ctx).await?;
        guard(ctx, "tag set")?;
        let row = TableRow::new(Self::stream_partition(tag), stream_id)
            .with_string(COL_TAG, tag)
            .with_string(COL_STREAM_IDENTIFIER, stream_id);
        self.table
            .upsert(&self.table_name, row, UpsertMode::Replace, ctx)
            .await
            .map_err(|e| self.map_substrate(e))
    }

    async fn get(&self, tag: &str, ctx: &CancellationToken) -> StoreResult<Vec<String>> {
        self.partition_row_keys(&Self::stream_partition(tag), ctx)
            .await
    }
}
