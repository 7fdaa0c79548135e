// File: src/document.rs
//
// Object document stores: materialize and persist the per-aggregate
// descriptor with hash chaining and optimistic concurrency, and
// resolve documents through the tag index.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::model::{
    ObjectDocument, StoreRouting, StreamChunk, StreamInformation, StreamTypeNames,
    TerminatedStream, DOCUMENT_SCHEMA_VERSION,
};
use event_stream_core::substrate::{
    BatchOp, KvBlob, Precondition, RowQuery, TableRow, WideTable, MAX_BATCH_OPERATIONS,
};

use crate::cancel::guard;
use crate::containers::{ensure_blob_container, ensure_table};
use crate::tags::DocumentTagStore;

/// Object document persistence contract
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Idempotently create the document for an object, returning the
    /// existing one when present.
    async fn create(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectDocument>;

    /// Load a document; `DocumentNotFound` when absent
    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectDocument>;

    /// Persist a document under optimistic concurrency, advancing the
    /// hash chain.
    async fn set(&self, document: &mut ObjectDocument, ctx: &CancellationToken) -> StoreResult<()>;

    /// Load all documents carrying a tag
    async fn get_by_tag(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<ObjectDocument>>;

    /// Load the first document carrying a tag, if any
    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<ObjectDocument>>;
}

/// Advance the hash chain before a persist: the loaded hash becomes
/// `prev_hash` and the new digest covers it.
fn chain_hashes(document: &mut ObjectDocument) -> StoreResult<()> {
    document.validate_for_set()?;
    document.prev_hash = document.loaded_hash.clone();
    document.hash = Some(document.compute_hash()?);
    Ok(())
}

/// Blob-backed document store: one JSON blob per document at
/// `{objectName_lc}/{objectId}.json`.
pub struct BlobDocumentStore {
    blob: Arc<dyn KvBlob>,
    container: String,
    tags: Arc<dyn DocumentTagStore>,
    auto_create: bool,
    chunking_enabled: bool,
    chunk_size: i64,
}

impl BlobDocumentStore {
    pub fn new(
        blob: Arc<dyn KvBlob>,
        container: impl Into<String>,
        tags: Arc<dyn DocumentTagStore>,
    ) -> Self {
        Self {
            blob,
            container: container.into(),
            tags,
            auto_create: false,
            chunking_enabled: false,
            chunk_size: 0,
        }
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    /// New documents start with chunking enabled at the given size
    pub fn with_chunking(mut self, chunk_size: i64) -> Self {
        self.chunking_enabled = true;
        self.chunk_size = chunk_size;
        self
    }

    fn document_path(object_name: &str, object_id: &str) -> String {
        format!("{}/{}.json", object_name.to_lowercase(), object_id)
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.container)
    }
}

#[async_trait]
impl DocumentStore for BlobDocumentStore {
    async fn create(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectDocument> {
        match self.get(object_name, object_id, ctx).await {
            Ok(document) => return Ok(document),
            Err(StoreError::DocumentNotFound { .. }) => {}
            Err(other) => return Err(other),
        }

        ensure_blob_container(self.blob.as_ref(), &self.container, self.auto_create, ctx).await?;
        guard(ctx, "document create")?;

        let mut document =
            ObjectDocument::new(object_name, object_id, self.chunking_enabled, self.chunk_size);
        let path = Self::document_path(object_name, object_id);
        let data = Bytes::from(serde_json::to_vec(&document)?);
        match self
            .blob
            .write(&self.container, &path, data, &Precondition::CreateOnly, ctx)
            .await
        {
            Ok(properties) => {
                info!(
                    object_name = object_name,
                    object_id = object_id,
                    "created object document"
                );
                document.document_path = Some(path);
                document.etag = Some(properties.etag);
                Ok(document)
            }
            // Lost the create race; the winner's document is the one.
            Err(SubstrateError::PreconditionFailed) | Err(SubstrateError::Conflict) => {
                self.get(object_name, object_id, ctx).await
            }
            Err(other) => Err(self.map_substrate(other)),
        }
    }

    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectDocument> {
        guard(ctx, "document get")?;
        let path = Self::document_path(object_name, object_id);
        let content = match self
            .blob
            .read(&self.container, &path, &Precondition::None, ctx)
            .await
        {
            Ok(content) => content,
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }) => {
                return Err(StoreError::DocumentNotFound {
                    object_name: object_name.to_string(),
                    object_id: object_id.to_string(),
                })
            }
            Err(other) => return Err(self.map_substrate(other)),
        };

        let mut document: ObjectDocument =
            serde_json::from_slice(&content.data).map_err(|e| StoreError::SerializationError {
                message: format!("object document {} is not valid JSON: {}", path, e),
            })?;
        document.document_path = Some(path);
        document.etag = Some(content.etag);
        document.loaded_hash = document.hash.clone();
        Ok(document)
    }

    async fn set(&self, document: &mut ObjectDocument, ctx: &CancellationToken) -> StoreResult<()> {
        chain_hashes(document)?;
        guard(ctx, "document set")?;

        let path = Self::document_path(&document.object_name, &document.object_id);
        let precondition = match &document.etag {
            Some(etag) => Precondition::match_version(etag.clone()),
            None => Precondition::CreateOnly,
        };
        let data = Bytes::from(serde_json::to_vec(document)?);
        let properties = self
            .blob
            .write(&self.container, &path, data, &precondition, ctx)
            .await
            .map_err(|e| match e {
                SubstrateError::PreconditionFailed | SubstrateError::Conflict => {
                    StoreError::ConcurrencyConflict {
                        message: format!(
                            "object document {} was modified since it was loaded",
                            document.object_id
                        ),
                    }
                }
                other => self.map_substrate(other),
            })?;

        debug!(
            object_id = document.object_id.as_str(),
            version = document.active.current_version,
            "persisted object document"
        );
        document.document_path = Some(path);
        document.etag = Some(properties.etag);
        document.loaded_hash = document.hash.clone();
        Ok(())
    }

    async fn get_by_tag(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<ObjectDocument>> {
        let ids = self.tags.get(object_name, tag, ctx).await?;
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            documents.push(self.get(object_name, &id, ctx).await?);
        }
        Ok(documents)
    }

    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<ObjectDocument>> {
        let ids = self.tags.get(object_name, tag, ctx).await?;
        match ids.first() {
            Some(id) => Ok(Some(self.get(object_name, id, ctx).await?)),
            None => Ok(None),
        }
    }
}

// Column names of the flattened document row
const COL_ACTIVE_STREAM_ID: &str = "ActiveStreamId";
const COL_ACTIVE_CURRENT_VERSION: &str = "ActiveCurrentVersion";
const COL_ACTIVE_CHUNKING_ENABLED: &str = "ActiveChunkingEnabled";
const COL_ACTIVE_CHUNK_SIZE: &str = "ActiveChunkSize";
const COL_ACTIVE_DATA_STORE: &str = "ActiveDataStore";
const COL_ACTIVE_DOCUMENT_STORE: &str = "ActiveDocumentStore";
const COL_ACTIVE_DOCUMENT_TAG_STORE: &str = "ActiveDocumentTagStore";
const COL_ACTIVE_STREAM_TAG_STORE: &str = "ActiveStreamTagStore";
const COL_ACTIVE_SNAPSHOT_STORE: &str = "ActiveSnapshotStore";
const COL_ACTIVE_CONNECTION_NAME: &str = "ActiveConnectionName";
const COL_TYPE_STREAM: &str = "TypeStream";
const COL_TYPE_DOCUMENT: &str = "TypeDocument";
const COL_TYPE_DOCUMENT_TAG: &str = "TypeDocumentTag";
const COL_TYPE_EVENT_STREAM_TAG: &str = "TypeEventStreamTag";
const COL_TYPE_DOCUMENT_REF: &str = "TypeDocumentRef";
const COL_SCHEMA_VERSION: &str = "SchemaVersion";
const COL_HASH: &str = "Hash";
const COL_PREV_HASH: &str = "PrevHash";

// Companion chunk rows
const COL_FIRST_EVENT_VERSION: &str = "FirstEventVersion";
const COL_LAST_EVENT_VERSION: &str = "LastEventVersion";

// Companion terminated-stream rows
const COL_REASON: &str = "Reason";
const COL_CONTINUATION_STREAM_ID: &str = "ContinuationStreamId";
const COL_TERMINATION_TIMESTAMP: &str = "TerminationTimestamp";
const COL_TERMINATED_VERSION: &str = "Version";
const COL_DELETED: &str = "Deleted";
const COL_DELETION_TIMESTAMP: &str = "DeletionTimestamp";

/// Wide-column document store: the stream pointer flattened into one
/// row, with chunk and terminated-stream history in companion tables
/// keyed by object id.
pub struct TableDocumentStore {
    table: Arc<dyn WideTable>,
    document_table: String,
    chunk_table: String,
    terminated_table: String,
    tags: Arc<dyn DocumentTagStore>,
    auto_create: bool,
    chunking_enabled: bool,
    chunk_size: i64,
}

impl TableDocumentStore {
    pub fn new(
        table: Arc<dyn WideTable>,
        document_table: impl Into<String>,
        tags: Arc<dyn DocumentTagStore>,
    ) -> Self {
        let document_table = document_table.into();
        Self {
            chunk_table: format!("{}chunks", document_table),
            terminated_table: format!("{}terminated", document_table),
            table,
            document_table,
            tags,
            auto_create: false,
            chunking_enabled: false,
            chunk_size: 0,
        }
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    pub fn with_chunking(mut self, chunk_size: i64) -> Self {
        self.chunking_enabled = true;
        self.chunk_size = chunk_size;
        self
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.document_table)
    }

    fn document_to_row(document: &ObjectDocument) -> TableRow {
        let mut row = TableRow::new(
            document.object_name.to_lowercase(),
            document.object_id.clone(),
        )
        .with_string(COL_ACTIVE_STREAM_ID, document.active.stream_id.clone())
        .with_i64(COL_ACTIVE_CURRENT_VERSION, document.active.current_version)
        .with_bool(COL_ACTIVE_CHUNKING_ENABLED, document.active.chunking_enabled)
        .with_i64(COL_ACTIVE_CHUNK_SIZE, document.active.chunk_size)
        .with_string(COL_TYPE_STREAM, document.active.types.stream.clone())
        .with_string(COL_TYPE_DOCUMENT, document.active.types.document.clone())
        .with_string(
            COL_TYPE_DOCUMENT_TAG,
            document.active.types.document_tag.clone(),
        )
        .with_string(
            COL_TYPE_EVENT_STREAM_TAG,
            document.active.types.event_stream_tag.clone(),
        )
        .with_string(
            COL_TYPE_DOCUMENT_REF,
            document.active.types.document_ref.clone(),
        )
        .with_string(COL_SCHEMA_VERSION, document.schema_version.clone());

        let stores = &document.active.stores;
        if let Some(name) = &stores.data_store {
            row = row.with_string(COL_ACTIVE_DATA_STORE, name.clone());
        }
        if let Some(name) = &stores.document_store {
            row = row.with_string(COL_ACTIVE_DOCUMENT_STORE, name.clone());
        }
        if let Some(name) = &stores.document_tag_store {
            row = row.with_string(COL_ACTIVE_DOCUMENT_TAG_STORE, name.clone());
        }
        if let Some(name) = &stores.stream_tag_store {
            row = row.with_string(COL_ACTIVE_STREAM_TAG_STORE, name.clone());
        }
        if let Some(name) = &stores.snapshot_store {
            row = row.with_string(COL_ACTIVE_SNAPSHOT_STORE, name.clone());
        }
        // The legacy connection name is input-only and never written.

        if let Some(hash) = &document.hash {
            row = row.with_string(COL_HASH, hash.clone());
        }
        if let Some(prev_hash) = &document.prev_hash {
            row = row.with_string(COL_PREV_HASH, prev_hash.clone());
        }
        row
    }

    fn row_to_document(
        row: &TableRow,
        object_name: &str,
        chunks: Vec<StreamChunk>,
        terminated_streams: Vec<TerminatedStream>,
    ) -> StoreResult<ObjectDocument> {
        let stream_id = row
            .string(COL_ACTIVE_STREAM_ID)
            .ok_or_else(|| StoreError::SerializationError {
                message: format!("document row {} has no stream id", row.row_key),
            })?
            .to_string();

        let active = StreamInformation {
            stream_id,
            current_version: row.i64(COL_ACTIVE_CURRENT_VERSION).unwrap_or(-1),
            chunking_enabled: row.bool(COL_ACTIVE_CHUNKING_ENABLED).unwrap_or(false),
            chunk_size: row.i64(COL_ACTIVE_CHUNK_SIZE).unwrap_or(0),
            chunks,
            stores: StoreRouting {
                data_store: row.string(COL_ACTIVE_DATA_STORE).map(str::to_string),
                document_store: row.string(COL_ACTIVE_DOCUMENT_STORE).map(str::to_string),
                document_tag_store: row
                    .string(COL_ACTIVE_DOCUMENT_TAG_STORE)
                    .map(str::to_string),
                stream_tag_store: row.string(COL_ACTIVE_STREAM_TAG_STORE).map(str::to_string),
                snapshot_store: row.string(COL_ACTIVE_SNAPSHOT_STORE).map(str::to_string),
                connection_name: row.string(COL_ACTIVE_CONNECTION_NAME).map(str::to_string),
            },
            types: StreamTypeNames {
                stream: row
                    .string(COL_TYPE_STREAM)
                    .unwrap_or("eventStream")
                    .to_string(),
                document: row
                    .string(COL_TYPE_DOCUMENT)
                    .unwrap_or("objectDocument")
                    .to_string(),
                document_tag: row
                    .string(COL_TYPE_DOCUMENT_TAG)
                    .unwrap_or("documentTag")
                    .to_string(),
                event_stream_tag: row
                    .string(COL_TYPE_EVENT_STREAM_TAG)
                    .unwrap_or("eventStreamTag")
                    .to_string(),
                document_ref: row
                    .string(COL_TYPE_DOCUMENT_REF)
                    .unwrap_or("documentRef")
                    .to_string(),
            },
        };

        Ok(ObjectDocument {
            object_id: row.row_key.clone(),
            object_name: object_name.to_string(),
            active,
            terminated_streams,
            schema_version: row
                .string(COL_SCHEMA_VERSION)
                .unwrap_or(DOCUMENT_SCHEMA_VERSION)
                .to_string(),
            hash: row.string(COL_HASH).map(str::to_string),
            prev_hash: row.string(COL_PREV_HASH).map(str::to_string),
            document_path: None,
            etag: row.etag.clone(),
            loaded_hash: row.string(COL_HASH).map(str::to_string),
        })
    }

    async fn load_chunks(
        &self,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<StreamChunk>> {
        let mut chunks = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "document get")?;
            let query = RowQuery::partition(object_id).with_continuation(continuation.take());
            let page = match self.table.query(&self.chunk_table, &query, ctx).await {
                Ok(page) => page,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Table,
                }) => return Ok(chunks),
                Err(other) => return Err(self.map_substrate(other)),
            };
            for row in page.rows {
                chunks.push(StreamChunk {
                    chunk_id: row.row_key.parse().map_err(|_| {
                        StoreError::SerializationError {
                            message: format!("chunk row key {} is not numeric", row.row_key),
                        }
                    })?,
                    first_event_version: row.i64(COL_FIRST_EVENT_VERSION).unwrap_or(0),
                    last_event_version: row.i64(COL_LAST_EVENT_VERSION).unwrap_or(-1),
                });
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        chunks.sort_by_key(|chunk| chunk.chunk_id);
        Ok(chunks)
    }

    async fn load_terminated(
        &self,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<TerminatedStream>> {
        let mut terminated = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "document get")?;
            let query = RowQuery::partition(object_id).with_continuation(continuation.take());
            let page = match self.table.query(&self.terminated_table, &query, ctx).await {
                Ok(page) => page,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Table,
                }) => return Ok(terminated),
                Err(other) => return Err(self.map_substrate(other)),
            };
            for row in page.rows {
                terminated.push(TerminatedStream {
                    stream_id: row.row_key.clone(),
                    reason: row.string(COL_REASON).unwrap_or_default().to_string(),
                    continuation_stream_id: row
                        .string(COL_CONTINUATION_STREAM_ID)
                        .map(str::to_string),
                    termination_timestamp: row
                        .datetime(COL_TERMINATION_TIMESTAMP)
                        .unwrap_or_else(chrono::Utc::now),
                    version: row.i64(COL_TERMINATED_VERSION).unwrap_or(-1),
                    deleted: row.bool(COL_DELETED).unwrap_or(false),
                    deletion_timestamp: row.datetime(COL_DELETION_TIMESTAMP),
                });
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(terminated)
    }

    async fn persist_companions(
        &self,
        document: &ObjectDocument,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        if !document.active.chunks.is_empty() {
            ensure_table(self.table.as_ref(), &self.chunk_table, self.auto_create, ctx).await?;
            let operations: Vec<BatchOp> = document
                .active
                .chunks
                .iter()
                .map(|chunk| {
                    BatchOp::Upsert(
                        TableRow::new(document.object_id.clone(), format!("{:010}", chunk.chunk_id))
                            .with_i64(COL_FIRST_EVENT_VERSION, chunk.first_event_version)
                            .with_i64(COL_LAST_EVENT_VERSION, chunk.last_event_version),
                    )
                })
                .collect();
            for batch in operations.chunks(MAX_BATCH_OPERATIONS) {
                guard(ctx, "document set")?;
                self.table
                    .submit_batch(&self.chunk_table, &document.object_id, batch.to_vec(), ctx)
                    .await
                    .map_err(|e| self.map_substrate(e))?;
            }
        }

        if !document.terminated_streams.is_empty() {
            ensure_table(
                self.table.as_ref(),
                &self.terminated_table,
                self.auto_create,
                ctx,
            )
            .await?;
            let operations: Vec<BatchOp> = document
                .terminated_streams
                .iter()
                .map(|terminated| {
                    let mut row =
                        TableRow::new(document.object_id.clone(), terminated.stream_id.clone())
                            .with_string(COL_REASON, terminated.reason.clone())
                            .with_datetime(
                                COL_TERMINATION_TIMESTAMP,
                                terminated.termination_timestamp,
                            )
                            .with_i64(COL_TERMINATED_VERSION, terminated.version)
                            .with_bool(COL_DELETED, terminated.deleted);
                    if let Some(continuation) = &terminated.continuation_stream_id {
                        row = row.with_string(COL_CONTINUATION_STREAM_ID, continuation.clone());
                    }
                    if let Some(deleted_at) = terminated.deletion_timestamp {
                        row = row.with_datetime(COL_DELETION_TIMESTAMP, deleted_at);
                    }
                    BatchOp::Upsert(row)
                })
                .collect();
            for batch in operations.chunks(MAX_BATCH_OPERATIONS) {
                guard(ctx, "document set")?;
                self.table
                    .submit_batch(
                        &self.terminated_table,
                        &document.object_id,
                        batch.to_vec(),
                        ctx,
                    )
                    .await
                    .map_err(|e| self.map_substrate(e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for TableDocumentStore {
    async fn create(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectDocument> {
        match self.get(object_name, object_id, ctx).await {
            Ok(document) => return Ok(document),
            Err(StoreError::DocumentNotFound { .. }) => {}
            Err(other) => return Err(other),
        }

        ensure_table(
            self.table.as_ref(),
            &self.document_table,
            self.auto_create,
            ctx,
        )
        .await?;
        guard(ctx, "document create")?;

        let mut document =
            ObjectDocument::new(object_name, object_id, self.chunking_enabled, self.chunk_size);
        self.persist_companions(&document, ctx).await?;
        let row = Self::document_to_row(&document);
        match self
            .table
            .update(&self.document_table, row, &Precondition::CreateOnly, ctx)
            .await
        {
            Ok(etag) => {
                info!(
                    object_name = object_name,
                    object_id = object_id,
                    "created object document"
                );
                document.etag = Some(etag);
                Ok(document)
            }
            Err(SubstrateError::PreconditionFailed) | Err(SubstrateError::Conflict) => {
                self.get(object_name, object_id, ctx).await
            }
            Err(other) => Err(self.map_substrate(other)),
        }
    }

    async fn get(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectDocument> {
        guard(ctx, "document get")?;
        let row = match self
            .table
            .get(&self.document_table, &object_name.to_lowercase(), object_id, ctx)
            .await
        {
            Ok(row) => row,
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => {
                return Err(StoreError::DocumentNotFound {
                    object_name: object_name.to_string(),
                    object_id: object_id.to_string(),
                })
            }
            Err(other) => return Err(self.map_substrate(other)),
        };

        let chunks = self.load_chunks(object_id, ctx).await?;
        let terminated = self.load_terminated(object_id, ctx).await?;
        Self::row_to_document(&row, object_name, chunks, terminated)
    }

    async fn set(&self, document: &mut ObjectDocument, ctx: &CancellationToken) -> StoreResult<()> {
        chain_hashes(document)?;
        self.persist_companions(document, ctx).await?;
        guard(ctx, "document set")?;

        let row = Self::document_to_row(document);
        let precondition = match &document.etag {
            Some(etag) => Precondition::match_version(etag.clone()),
            None => Precondition::CreateOnly,
        };
        let etag = self
            .table
            .update(&self.document_table, row, &precondition, ctx)
            .await
            .map_err(|e| match e {
                SubstrateError::PreconditionFailed | SubstrateError::Conflict => {
                    StoreError::ConcurrencyConflict {
                        message: format!(
                            "object document {} was modified since it was loaded",
                            document.object_id
                        ),
                    }
                }
                other => self.map_substrate(other),
            })?;

        debug!(
            object_id = document.object_id.as_str(),
            version = document.active.current_version,
            "persisted object document"
        );
        document.etag = Some(etag);
        document.loaded_hash = document.hash.clone();
        Ok(())
    }

    async fn get_by_tag(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<ObjectDocument>> {
        let ids = self.tags.get(object_name, tag, ctx).await?;
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            documents.push(self.get(object_name, &id, ctx).await?);
        }
        Ok(documents)
    }

    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<ObjectDocument>> {
        let ids = self.tags.get(object_name, tag, ctx).await?;
        match ids.first() {
            Some(id) => Ok(Some(self.get(object_name, id, ctx).await?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{BlobTagStore, TableTagStore};
    use event_stream_core::substrate::{InMemoryBlobStore, InMemoryTableStore};

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn blob_store() -> BlobDocumentStore {
        let blob = Arc::new(InMemoryBlobStore::new());
        blob.create_container_if_not_exists("documents", &ctx())
            .await
            .unwrap();
        let tags = Arc::new(BlobTagStore::new(blob.clone(), "documents", false));
        BlobDocumentStore::new(blob, "documents", tags)
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = blob_store().await;
        let first = store.create("Item", "A", &ctx()).await.unwrap();
        let second = store.create("Item", "A", &ctx()).await.unwrap();
        assert_eq!(first.active.stream_id, second.active.stream_id);
        assert_eq!(second.active.current_version, -1);
    }

    #[tokio::test]
    async fn get_missing_document_is_typed() {
        let store = blob_store().await;
        let error = store.get("Item", "missing", &ctx()).await.unwrap_err();
        assert!(matches!(error, StoreError::DocumentNotFound { .. }));
    }

    #[tokio::test]
    async fn get_missing_container_is_operator_actionable() {
        let blob = Arc::new(InMemoryBlobStore::new());
        let tags = Arc::new(BlobTagStore::new(blob.clone(), "nowhere", false));
        let store = BlobDocumentStore::new(blob, "nowhere", tags);
        let error = store.get("Item", "A", &ctx()).await.unwrap_err();
        assert!(matches!(error, StoreError::ContainerNotFound { .. }));
    }

    #[tokio::test]
    async fn set_builds_a_hash_chain() {
        let store = blob_store().await;
        let mut document = store.create("Item", "A", &ctx()).await.unwrap();
        assert!(document.hash.is_none());

        document.active.current_version = 0;
        store.set(&mut document, &ctx()).await.unwrap();
        let first_hash = document.hash.clone().unwrap();
        assert!(document.prev_hash.is_none());

        document.active.current_version = 1;
        store.set(&mut document, &ctx()).await.unwrap();
        assert_eq!(document.prev_hash.as_deref(), Some(first_hash.as_str()));
        assert_ne!(document.hash.as_deref(), Some(first_hash.as_str()));

        let reloaded = store.get("Item", "A", &ctx()).await.unwrap();
        assert_eq!(reloaded.hash, document.hash);
        assert_eq!(reloaded.prev_hash, document.prev_hash);
    }

    #[tokio::test]
    async fn concurrent_set_loses_with_conflict() {
        let store = blob_store().await;
        store.create("Item", "A", &ctx()).await.unwrap();

        let mut winner = store.get("Item", "A", &ctx()).await.unwrap();
        let mut loser = store.get("Item", "A", &ctx()).await.unwrap();

        winner.active.current_version = 0;
        store.set(&mut winner, &ctx()).await.unwrap();

        loser.active.current_version = 0;
        let error = store.set(&mut loser, &ctx()).await.unwrap_err();
        assert!(matches!(error, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn table_document_round_trips_with_chunks() {
        let table = Arc::new(InMemoryTableStore::new());
        table
            .create_table_if_not_exists("documents", &ctx())
            .await
            .unwrap();
        table
            .create_table_if_not_exists("documentschunks", &ctx())
            .await
            .unwrap();
        table
            .create_table_if_not_exists("documentsterminated", &ctx())
            .await
            .unwrap();
        table
            .create_table_if_not_exists("tags", &ctx())
            .await
            .unwrap();
        let tags = Arc::new(TableTagStore::new(table.clone(), "tags", false));
        let store = TableDocumentStore::new(table, "documents", tags).with_chunking(1000);

        let mut document = store.create("Item", "A", &ctx()).await.unwrap();
        assert_eq!(document.active.chunks.len(), 1);

        document.active.current_version = 2;
        document.active.chunks[0].last_event_version = 2;
        store.set(&mut document, &ctx()).await.unwrap();

        let reloaded = store.get("Item", "A", &ctx()).await.unwrap();
        assert_eq!(reloaded.active.current_version, 2);
        assert_eq!(reloaded.active.chunks, document.active.chunks);
        assert_eq!(reloaded.hash, document.hash);
    }
}
