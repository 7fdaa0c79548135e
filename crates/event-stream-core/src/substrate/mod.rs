// File: src/substrate/mod.rs
//
// Substrate capability surface: the blob and wide-column operations
// the stores depend on. Vendor SDKs implement these traits; the
// in-memory implementations in `memory` back the tests.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::SubstrateError;

pub use memory::{InMemoryBlobStore, InMemoryTableStore};

/// Result type for substrate operations
pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// Condition attached to a substrate write or delete.
///
/// Both substrates enforce these uniformly: a violated condition
/// yields `PreconditionFailed` instead of a lost update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional
    None,
    /// The target must not exist yet (If-None-Match: "*")
    CreateOnly,
    /// The target's version tag must match (If-Match: etag)
    MatchVersion(String),
}

impl Precondition {
    pub fn match_version(etag: impl Into<String>) -> Self {
        Precondition::MatchVersion(etag.into())
    }
}

/// Storage tier of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobTier {
    Hot,
    Cool,
    Cold,
    Archive,
}

impl std::fmt::Display for BlobTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobTier::Hot => write!(f, "hot"),
            BlobTier::Cool => write!(f, "cool"),
            BlobTier::Cold => write!(f, "cold"),
            BlobTier::Archive => write!(f, "archive"),
        }
    }
}

/// Priority for rehydrating a cold or archived blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehydratePriority {
    Standard,
    High,
}

/// Metadata returned for a blob without its content
#[derive(Debug, Clone, PartialEq)]
pub struct BlobProperties {
    pub etag: String,
    pub content_length: u64,
    pub tier: Option<BlobTier>,
}

/// A blob's content together with the version tag it was read at
#[derive(Debug, Clone)]
pub struct BlobContent {
    pub data: Bytes,
    pub etag: String,
}

/// One page of a prefix listing
#[derive(Debug, Clone)]
pub struct ListPage {
    pub items: Vec<String>,
    pub next_token: Option<String>,
}

/// Object-level blob capability with ETag preconditions
#[async_trait]
pub trait KvBlob: Send + Sync {
    /// Whether a blob exists at the path
    async fn exists(&self, container: &str, path: &str, ctx: &CancellationToken)
        -> SubstrateResult<bool>;

    /// Blob metadata; `NotFound` when absent
    async fn get_properties(
        &self,
        container: &str,
        path: &str,
        ctx: &CancellationToken,
    ) -> SubstrateResult<BlobProperties>;

    /// Read a blob's content, optionally under a precondition
    async fn read(
        &self,
        container: &str,
        path: &str,
        precondition: &Precondition,
        ctx: &CancellationToken,
    ) -> SubstrateResult<BlobContent>;

    /// Write a blob, optionally under a precondition
    async fn write(
        &self,
        container: &str,
        path: &str,
        data: Bytes,
        precondition: &Precondition,
        ctx: &CancellationToken,
    ) -> SubstrateResult<BlobProperties>;

    /// Delete a blob; `NotFound` when absent
    async fn delete(
        &self,
        container: &str,
        path: &str,
        precondition: &Precondition,
        ctx: &CancellationToken,
    ) -> SubstrateResult<()>;

    /// List blob names under a prefix with native paging
    async fn list(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<String>,
        page_size: usize,
        ctx: &CancellationToken,
    ) -> SubstrateResult<ListPage>;

    /// Move a blob between storage tiers
    async fn set_tier(
        &self,
        container: &str,
        path: &str,
        tier: BlobTier,
        priority: Option<RehydratePriority>,
        ctx: &CancellationToken,
    ) -> SubstrateResult<()>;

    /// Create the container when absent. Deploy-time operation; hot
    /// paths go through the process-wide verified-container set.
    async fn create_container_if_not_exists(
        &self,
        container: &str,
        ctx: &CancellationToken,
    ) -> SubstrateResult<()>;
}

/// A typed column value in a wide-column row
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Bool(bool),
    Binary(Vec<u8>),
    DateTime(DateTime<Utc>),
}

impl RowValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RowValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RowValue::Int64(value) => Some(*value),
            RowValue::Int32(value) => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            RowValue::Int32(value) => Some(*value),
            RowValue::Int64(value) => i32::try_from(*value).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RowValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RowValue::Binary(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            RowValue::DateTime(value) => Some(*value),
            _ => None,
        }
    }
}

/// A wide-column row: partition key, row key, version tag, and typed
/// properties.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    pub etag: Option<String>,
    pub properties: HashMap<String, RowValue>,
}

impl TableRow {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            etag: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_string(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties
            .insert(name.to_string(), RowValue::String(value.into()));
        self
    }

    pub fn with_i64(mut self, name: &str, value: i64) -> Self {
        self.properties
            .insert(name.to_string(), RowValue::Int64(value));
        self
    }

    pub fn with_i32(mut self, name: &str, value: i32) -> Self {
        self.properties
            .insert(name.to_string(), RowValue::Int32(value));
        self
    }

    pub fn with_bool(mut self, name: &str, value: bool) -> Self {
        self.properties
            .insert(name.to_string(), RowValue::Bool(value));
        self
    }

    pub fn with_bytes(mut self, name: &str, value: Vec<u8>) -> Self {
        self.properties
            .insert(name.to_string(), RowValue::Binary(value));
        self
    }

    pub fn with_datetime(mut self, name: &str, value: DateTime<Utc>) -> Self {
        self.properties
            .insert(name.to_string(), RowValue::DateTime(value));
        self
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(RowValue::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.properties.get(name).and_then(RowValue::as_i64)
    }

    pub fn i32(&self, name: &str) -> Option<i32> {
        self.properties.get(name).and_then(RowValue::as_i32)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.properties.get(name).and_then(RowValue::as_bool)
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.properties.get(name).and_then(RowValue::as_bytes)
    }

    pub fn datetime(&self, name: &str) -> Option<DateTime<Utc>> {
        self.properties.get(name).and_then(RowValue::as_datetime)
    }
}

/// A partition/range query over a table.
///
/// Every store query is either partition-scoped (events, snapshots,
/// tags, checkpoint chunks) or a full scan (status recovery); the row
/// key bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct RowQuery {
    pub partition_key: Option<String>,
    pub row_key_from: Option<String>,
    pub row_key_to: Option<String>,
    pub row_key_prefix: Option<String>,
    pub select: Option<Vec<String>>,
    pub page_size: Option<usize>,
    pub continuation: Option<String>,
}

impl RowQuery {
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: Some(partition_key.into()),
            ..Default::default()
        }
    }

    pub fn full_scan() -> Self {
        Self::default()
    }

    pub fn with_row_key_range(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.row_key_from = Some(from.into());
        self.row_key_to = Some(to.into());
        self
    }

    pub fn with_row_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.row_key_prefix = Some(prefix.into());
        self
    }

    pub fn with_select(mut self, columns: Vec<String>) -> Self {
        self.select = Some(columns);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_continuation(mut self, continuation: Option<String>) -> Self {
        self.continuation = continuation;
        self
    }
}

/// One page of query results
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub rows: Vec<TableRow>,
    pub next_token: Option<String>,
}

/// Operation in an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Insert; fails the batch with `Conflict` if the row exists
    Insert(TableRow),
    /// Insert-or-replace
    Upsert(TableRow),
    /// Delete by key; tolerated as a no-op when already absent
    Delete { row_key: String },
}

/// Upsert behaviour for single-row writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Merge properties into the existing row
    Merge,
    /// Replace the row wholesale
    Replace,
}

/// Maximum operations in one atomic batch
pub const MAX_BATCH_OPERATIONS: usize = 100;

/// Row get/put/delete/query capability with partition/row keys and
/// batch transactions
#[async_trait]
pub trait WideTable: Send + Sync {
    /// Point lookup; `NotFound` when the row is absent
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        ctx: &CancellationToken,
    ) -> SubstrateResult<TableRow>;

    /// Range/partition query with native paging
    async fn query(
        &self,
        table: &str,
        query: &RowQuery,
        ctx: &CancellationToken,
    ) -> SubstrateResult<QueryPage>;

    /// Submit a batch atomically. All operations must share one
    /// partition key and the batch may hold at most
    /// [`MAX_BATCH_OPERATIONS`] entries.
    async fn submit_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOp>,
        ctx: &CancellationToken,
    ) -> SubstrateResult<()>;

    /// Insert-or-update a single row
    async fn upsert(
        &self,
        table: &str,
        row: TableRow,
        mode: UpsertMode,
        ctx: &CancellationToken,
    ) -> SubstrateResult<()>;

    /// Update a row under a precondition, returning the new version tag
    async fn update(
        &self,
        table: &str,
        row: TableRow,
        precondition: &Precondition,
        ctx: &CancellationToken,
    ) -> SubstrateResult<String>;

    /// Delete a row, optionally version-matched; `NotFound` when the
    /// row is absent
    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
        ctx: &CancellationToken,
    ) -> SubstrateResult<()>;

    /// Create the table when absent. Deploy-time operation.
    async fn create_table_if_not_exists(
        &self,
        table: &str,
        ctx: &CancellationToken,
    ) -> SubstrateResult<()>;
}
