// File: src/substrate/memory.rs
//
// In-memory substrate implementations backing tests and local
// development. Containers and tables must be created explicitly so
// missing-namespace conditions behave like the real substrates.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    BatchOp, BlobContent, BlobProperties, BlobTier, KvBlob, ListPage, Precondition, QueryPage,
    RehydratePriority, RowQuery, SubstrateResult, TableRow, UpsertMode, WideTable,
    MAX_BATCH_OPERATIONS,
};
use crate::error::{NotFoundKind, SubstrateError};

fn new_etag() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    etag: String,
    tier: BlobTier,
}

/// In-memory blob substrate with etag simulation
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    containers: Arc<RwLock<HashMap<String, BTreeMap<String, StoredBlob>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_precondition(
        existing: Option<&StoredBlob>,
        precondition: &Precondition,
    ) -> SubstrateResult<()> {
        match (precondition, existing) {
            (Precondition::None, _) => Ok(()),
            (Precondition::CreateOnly, None) => Ok(()),
            (Precondition::CreateOnly, Some(_)) => Err(SubstrateError::PreconditionFailed),
            (Precondition::MatchVersion(_), None) => Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            }),
            (Precondition::MatchVersion(etag), Some(blob)) => {
                if &blob.etag == etag {
                    Ok(())
                } else {
                    Err(SubstrateError::PreconditionFailed)
                }
            }
        }
    }
}

#[async_trait]
impl KvBlob for InMemoryBlobStore {
    async fn exists(
        &self,
        container: &str,
        path: &str,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<bool> {
        let containers = self.containers.read().await;
        let blobs = containers.get(container).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Container,
        })?;
        Ok(blobs.contains_key(path))
    }

    async fn get_properties(
        &self,
        container: &str,
        path: &str,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<BlobProperties> {
        let containers = self.containers.read().await;
        let blobs = containers.get(container).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Container,
        })?;
        let blob = blobs.get(path).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Blob,
        })?;
        Ok(BlobProperties {
            etag: blob.etag.clone(),
            content_length: blob.data.len() as u64,
            tier: Some(blob.tier),
        })
    }

    async fn read(
        &self,
        container: &str,
        path: &str,
        precondition: &Precondition,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<BlobContent> {
        let containers = self.containers.read().await;
        let blobs = containers.get(container).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Container,
        })?;
        let blob = blobs.get(path);
        Self::check_precondition(blob, precondition)?;
        let blob = blob.ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Blob,
        })?;
        Ok(BlobContent {
            data: blob.data.clone(),
            etag: blob.etag.clone(),
        })
    }

    async fn write(
        &self,
        container: &str,
        path: &str,
        data: Bytes,
        precondition: &Precondition,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<BlobProperties> {
        let mut containers = self.containers.write().await;
        let blobs = containers
            .get_mut(container)
            .ok_or(SubstrateError::NotFound {
                kind: NotFoundKind::Container,
            })?;
        Self::check_precondition(blobs.get(path), precondition)?;
        let content_length = data.len() as u64;
        let stored = StoredBlob {
            data,
            etag: new_etag(),
            tier: BlobTier::Hot,
        };
        let properties = BlobProperties {
            etag: stored.etag.clone(),
            content_length,
            tier: Some(stored.tier),
        };
        blobs.insert(path.to_string(), stored);
        Ok(properties)
    }

    async fn delete(
        &self,
        container: &str,
        path: &str,
        precondition: &Precondition,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<()> {
        let mut containers = self.containers.write().await;
        let blobs = containers
            .get_mut(container)
            .ok_or(SubstrateError::NotFound {
                kind: NotFoundKind::Container,
            })?;
        if !blobs.contains_key(path) {
            return Err(SubstrateError::NotFound {
                kind: NotFoundKind::Blob,
            });
        }
        Self::check_precondition(blobs.get(path), precondition)?;
        blobs.remove(path);
        Ok(())
    }

    async fn list(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<String>,
        page_size: usize,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<ListPage> {
        let containers = self.containers.read().await;
        let blobs = containers.get(container).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Container,
        })?;
        let page_size = page_size.max(1);
        let mut items = Vec::new();
        let mut next_token = None;
        for name in blobs.keys() {
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(after) = continuation.as_deref() {
                if name.as_str() <= after {
                    continue;
                }
            }
            if items.len() == page_size {
                next_token = items.last().cloned();
                break;
            }
            items.push(name.clone());
        }
        Ok(ListPage { items, next_token })
    }

    async fn set_tier(
        &self,
        container: &str,
        path: &str,
        tier: BlobTier,
        _priority: Option<RehydratePriority>,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<()> {
        let mut containers = self.containers.write().await;
        let blobs = containers
            .get_mut(container)
            .ok_or(SubstrateError::NotFound {
                kind: NotFoundKind::Container,
            })?;
        let blob = blobs.get_mut(path).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Blob,
        })?;
        blob.tier = tier;
        Ok(())
    }

    async fn create_container_if_not_exists(
        &self,
        container: &str,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<()> {
        let mut containers = self.containers.write().await;
        containers.entry(container.to_string()).or_default();
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    properties: HashMap<String, super::RowValue>,
    etag: String,
}

/// In-memory wide-column substrate with per-partition atomic batches
#[derive(Clone, Default)]
pub struct InMemoryTableStore {
    tables: Arc<RwLock<HashMap<String, BTreeMap<(String, String), StoredRow>>>>,
}

const QUERY_TOKEN_SEPARATOR: char = '\u{1}';

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn to_row(key: &(String, String), stored: &StoredRow, select: &Option<Vec<String>>) -> TableRow {
        let properties = match select {
            Some(columns) => stored
                .properties
                .iter()
                .filter(|(name, _)| columns.iter().any(|c| c.as_str() == name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => stored.properties.clone(),
        };
        TableRow {
            partition_key: key.0.clone(),
            row_key: key.1.clone(),
            etag: Some(stored.etag.clone()),
            properties,
        }
    }

    fn matches(query: &RowQuery, key: &(String, String)) -> bool {
        if let Some(partition) = &query.partition_key {
            if &key.0 != partition {
                return false;
            }
        }
        if let Some(from) = &query.row_key_from {
            if key.1.as_str() < from.as_str() {
                return false;
            }
        }
        if let Some(to) = &query.row_key_to {
            if key.1.as_str() > to.as_str() {
                return false;
            }
        }
        if let Some(prefix) = &query.row_key_prefix {
            if !key.1.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl WideTable for InMemoryTableStore {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<TableRow> {
        let tables = self.tables.read().await;
        let rows = tables.get(table).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Table,
        })?;
        let key = (partition_key.to_string(), row_key.to_string());
        let stored = rows.get(&key).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Row,
        })?;
        Ok(Self::to_row(&key, stored, &None))
    }

    async fn query(
        &self,
        table: &str,
        query: &RowQuery,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<QueryPage> {
        let tables = self.tables.read().await;
        let rows = tables.get(table).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Table,
        })?;
        let page_size = query.page_size.unwrap_or(usize::MAX).max(1);
        let after = query.continuation.as_deref().and_then(|token| {
            token
                .split_once(QUERY_TOKEN_SEPARATOR)
                .map(|(pk, rk)| (pk.to_string(), rk.to_string()))
        });

        let mut out: Vec<TableRow> = Vec::new();
        let mut next_token = None;
        for (key, stored) in rows.iter() {
            if !Self::matches(query, key) {
                continue;
            }
            if let Some(after) = &after {
                if key <= after {
                    continue;
                }
            }
            if out.len() == page_size {
                if let Some(last) = out.last() {
                    next_token = Some(format!(
                        "{}{}{}",
                        last.partition_key, QUERY_TOKEN_SEPARATOR, last.row_key
                    ));
                }
                break;
            }
            out.push(Self::to_row(key, stored, &query.select));
        }
        Ok(QueryPage {
            rows: out,
            next_token,
        })
    }

    async fn submit_batch(
        &self,
        table: &str,
        partition_key: &str,
        operations: Vec<BatchOp>,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<()> {
        if operations.len() > MAX_BATCH_OPERATIONS {
            return Err(SubstrateError::Transient {
                message: format!(
                    "batch of {} exceeds the {}-operation transaction limit",
                    operations.len(),
                    MAX_BATCH_OPERATIONS
                ),
            });
        }
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Table,
        })?;

        // Validate the whole batch before touching anything so the
        // transaction stays atomic.
        for operation in &operations {
            match operation {
                BatchOp::Insert(row) => {
                    if row.partition_key != partition_key {
                        return Err(SubstrateError::Transient {
                            message: "batch operations span partitions".to_string(),
                        });
                    }
                    let key = (row.partition_key.clone(), row.row_key.clone());
                    if rows.contains_key(&key) {
                        return Err(SubstrateError::Conflict);
                    }
                }
                BatchOp::Upsert(row) => {
                    if row.partition_key != partition_key {
                        return Err(SubstrateError::Transient {
                            message: "batch operations span partitions".to_string(),
                        });
                    }
                }
                BatchOp::Delete { .. } => {}
            }
        }

        for operation in operations {
            match operation {
                BatchOp::Insert(row) | BatchOp::Upsert(row) => {
                    let key = (row.partition_key.clone(), row.row_key.clone());
                    rows.insert(
                        key,
                        StoredRow {
                            properties: row.properties,
                            etag: new_etag(),
                        },
                    );
                }
                BatchOp::Delete { row_key } => {
                    rows.remove(&(partition_key.to_string(), row_key));
                }
            }
        }
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        row: TableRow,
        mode: UpsertMode,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Table,
        })?;
        let key = (row.partition_key.clone(), row.row_key.clone());
        match (mode, rows.get_mut(&key)) {
            (UpsertMode::Merge, Some(existing)) => {
                existing.properties.extend(row.properties);
                existing.etag = new_etag();
            }
            _ => {
                rows.insert(
                    key,
                    StoredRow {
                        properties: row.properties,
                        etag: new_etag(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        row: TableRow,
        precondition: &Precondition,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<String> {
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Table,
        })?;
        let key = (row.partition_key.clone(), row.row_key.clone());
        match precondition {
            Precondition::CreateOnly => {
                if rows.contains_key(&key) {
                    return Err(SubstrateError::PreconditionFailed);
                }
            }
            Precondition::MatchVersion(etag) => match rows.get(&key) {
                None => {
                    return Err(SubstrateError::NotFound {
                        kind: NotFoundKind::Row,
                    })
                }
                Some(existing) if &existing.etag != etag => {
                    return Err(SubstrateError::PreconditionFailed)
                }
                Some(_) => {}
            },
            Precondition::None => {
                if !rows.contains_key(&key) {
                    return Err(SubstrateError::NotFound {
                        kind: NotFoundKind::Row,
                    });
                }
            }
        }
        let etag = new_etag();
        rows.insert(
            key,
            StoredRow {
                properties: row.properties,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        etag: Option<&str>,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or(SubstrateError::NotFound {
            kind: NotFoundKind::Table,
        })?;
        let key = (partition_key.to_string(), row_key.to_string());
        match rows.get(&key) {
            None => {
                return Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Row,
                })
            }
            Some(existing) => {
                if let Some(expected) = etag {
                    if existing.etag != expected {
                        return Err(SubstrateError::PreconditionFailed);
                    }
                }
            }
        }
        rows.remove(&key);
        Ok(())
    }

    async fn create_table_if_not_exists(
        &self,
        table: &str,
        _ctx: &CancellationToken,
    ) -> SubstrateResult<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_string()).or_default();
        Ok(())
    }
}
