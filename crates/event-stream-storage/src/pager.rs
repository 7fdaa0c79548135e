// File: src/pager.rs
//
// Paginated enumeration of object ids by object name, with
// continuation tokens and duplicate suppression.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::substrate::{KvBlob, RowQuery, WideTable};

use crate::cancel::guard;

/// One page of object ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdPage {
    pub items: Vec<String>,
    pub page_size: usize,
    pub next_token: Option<String>,
}

/// Enumeration of the object ids known for an object name
#[async_trait]
pub trait ObjectIdPager: Send + Sync {
    /// One page of ids; pass the returned token to continue
    async fn get_object_ids(
        &self,
        object_name: &str,
        continuation: Option<String>,
        page_size: usize,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectIdPage>;

    /// Total id count. Enumerates every page; expensive on large
    /// namespaces. Returns 0 when the container or table is missing.
    async fn count(&self, object_name: &str, ctx: &CancellationToken) -> StoreResult<usize>;

    /// Point existence check for a single object
    async fn exists(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<bool>;
}

fn validate_page_size(page_size: usize) -> StoreResult<()> {
    if page_size < 1 {
        return Err(StoreError::InvalidArgument {
            message: "page size must be at least 1".to_string(),
        });
    }
    Ok(())
}

/// Blob pager: enumerates `{objectName_lc}/{objectId}.json` documents
pub struct BlobObjectIdPager {
    blob: Arc<dyn KvBlob>,
    container: String,
}

impl BlobObjectIdPager {
    pub fn new(blob: Arc<dyn KvBlob>, container: impl Into<String>) -> Self {
        Self {
            blob,
            container: container.into(),
        }
    }

    fn extract_object_id(prefix: &str, path: &str) -> Option<String> {
        path.strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .map(str::to_string)
    }
}

#[async_trait]
impl ObjectIdPager for BlobObjectIdPager {
    async fn get_object_ids(
        &self,
        object_name: &str,
        continuation: Option<String>,
        page_size: usize,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectIdPage> {
        validate_page_size(page_size)?;
        guard(ctx, "object id page")?;

        let prefix = format!("{}/", object_name.to_lowercase());
        let page = self
            .blob
            .list(&self.container, &prefix, continuation, page_size, ctx)
            .await
            .map_err(|e| StoreError::from_substrate(e, &self.container))?;

        // Paged enumeration can surface a name twice around page
        // boundaries; the set keeps the output unique.
        let mut seen = HashSet::new();
        let items: Vec<String> = page
            .items
            .iter()
            .filter_map(|path| Self::extract_object_id(&prefix, path))
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Ok(ObjectIdPage {
            items,
            page_size,
            next_token: page.next_token,
        })
    }

    async fn count(&self, object_name: &str, ctx: &CancellationToken) -> StoreResult<usize> {
        let mut total = 0usize;
        let mut continuation = None;
        loop {
            let page = match self
                .get_object_ids(object_name, continuation.take(), 100, ctx)
                .await
            {
                Ok(page) => page,
                Err(StoreError::ContainerNotFound { .. }) => return Ok(0),
                Err(other) => return Err(other),
            };
            total += page.items.len();
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(total)
    }

    async fn exists(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<bool> {
        guard(ctx, "object exists")?;
        let path = format!("{}/{}.json", object_name.to_lowercase(), object_id);
        self.blob
            .exists(&self.container, &path, ctx)
            .await
            .map_err(|e| StoreError::from_substrate(e, &self.container))
    }
}

/// Table pager: queries the document partition selecting row keys only
pub struct TableObjectIdPager {
    table: Arc<dyn WideTable>,
    table_name: String,
}

impl TableObjectIdPager {
    pub fn new(table: Arc<dyn WideTable>, table_name: impl Into<String>) -> Self {
        Self {
            table,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl ObjectIdPager for TableObjectIdPager {
    async fn get_object_ids(
        &self,
        object_name: &str,
        continuation: Option<String>,
        page_size: usize,
        ctx: &CancellationToken,
    ) -> StoreResult<ObjectIdPage> {
        validate_page_size(page_size)?;
        guard(ctx, "object id page")?;

        let query = RowQuery::partition(object_name.to_lowercase())
            .with_select(vec!["RowKey".to_string()])
            .with_page_size(page_size)
            .with_continuation(continuation);
        let page = self
            .table
            .query(&self.table_name, &query, ctx)
            .await
            .map_err(|e| StoreError::from_substrate(e, &self.table_name))?;

        let mut seen = HashSet::new();
        let items: Vec<String> = page
            .rows
            .into_iter()
            .map(|row| row.row_key)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Ok(ObjectIdPage {
            items,
            page_size,
            next_token: page.next_token,
        })
    }

    async fn count(&self, object_name: &str, ctx: &CancellationToken) -> StoreResult<usize> {
        let mut total = 0usize;
        let mut continuation = None;
        loop {
            let page = match self
                .get_object_ids(object_name, continuation.take(), 100, ctx)
                .await
            {
                Ok(page) => page,
                Err(StoreError::TableNotFound { .. }) => return Ok(0),
                Err(other) => return Err(other),
            };
            total += page.items.len();
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(total)
    }

    async fn exists(
        &self,
        object_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<bool> {
        guard(ctx, "object exists")?;
        match self
            .table
            .get(&self.table_name, &object_name.to_lowercase(), object_id, ctx)
            .await
        {
            Ok(_) => Ok(true),
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => Ok(false),
            Err(other) => Err(StoreError::from_substrate(other, &self.table_name)),
        }
    }
}
