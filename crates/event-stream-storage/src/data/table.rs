// File: src/data/table.rs
//
// Wide-column event streams: one row per event keyed by the padded
// version, large payloads split across sibling rows, appends submitted
// as per-partition atomic batches.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use event_stream_core::codec::PayloadCodec;
use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::model::{Event, ObjectDocument};
use event_stream_core::serializer::{
    self, continuation_row_key, event_to_rows, format_event_row_key, is_continuation_row,
    payload_columns, row_to_event,
};
use event_stream_core::substrate::{
    BatchOp, RowQuery, TableRow, WideTable, MAX_BATCH_OPERATIONS,
};

use super::{in_range, stamp_timestamps, validate_append, DataStore, EventReadStream};
use crate::cancel::guard;
use crate::containers::ensure_table;

/// Event stream store writing one row per event
pub struct TableDataStore {
    table: Arc<dyn WideTable>,
    table_name: String,
    codec: PayloadCodec,
    page_size: usize,
    auto_create: bool,
}

impl TableDataStore {
    pub fn new(table: Arc<dyn WideTable>, table_name: impl Into<String>) -> Self {
        Self {
            table,
            table_name: table_name.into(),
            codec: PayloadCodec::default(),
            page_size: 100,
            auto_create: false,
        }
    }

    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.table_name)
    }

    fn partition_for(document: &ObjectDocument, chunk: Option<i32>) -> String {
        match chunk {
            Some(chunk_id) => document.active.chunk_partition_key(chunk_id),
            None => document.active.partition_key(),
        }
    }

    /// Partition an append lands in: the chunk covering the first new
    /// version, so a freshly rolled empty tail never swallows events
    /// that belong to its predecessor.
    fn append_partition(document: &ObjectDocument, first_version: i64) -> String {
        if document.active.chunking_enabled {
            if let Some(chunk) = document.active.chunk_for_append(first_version) {
                return document.active.chunk_partition_key(chunk.chunk_id);
            }
        }
        document.active.partition_key()
    }

    /// Scan the partition for the tail event's type: the stream is
    /// closed when the highest primary row is the closure marker.
    async fn tail_event_type(
        &self,
        partition: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<String>> {
        let mut tail: Option<(String, String)> = None;
        let mut continuation = None;
        loop {
            guard(ctx, "append")?;
            let query = RowQuery::partition(partition)
                .with_select(vec![
                    serializer::COL_EVENT_TYPE.to_string(),
                    serializer::COL_PAYLOAD_CHUNK_INDEX.to_string(),
                ])
                .with_page_size(self.page_size)
                .with_continuation(continuation.take());
            let page = match self.table.query(&self.table_name, &query, ctx).await {
                Ok(page) => page,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Table,
                }) => return Ok(None),
                Err(other) => return Err(self.map_substrate(other)),
            };
            for row in page.rows {
                if is_continuation_row(&row) {
                    continue;
                }
                let event_type = row
                    .string(serializer::COL_EVENT_TYPE)
                    .unwrap_or_default()
                    .to_string();
                match &tail {
                    Some((row_key, _)) if row.row_key <= *row_key => {}
                    _ => tail = Some((row.row_key, event_type)),
                }
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(tail.map(|(_, event_type)| event_type))
    }

    /// Reassemble the payload text of a primary row, fetching any
    /// continuation chunks.
    async fn payload_text(
        &self,
        partition: &str,
        row: &TableRow,
        ctx: &CancellationToken,
    ) -> StoreResult<String> {
        let columns = payload_columns(row);
        let Some(primary_data) = row.bytes(serializer::COL_PAYLOAD_DATA) else {
            return Ok(row
                .string(serializer::COL_PAYLOAD)
                .unwrap_or_default()
                .to_string());
        };

        if !columns.chunked {
            return self.codec.decode(primary_data, columns.compressed);
        }

        let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(columns.total_chunks as usize);
        chunks.push(primary_data.to_vec());
        for index in 1..columns.total_chunks as usize {
            guard(ctx, "read")?;
            let row_key = continuation_row_key(&row.row_key, index);
            let chunk_row = match self.table.get(&self.table_name, partition, &row_key, ctx).await {
                Ok(chunk_row) => chunk_row,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Row,
                }) => {
                    return Err(StoreError::CorruptPayload {
                        message: format!(
                            "payload chunk {} of row {} is missing",
                            index, row.row_key
                        ),
                    })
                }
                Err(other) => return Err(self.map_substrate(other)),
            };
            let data = chunk_row
                .bytes(serializer::COL_PAYLOAD_DATA)
                .ok_or_else(|| StoreError::CorruptPayload {
                    message: format!("payload chunk row {} has no data", row_key),
                })?;
            chunks.push(data.to_vec());
        }
        self.codec.reassemble(&chunks, columns.compressed)
    }
}

#[async_trait]
impl DataStore for TableDataStore {
    async fn append(
        &self,
        document: &ObjectDocument,
        preserve_timestamps: bool,
        mut events: Vec<Event>,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        validate_append(document, &events)?;
        stamp_timestamps(&mut events, preserve_timestamps);
        ensure_table(self.table.as_ref(), &self.table_name, self.auto_create, ctx).await?;

        let first_version = events[0].event_version;
        let partition = Self::append_partition(document, first_version);
        if let Some(tail_type) = self.tail_event_type(&partition, ctx).await? {
            if tail_type == event_stream_core::EVENT_STREAM_CLOSED {
                return Err(StoreError::StreamClosed {
                    stream_id: document.active.stream_id.clone(),
                });
            }
        }

        let chunk_id = document
            .active
            .chunk_for_append(first_version)
            .map(|chunk| chunk.chunk_id);
        let document_hash = document.hash_or_star();
        let mut operations = Vec::new();
        for event in &events {
            let encoding = self.codec.encode(&event.payload.to_string())?;
            let rows = event_to_rows(
                event,
                &partition,
                &document.object_id,
                &document.active.stream_id,
                chunk_id,
                &document_hash,
                &encoding,
            )?;
            operations.extend(rows.into_iter().map(BatchOp::Insert));
        }

        let count = events.len();
        for batch in operations.chunks(MAX_BATCH_OPERATIONS) {
            guard(ctx, "append")?;
            match self
                .table
                .submit_batch(&self.table_name, &partition, batch.to_vec(), ctx)
                .await
            {
                Ok(()) => {}
                Err(SubstrateError::Conflict) | Err(SubstrateError::PreconditionFailed) => {
                    return Err(StoreError::ConcurrencyConflict {
                        message: format!(
                            "event rows already exist on stream {}",
                            document.active.stream_id
                        ),
                    })
                }
                Err(other) => return Err(self.map_substrate(other)),
            }
        }
        debug!(
            stream = document.active.stream_id.as_str(),
            partition = partition.as_str(),
            events = count,
            "appended events"
        );
        Ok(())
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        chunk: Option<i32>,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<Vec<Event>>> {
        let partition = Self::partition_for(document, chunk);
        let from = format_event_row_key(start_version.max(0));
        let to = format_event_row_key(until_version.unwrap_or(i64::MAX));

        let mut events = Vec::new();
        let mut rows_seen = 0usize;
        let mut continuation = None;
        loop {
            guard(ctx, "read")?;
            let query = RowQuery::partition(&partition)
                .with_row_key_range(from.clone(), to.clone())
                .with_page_size(self.page_size)
                .with_continuation(continuation.take());
            let page = self
                .table
                .query(&self.table_name, &query, ctx)
                .await
                .map_err(|e| self.map_substrate(e))?;
            for row in &page.rows {
                rows_seen += 1;
                if is_continuation_row(row) {
                    continue;
                }
                let payload = self.payload_text(&partition, row, ctx).await?;
                let event = row_to_event(row, &payload)?;
                if in_range(event.event_version, start_version, until_version) {
                    events.push(event);
                }
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        if rows_seen == 0 {
            return Ok(None);
        }
        Ok(Some(events))
    }

    fn read_stream(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        ctx: CancellationToken,
    ) -> EventReadStream {
        let table = Arc::clone(&self.table);
        let table_name = self.table_name.clone();
        let codec = self.codec.clone();
        let page_size = self.page_size;
        let partition = Self::partition_for(document, None);
        let from = format_event_row_key(start_version.max(0));
        let to = format_event_row_key(until_version.unwrap_or(i64::MAX));

        let stream = async_stream::try_stream! {
            let mut continuation: Option<String> = None;
            loop {
                guard(&ctx, "read stream")?;
                let query = RowQuery::partition(&partition)
                    .with_row_key_range(from.clone(), to.clone())
                    .with_page_size(page_size)
                    .with_continuation(continuation.take());
                let page = table
                    .query(&table_name, &query, &ctx)
                    .await
                    .map_err(|e| StoreError::from_substrate(e, &table_name))?;
                for row in &page.rows {
                    if is_continuation_row(row) {
                        continue;
                    }
                    guard(&ctx, "read stream")?;
                    let payload = reassemble_payload(
                        table.as_ref(),
                        &table_name,
                        &codec,
                        &partition,
                        row,
                        &ctx,
                    )
                    .await?;
                    let event = row_to_event(row, &payload)?;
                    if in_range(event.event_version, start_version, until_version) {
                        yield event;
                    }
                }
                match page.next_token {
                    Some(token) => continuation = Some(token),
                    None => break,
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
        let partition = Self::partition_for(document, None);
        let mut removed = 0usize;
        for version in from_version..=to_version {
            guard(ctx, "remove events")?;
            let row_key = format_event_row_key(version);
            let row = match self.table.get(&self.table_name, &partition, &row_key, ctx).await {
                Ok(row) => row,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Row,
                }) => continue,
                Err(other) => return Err(self.map_substrate(other)),
            };

            let columns = payload_columns(&row);
            if columns.chunked && columns.total_chunks > 1 {
                for index in 1..columns.total_chunks as usize {
                    guard(ctx, "remove events")?;
                    let chunk_key = continuation_row_key(&row_key, index);
                    match self
                        .table
                        .delete(&self.table_name, &partition, &chunk_key, None, ctx)
                        .await
                    {
                        Ok(()) => {}
                        Err(SubstrateError::NotFound {
                            kind: NotFoundKind::Row,
                        }) => {}
                        Err(other) => return Err(self.map_substrate(other)),
                    }
                }
            }

            match self
                .table
                .delete(&self.table_name, &partition, &row_key, None, ctx)
                .await
            {
                Ok(()) => removed += 1,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Row,
                }) => {}
                Err(other) => return Err(self.map_substrate(other)),
            }
        }
        if removed > 0 {
            info!(
                stream = document.active.stream_id.as_str(),
                from = from_version,
                to = to_version,
                removed = removed,
                "removed events for failed commit"
            );
        }
        Ok(removed)
    }
}

/// Free-function variant of the payload reassembly used by the
/// streaming reader, which cannot borrow `self`.
async fn reassemble_payload(
    table: &dyn WideTable,
    table_name: &str,
    codec: &PayloadCodec,
    partition: &str,
    row: &TableRow,
    ctx: &CancellationToken,
) -> StoreResult<String> {
    let columns = payload_columns(row);
    let Some(primary_data) = row.bytes(serializer::COL_PAYLOAD_DATA) else {
        return Ok(row
            .string(serializer::COL_PAYLOAD)
            .unwrap_or_default()
            .to_string());
    };
    if !columns.chunked {
        return codec.decode(primary_data, columns.compressed);
    }
    let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(columns.total_chunks as usize);
    chunks.push(primary_data.to_vec());
    for index in 1..columns.total_chunks as usize {
        let row_key = continuation_row_key(&row.row_key, index);
        let chunk_row = match table.get(table_name, partition, &row_key, ctx).await {
            Ok(chunk_row) => chunk_row,
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => {
                return Err(StoreError::CorruptPayload {
                    message: format!("payload chunk {} of row {} is missing", index, row.row_key),
                })
            }
            Err(other) => return Err(StoreError::from_substrate(other, table_name)),
        };
        let data = chunk_row
            .bytes(serializer::COL_PAYLOAD_DATA)
            .ok_or_else(|| StoreError::CorruptPayload {
                message: format!("payload chunk row {} has no data", row_key),
            })?;
        chunks.push(data.to_vec());
    }
    codec.reassemble(&chunks, columns.compressed)
}
