// File: src/serializer.rs
//
// Wire mapping for events: the single-JSON blob container record and
// the wide-column row entity, including the large-payload columns.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::codec::{PayloadEncoding, PAYLOAD_SENTINEL};
use crate::error::{StoreError, StoreResult};
use crate::model::Event;
use crate::substrate::TableRow;

// Column names on the table substrate. The layout is bit-level stable;
// renaming any of these is a breaking storage change.
pub const COL_OBJECT_ID: &str = "ObjectId";
pub const COL_STREAM_IDENTIFIER: &str = "StreamIdentifier";
pub const COL_EVENT_VERSION: &str = "EventVersion";
pub const COL_EVENT_TYPE: &str = "EventType";
pub const COL_SCHEMA_VERSION: &str = "SchemaVersion";
pub const COL_CHUNK_IDENTIFIER: &str = "ChunkIdentifier";
pub const COL_LAST_DOCUMENT_HASH: &str = "LastObjectDocumentHash";
pub const COL_PAYLOAD: &str = "Payload";
pub const COL_PAYLOAD_DATA: &str = "PayloadData";
pub const COL_PAYLOAD_CHUNKED: &str = "PayloadChunked";
pub const COL_PAYLOAD_TOTAL_CHUNKS: &str = "PayloadTotalChunks";
pub const COL_PAYLOAD_CHUNK_INDEX: &str = "PayloadChunkIndex";
pub const COL_PAYLOAD_COMPRESSED: &str = "PayloadCompressed";
pub const COL_EVENT_TIMESTAMP: &str = "EventTimestamp";
pub const COL_METADATA: &str = "Metadata";

/// Row key for an event: the version zero-padded to twenty digits so
/// lexical row order equals version order.
pub fn format_event_row_key(version: i64) -> String {
    format!("{:020}", version)
}

/// Row key of the i-th continuation chunk of a large payload
pub fn continuation_row_key(primary_row_key: &str, index: usize) -> String {
    format!("{}_p{}", primary_row_key, index)
}

/// Whether a row is a large-payload continuation chunk. Continuation
/// rows must stay invisible to range reads.
pub fn is_continuation_row(row: &TableRow) -> bool {
    row.i32(COL_PAYLOAD_CHUNK_INDEX).unwrap_or(0) > 0
}

/// Payload layout flags read back from a primary row
#[derive(Debug, Clone, Copy)]
pub struct PayloadColumns {
    pub chunked: bool,
    pub total_chunks: i32,
    pub compressed: bool,
}

pub fn payload_columns(row: &TableRow) -> PayloadColumns {
    PayloadColumns {
        chunked: row.bool(COL_PAYLOAD_CHUNKED).unwrap_or(false),
        total_chunks: row.i32(COL_PAYLOAD_TOTAL_CHUNKS).unwrap_or(1),
        compressed: row.bool(COL_PAYLOAD_COMPRESSED).unwrap_or(false),
    }
}

/// Convert an event into its table rows: the primary row plus any
/// continuation rows for a chunked payload.
pub fn event_to_rows(
    event: &Event,
    partition_key: &str,
    object_id: &str,
    stream_id: &str,
    chunk_id: Option<i32>,
    last_document_hash: &str,
    encoding: &PayloadEncoding,
) -> StoreResult<Vec<TableRow>> {
    let primary_row_key = format_event_row_key(event.event_version);
    let metadata_json = serde_json::to_string(&event.metadata)?;

    let mut primary = TableRow::new(partition_key, primary_row_key.clone())
        .with_string(COL_OBJECT_ID, object_id)
        .with_string(COL_STREAM_IDENTIFIER, stream_id)
        .with_i64(COL_EVENT_VERSION, event.event_version)
        .with_string(COL_EVENT_TYPE, event.event_type.clone())
        .with_string(COL_SCHEMA_VERSION, event.schema_version.clone())
        .with_string(COL_LAST_DOCUMENT_HASH, last_document_hash)
        .with_datetime(COL_EVENT_TIMESTAMP, event.timestamp)
        .with_string(COL_METADATA, metadata_json)
        .with_i32(COL_PAYLOAD_CHUNK_INDEX, 0);
    if let Some(chunk_id) = chunk_id {
        primary = primary.with_i32(COL_CHUNK_IDENTIFIER, chunk_id);
    }

    let mut rows = Vec::new();
    match encoding {
        PayloadEncoding::Inline { payload } => {
            primary = primary
                .with_string(COL_PAYLOAD, payload.clone())
                .with_bool(COL_PAYLOAD_CHUNKED, false)
                .with_i32(COL_PAYLOAD_TOTAL_CHUNKS, 1)
                .with_bool(COL_PAYLOAD_COMPRESSED, false);
            rows.push(primary);
        }
        PayloadEncoding::Binary { data, compressed } => {
            primary = primary
                .with_string(COL_PAYLOAD, PAYLOAD_SENTINEL)
                .with_bytes(COL_PAYLOAD_DATA, data.clone())
                .with_bool(COL_PAYLOAD_CHUNKED, false)
                .with_i32(COL_PAYLOAD_TOTAL_CHUNKS, 1)
                .with_bool(COL_PAYLOAD_COMPRESSED, *compressed);
            rows.push(primary);
        }
        PayloadEncoding::Chunked { chunks, compressed } => {
            let total = chunks.len() as i32;
            primary = primary
                .with_string(COL_PAYLOAD, PAYLOAD_SENTINEL)
                .with_bytes(COL_PAYLOAD_DATA, chunks[0].clone())
                .with_bool(COL_PAYLOAD_CHUNKED, true)
                .with_i32(COL_PAYLOAD_TOTAL_CHUNKS, total)
                .with_bool(COL_PAYLOAD_COMPRESSED, *compressed);
            rows.push(primary);

            for (index, chunk) in chunks.iter().enumerate().skip(1) {
                rows.push(
                    TableRow::new(partition_key, continuation_row_key(&primary_row_key, index))
                        .with_string(COL_OBJECT_ID, object_id)
                        .with_string(COL_STREAM_IDENTIFIER, stream_id)
                        .with_i64(COL_EVENT_VERSION, event.event_version)
                        .with_bytes(COL_PAYLOAD_DATA, chunk.clone())
                        .with_bool(COL_PAYLOAD_CHUNKED, true)
                        .with_i32(COL_PAYLOAD_TOTAL_CHUNKS, total)
                        .with_i32(COL_PAYLOAD_CHUNK_INDEX, index as i32)
                        .with_bool(COL_PAYLOAD_COMPRESSED, *compressed),
                );
            }
        }
    }
    Ok(rows)
}

/// Rebuild an event from its primary row and the decoded payload text
pub fn row_to_event(row: &TableRow, payload_json: &str) -> StoreResult<Event> {
    let event_version =
        row.i64(COL_EVENT_VERSION)
            .ok_or_else(|| StoreError::SerializationError {
                message: format!("row {} has no event version", row.row_key),
            })?;
    let event_type = row
        .string(COL_EVENT_TYPE)
        .ok_or_else(|| StoreError::SerializationError {
            message: format!("row {} has no event type", row.row_key),
        })?
        .to_string();
    let schema_version = row
        .string(COL_SCHEMA_VERSION)
        .unwrap_or("1.0.0")
        .to_string();
    let timestamp =
        row.datetime(COL_EVENT_TIMESTAMP)
            .ok_or_else(|| StoreError::SerializationError {
                message: format!("row {} has no timestamp", row.row_key),
            })?;
    let metadata: HashMap<String, String> = match row.string(COL_METADATA) {
        Some(raw) => serde_json::from_str(raw)?,
        None => HashMap::new(),
    };
    let payload =
        serde_json::from_str(payload_json).map_err(|e| StoreError::SerializationError {
            message: format!("row {} payload is not valid JSON: {}", row.row_key, e),
        })?;

    Ok(Event {
        event_version,
        event_type,
        schema_version,
        payload,
        timestamp,
        metadata,
    })
}

/// The single-JSON event container stored per stream (or per chunk) on
/// the blob substrate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventStreamRecord {
    pub object_id: String,
    pub object_name: String,
    pub last_object_document_hash: String,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl EventStreamRecord {
    pub fn new(
        object_id: impl Into<String>,
        object_name: impl Into<String>,
        last_object_document_hash: impl Into<String>,
    ) -> Self {
        Self {
            object_id: object_id.into(),
            object_name: object_name.into(),
            last_object_document_hash: last_object_document_hash.into(),
            events: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> StoreResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data).map_err(|e| StoreError::SerializationError {
            message: format!("event container is not valid JSON: {}", e),
        })
    }

    /// The tail event of the container, if any
    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }
}
