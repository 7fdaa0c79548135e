// File: src/model/stream.rs
//
// Stream pointer model: chunk partitioning, store routing, and
// terminated-stream history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// One horizontal partition of a stream, covering a contiguous
/// event-version range. `last_event_version` is -1 for an empty tail
/// chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub chunk_id: i32,
    pub first_event_version: i64,
    pub last_event_version: i64,
}

impl StreamChunk {
    pub fn initial() -> Self {
        Self {
            chunk_id: 0,
            first_event_version: 0,
            last_event_version: -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_event_version < self.first_event_version
    }

    pub fn contains(&self, version: i64) -> bool {
        version >= self.first_event_version
            && (self.last_event_version < 0 || version <= self.last_event_version)
    }
}

/// Named substrate stores a stream routes its concerns to.
/// `connection_name` is the deprecated single-store field: resolved as
/// a fallback on read, never written back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreRouting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_tag_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_tag_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
}

impl StoreRouting {
    fn resolve<'a>(&'a self, modern: &'a Option<String>, concern: &str) -> Option<&'a str> {
        if let Some(name) = modern.as_deref() {
            return Some(name);
        }
        if let Some(legacy) = self.connection_name.as_deref() {
            warn!(
                concern = concern,
                connection = legacy,
                "resolving store through the deprecated connection name"
            );
            return Some(legacy);
        }
        None
    }

    pub fn resolved_data_store(&self) -> Option<&str> {
        self.resolve(&self.data_store, "data")
    }

    pub fn resolved_document_store(&self) -> Option<&str> {
        self.resolve(&self.document_store, "document")
    }

    pub fn resolved_document_tag_store(&self) -> Option<&str> {
        self.resolve(&self.document_tag_store, "documentTag")
    }

    pub fn resolved_stream_tag_store(&self) -> Option<&str> {
        self.resolve(&self.stream_tag_store, "streamTag")
    }

    pub fn resolved_snapshot_store(&self) -> Option<&str> {
        self.resolve(&self.snapshot_store, "snapshot")
    }
}

/// Type names recorded on the stream for its related records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamTypeNames {
    pub stream: String,
    pub document: String,
    pub document_tag: String,
    pub event_stream_tag: String,
    pub document_ref: String,
}

impl Default for StreamTypeNames {
    fn default() -> Self {
        Self {
            stream: "eventStream".to_string(),
            document: "objectDocument".to_string(),
            document_tag: "documentTag".to_string(),
            event_stream_tag: "eventStreamTag".to_string(),
            document_ref: "documentRef".to_string(),
        }
    }
}

/// A closed stream recorded on the document, with the optional
/// continuation stream future appends should target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminatedStream {
    pub stream_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_stream_id: Option<String>,
    pub termination_timestamp: DateTime<Utc>,
    pub version: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// The active stream pointer for an object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamInformation {
    pub stream_id: String,
    pub current_version: i64,
    pub chunking_enabled: bool,
    pub chunk_size: i64,
    #[serde(default)]
    pub chunks: Vec<StreamChunk>,
    #[serde(default)]
    pub stores: StoreRouting,
    #[serde(default)]
    pub types: StreamTypeNames,
}

impl StreamInformation {
    /// Fresh stream for a new object: the stream id is the object id
    /// with dashes stripped plus the zero suffix.
    pub fn new_for_object(object_id: &str, chunking_enabled: bool, chunk_size: i64) -> Self {
        let stream_id = format!("{}-0000000000", object_id.replace('-', ""));
        let chunks = if chunking_enabled {
            vec![StreamChunk::initial()]
        } else {
            Vec::new()
        };
        Self {
            stream_id,
            current_version: -1,
            chunking_enabled,
            chunk_size,
            chunks,
            stores: StoreRouting::default(),
            types: StreamTypeNames::default(),
        }
    }

    /// The chunk currently accepting appends
    pub fn active_chunk(&self) -> Option<&StreamChunk> {
        self.chunks.last()
    }

    /// The chunk covering a given event version
    pub fn chunk_for_version(&self, version: i64) -> Option<&StreamChunk> {
        self.chunks.iter().find(|chunk| chunk.contains(version))
    }

    /// The chunk an append starting at `version` targets: the chunk
    /// covering that version, or the active chunk when none does.
    pub fn chunk_for_append(&self, version: i64) -> Option<&StreamChunk> {
        self.chunk_for_version(version).or_else(|| self.active_chunk())
    }

    /// Logical object name for the stream data on the blob substrate:
    /// `{streamId}` without chunking, `{streamId}-{chunkId:010}` with.
    pub fn data_path(&self) -> String {
        match (self.chunking_enabled, self.active_chunk()) {
            (true, Some(chunk)) => self.chunk_data_path(chunk.chunk_id),
            _ => self.stream_id.clone(),
        }
    }

    pub fn chunk_data_path(&self, chunk_id: i32) -> String {
        format!("{}-{:010}", self.stream_id, chunk_id)
    }

    /// Partition key for the stream data on the table substrate:
    /// `{streamId}` without chunking, `{streamId}_{chunkId:010}` with.
    pub fn partition_key(&self) -> String {
        match (self.chunking_enabled, self.active_chunk()) {
            (true, Some(chunk)) => self.chunk_partition_key(chunk.chunk_id),
            _ => self.stream_id.clone(),
        }
    }

    pub fn chunk_partition_key(&self, chunk_id: i32) -> String {
        format!("{}_{:010}", self.stream_id, chunk_id)
    }

    /// Validate the chunk list: sorted by id, gap-free over
    /// `[0, current_version]`, with the tail chunk ending at the
    /// current version.
    pub fn validate_chunks(&self) -> StoreResult<()> {
        if !self.chunking_enabled {
            return Ok(());
        }
        if self.chunks.is_empty() {
            return Err(StoreError::InvalidArgument {
                message: format!(
                    "stream {} has chunking enabled but no chunks",
                    self.stream_id
                ),
            });
        }

        let mut expected_first = 0i64;
        let mut previous_id: Option<i32> = None;
        let mut tail_version = -1i64;
        for chunk in &self.chunks {
            if let Some(previous) = previous_id {
                if chunk.chunk_id <= previous {
                    return Err(StoreError::InvalidArgument {
                        message: format!(
                            "stream {} chunks are not sorted: {} after {}",
                            self.stream_id, chunk.chunk_id, previous
                        ),
                    });
                }
            }
            if chunk.first_event_version != expected_first {
                return Err(StoreError::InvalidArgument {
                    message: format!(
                        "stream {} chunk {} starts at {} but {} was expected",
                        self.stream_id, chunk.chunk_id, chunk.first_event_version, expected_first
                    ),
                });
            }
            if chunk.is_empty() {
                tail_version = chunk.first_event_version - 1;
            } else {
                expected_first = chunk.last_event_version + 1;
                tail_version = chunk.last_event_version;
            }
            previous_id = Some(chunk.chunk_id);
        }

        if tail_version != self.current_version {
            return Err(StoreError::InvalidArgument {
                message: format!(
                    "stream {} tail chunk ends at {} but the stream is at version {}",
                    self.stream_id, tail_version, self.current_version
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stream_strips_dashes_and_appends_suffix() {
        let stream = StreamInformation::new_for_object("a1b2-c3d4", false, 0);
        assert_eq!(stream.stream_id, "a1b2c3d4-0000000000");
        assert_eq!(stream.current_version, -1);
        assert!(stream.chunks.is_empty());
    }

    #[test]
    fn chunked_stream_gets_initial_empty_chunk() {
        let stream = StreamInformation::new_for_object("abc", true, 1000);
        assert_eq!(stream.chunks, vec![StreamChunk::initial()]);
        assert!(stream.validate_chunks().is_ok());
    }

    #[test]
    fn data_path_includes_zero_padded_chunk_id() {
        let mut stream = StreamInformation::new_for_object("abc", true, 1000);
        stream.chunks = vec![StreamChunk {
            chunk_id: 7,
            first_event_version: 0,
            last_event_version: -1,
        }];
        assert_eq!(stream.data_path(), "abc-0000000000-0000000007");
        assert_eq!(stream.partition_key(), "abc-0000000000_0000000007");
    }

    #[test]
    fn validation_rejects_gaps() {
        let mut stream = StreamInformation::new_for_object("abc", true, 10);
        stream.current_version = 25;
        stream.chunks = vec![
            StreamChunk {
                chunk_id: 0,
                first_event_version: 0,
                last_event_version: 9,
            },
            StreamChunk {
                chunk_id: 1,
                first_event_version: 11,
                last_event_version: 25,
            },
        ];
        assert!(stream.validate_chunks().is_err());
    }

    #[test]
    fn validation_requires_tail_to_match_current_version() {
        let mut stream = StreamInformation::new_for_object("abc", true, 10);
        stream.current_version = 9;
        stream.chunks = vec![StreamChunk {
            chunk_id: 0,
            first_event_version: 0,
            last_event_version: 5,
        }];
        assert!(stream.validate_chunks().is_err());

        stream.chunks[0].last_event_version = 9;
        assert!(stream.validate_chunks().is_ok());
    }

    #[test]
    fn legacy_connection_name_is_a_fallback_only() {
        let routing = StoreRouting {
            data_store: Some("modern".to_string()),
            connection_name: Some("legacy".to_string()),
            ..Default::default()
        };
        assert_eq!(routing.resolved_data_store(), Some("modern"));
        assert_eq!(routing.resolved_snapshot_store(), Some("legacy"));
    }
}
