// File: src/model/document.rs
//
// The per-object descriptor: active stream pointer, terminated-stream
// history, and the hash chain that detects lost document updates.

use serde::{Deserialize, Serialize};

use crate::canonical::hash_value;
use crate::error::{StoreError, StoreResult};
use crate::model::stream::{StreamInformation, TerminatedStream};

/// Schema version stamped on newly created documents
pub const DOCUMENT_SCHEMA_VERSION: &str = "1.0.0";

/// Placeholder hash for a document that has never been committed
pub const UNCOMMITTED_HASH: &str = "*";

/// Materialized object document.
///
/// Exclusively owned by the document store and mutated only through
/// its CAS update path. `hash` digests the canonical serialization;
/// `prev_hash` links to the prior committed version. The runtime-only
/// fields (`document_path`, `etag`, `loaded_hash`) are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDocument {
    pub object_id: String,
    pub object_name: String,
    pub active: StreamInformation,
    #[serde(default)]
    pub terminated_streams: Vec<TerminatedStream>,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,

    /// Where this document was materialized from; runtime annotation
    #[serde(skip)]
    pub document_path: Option<String>,

    /// Substrate version tag from the load, used for the CAS write
    #[serde(skip)]
    pub etag: Option<String>,

    /// The hash the document carried when it was loaded; the next
    /// `set` writes it as `prev_hash`
    #[serde(skip)]
    pub loaded_hash: Option<String>,
}

impl ObjectDocument {
    /// Freshly initialized document for an object that has no
    /// persisted descriptor yet.
    pub fn new(
        object_name: impl Into<String>,
        object_id: impl Into<String>,
        chunking_enabled: bool,
        chunk_size: i64,
    ) -> Self {
        let object_id = object_id.into();
        Self {
            object_name: object_name.into(),
            active: StreamInformation::new_for_object(&object_id, chunking_enabled, chunk_size),
            object_id,
            terminated_streams: Vec::new(),
            schema_version: DOCUMENT_SCHEMA_VERSION.to_string(),
            hash: None,
            prev_hash: None,
            document_path: None,
            etag: None,
            loaded_hash: None,
        }
    }

    /// The document hash as written into event containers: `*` until
    /// the document has been committed at least once.
    pub fn hash_or_star(&self) -> String {
        self.hash
            .clone()
            .unwrap_or_else(|| UNCOMMITTED_HASH.to_string())
    }

    /// Digest of the canonical serialization with the `hash` field
    /// cleared, so the stored hash never feeds into itself.
    pub fn compute_hash(&self) -> StoreResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("hash");
        }
        Ok(hash_value(&value))
    }

    /// Invariants enforced before every persist
    pub fn validate_for_set(&self) -> StoreResult<()> {
        if self.object_id.is_empty() {
            return Err(StoreError::InvalidArgument {
                message: "document has no object id".to_string(),
            });
        }
        if self.active.stream_id.is_empty() {
            return Err(StoreError::InvalidArgument {
                message: format!("document {} has no active stream id", self.object_id),
            });
        }
        if self.active.current_version < -1 {
            return Err(StoreError::InvalidArgument {
                message: format!(
                    "document {} has invalid stream version {}",
                    self.object_id, self.active.current_version
                ),
            });
        }
        self.active.validate_chunks()
    }

    /// Stream id a continuation stream should use: the active stream's
    /// ten-digit suffix incremented by one.
    pub fn next_stream_id(&self) -> StoreResult<String> {
        let stream_id = &self.active.stream_id;
        let (base, suffix) = stream_id
            .rsplit_once('-')
            .ok_or_else(|| StoreError::InvalidArgument {
                message: format!("stream id {} has no numeric suffix", stream_id),
            })?;
        let sequence: u64 = suffix.parse().map_err(|_| StoreError::InvalidArgument {
            message: format!("stream id {} has a non-numeric suffix", stream_id),
        })?;
        Ok(format!("{}-{:010}", base, sequence + 1))
    }
}
