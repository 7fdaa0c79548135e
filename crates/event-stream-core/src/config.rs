// File: src/config.rs
//
// Storage engine configuration.
// Settings cover the payload codec, container/table naming, and the
// deploy-time auto-create behaviour. Values load from the environment
// with sensible defaults for local development.

use serde::{Deserialize, Serialize};

use crate::codec::{DEFAULT_PAYLOAD_CHUNK_THRESHOLD_BYTES, MAX_PAYLOAD_CHUNK_SIZE_BYTES};
use crate::error::{StoreError, StoreResult};

/// Configuration for the storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Container holding event stream blobs
    pub data_container: String,

    /// Container holding object documents and tag indexes
    pub document_container: String,

    /// Table holding event rows on the wide-column substrate
    pub data_table: String,

    /// Table holding object document rows
    pub document_table: String,

    /// Table holding snapshot rows
    pub snapshot_table: String,

    /// Table holding projection checkpoints and status records
    pub projection_table: String,

    /// Whether missing containers/tables are created on first use.
    /// Deploy-time option; hot paths never auto-create.
    pub auto_create_containers: bool,

    /// Whether large payloads are split across rows
    pub payload_chunking_enabled: bool,

    /// Whether large payloads are gzip-compressed before storage
    pub payload_compression_enabled: bool,

    /// Payload size above which the codec kicks in
    pub payload_chunk_threshold_bytes: usize,

    /// Default page size for enumeration APIs
    pub default_page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_container: "event-streams".to_string(),
            document_container: "object-documents".to_string(),
            data_table: "eventstreams".to_string(),
            document_table: "objectdocuments".to_string(),
            snapshot_table: "snapshots".to_string(),
            projection_table: "projections".to_string(),
            auto_create_containers: false,
            payload_chunking_enabled: true,
            payload_compression_enabled: true,
            payload_chunk_threshold_bytes: DEFAULT_PAYLOAD_CHUNK_THRESHOLD_BYTES,
            default_page_size: 100,
        }
    }
}

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the environment, falling back to
    /// defaults for unset variables. Reads a `.env` file when present.
    pub fn from_env() -> StoreResult<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(value) = std::env::var("EVENT_STORE_DATA_CONTAINER") {
            config.data_container = value;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_DOCUMENT_CONTAINER") {
            config.document_container = value;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_DATA_TABLE") {
            config.data_table = value;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_DOCUMENT_TABLE") {
            config.document_table = value;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_SNAPSHOT_TABLE") {
            config.snapshot_table = value;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_PROJECTION_TABLE") {
            config.projection_table = value;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_AUTO_CREATE") {
            config.auto_create_containers = parse_bool("EVENT_STORE_AUTO_CREATE", &value)?;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_PAYLOAD_CHUNKING") {
            config.payload_chunking_enabled = parse_bool("EVENT_STORE_PAYLOAD_CHUNKING", &value)?;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_PAYLOAD_COMPRESSION") {
            config.payload_compression_enabled =
                parse_bool("EVENT_STORE_PAYLOAD_COMPRESSION", &value)?;
        }
        if let Ok(value) = std::env::var("EVENT_STORE_PAYLOAD_THRESHOLD_BYTES") {
            config.payload_chunk_threshold_bytes =
                value
                    .parse()
                    .map_err(|_| StoreError::ConfigurationError {
                        message: format!(
                            "EVENT_STORE_PAYLOAD_THRESHOLD_BYTES is not a number: {}",
                            value
                        ),
                    })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.payload_chunk_threshold_bytes > MAX_PAYLOAD_CHUNK_SIZE_BYTES {
            return Err(StoreError::ConfigurationError {
                message: format!(
                    "payload threshold {} exceeds the row chunk limit of {} bytes",
                    self.payload_chunk_threshold_bytes, MAX_PAYLOAD_CHUNK_SIZE_BYTES
                ),
            });
        }
        if self.default_page_size == 0 {
            return Err(StoreError::ConfigurationError {
                message: "default page size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create_containers = auto_create;
        self
    }

    pub fn with_data_container(mut self, container: impl Into<String>) -> Self {
        self.data_container = container.into();
        self
    }

    pub fn with_payload_threshold(mut self, bytes: usize) -> Self {
        self.payload_chunk_threshold_bytes = bytes;
        self
    }
}

fn parse_bool(name: &str, value: &str) -> StoreResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StoreError::ConfigurationError {
            message: format!("{} is not a boolean: {}", name, value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.auto_create_containers);
        assert_eq!(
            config.payload_chunk_threshold_bytes,
            DEFAULT_PAYLOAD_CHUNK_THRESHOLD_BYTES
        );
    }

    #[test]
    fn oversized_threshold_is_rejected() {
        let config = StorageConfig::default().with_payload_threshold(MAX_PAYLOAD_CHUNK_SIZE_BYTES * 2);
        assert!(matches!(
            config.validate(),
            Err(StoreError::ConfigurationError { .. })
        ));
    }

    #[test]
    fn parse_bool_accepts_common_forms() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "ON").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
