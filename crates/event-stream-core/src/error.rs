// File: src/error.rs
//
// Error taxonomy for the event-stream storage engine.
// Two layers: the normalized substrate error domain reported by the
// KvBlob/WideTable capabilities, and the caller-facing store errors.

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// The kind of entity a substrate reported missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Container,
    Table,
    Blob,
    Row,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotFoundKind::Container => write!(f, "container"),
            NotFoundKind::Table => write!(f, "table"),
            NotFoundKind::Blob => write!(f, "blob"),
            NotFoundKind::Row => write!(f, "row"),
        }
    }
}

/// Normalized error domain of the substrate capabilities.
///
/// Vendor SDK conditions are mapped onto these five kinds before they
/// reach the stores; the stores translate them into [`StoreError`]s
/// with the context they hold (container names, stream ids).
#[derive(Debug, Error, Clone)]
pub enum SubstrateError {
    #[error("{kind} not found")]
    NotFound { kind: NotFoundKind },

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("conflict")]
    Conflict,

    #[error("transient substrate failure: {message}")]
    Transient { message: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
}

impl SubstrateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SubstrateError::NotFound { .. })
    }

    pub fn not_found_kind(&self) -> Option<NotFoundKind> {
        match self {
            SubstrateError::NotFound { kind } => Some(*kind),
            _ => None,
        }
    }
}

/// Error types surfaced by the stores
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("container not found: {container}")]
    ContainerNotFound { container: String },

    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("document not found: {object_name}/{object_id}")]
    DocumentNotFound {
        object_name: String,
        object_id: String,
    },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("concurrency conflict: {message}")]
    ConcurrencyConflict { message: String },

    #[error("stream is closed: {stream_id}")]
    StreamClosed { stream_id: String },

    #[error("corrupt payload: {message}")]
    CorruptPayload { message: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("invalid rebuild token: {message}")]
    InvalidToken { message: String },

    #[error("rebuild token expired: {message}")]
    TokenExpired { message: String },

    #[error("transient failure: {message}")]
    Transient { message: String },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },
}

impl StoreError {
    /// Map a substrate error into the store taxonomy, supplying the
    /// namespace name for the container/table kinds.
    pub fn from_substrate(error: SubstrateError, namespace: &str) -> Self {
        match error {
            SubstrateError::NotFound {
                kind: NotFoundKind::Container,
            } => StoreError::ContainerNotFound {
                container: namespace.to_string(),
            },
            SubstrateError::NotFound {
                kind: NotFoundKind::Table,
            } => StoreError::TableNotFound {
                table: namespace.to_string(),
            },
            SubstrateError::NotFound { kind } => StoreError::NotFound {
                message: format!("{} not found in {}", kind, namespace),
            },
            SubstrateError::PreconditionFailed => StoreError::ConcurrencyConflict {
                message: format!("precondition failed in {}", namespace),
            },
            SubstrateError::Conflict => StoreError::ConcurrencyConflict {
                message: format!("write conflict in {}", namespace),
            },
            SubstrateError::Transient { message } => StoreError::Transient { message },
            SubstrateError::Unauthorized { message } => StoreError::Transient {
                message: format!("unauthorized: {}", message),
            },
        }
    }

    /// Whether the caller can retry after reloading the document
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::ConcurrencyConflict { .. } | StoreError::Transient { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::SerializationError {
            message: error.to_string(),
        }
    }
}
