// File: src/lib.rs
//
// Core of the event-stream storage engine:
// - Data model (events, stream pointers, object documents, snapshots,
//   projection records)
// - Error taxonomy (substrate and store layers)
// - Substrate capabilities (KvBlob, WideTable) with in-memory
//   implementations
// - Large-payload codec and wire serialization
// - Canonical-JSON hashing and configuration

pub mod canonical;
pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod serializer;
pub mod substrate;

pub use codec::{PayloadCodec, PayloadEncoding, MAX_PAYLOAD_CHUNK_SIZE_BYTES};
pub use config::StorageConfig;
pub use error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
pub use model::{
    CheckpointFingerprint, Event, ObjectDocument, ProjectionStatus, ProjectionStatusInfo,
    RebuildInfo, RebuildStrategy, RebuildToken, Snapshot, StoreRouting, StreamChunk,
    StreamInformation, StreamTypeNames, TerminatedStream, EVENT_STREAM_CLOSED,
};
pub use serializer::EventStreamRecord;
pub use substrate::{
    BatchOp, BlobContent, BlobProperties, BlobTier, InMemoryBlobStore, InMemoryTableStore, KvBlob,
    ListPage, Precondition, QueryPage, RehydratePriority, RowQuery, RowValue, SubstrateResult,
    TableRow, UpsertMode, WideTable, MAX_BATCH_OPERATIONS,
};
