// File: src/model/mod.rs
//
// Data model for the event-stream storage engine: events, stream
// pointers, object documents, snapshots, and projection records.

pub mod document;
pub mod event;
pub mod projection;
pub mod snapshot;
pub mod stream;

pub use document::{ObjectDocument, DOCUMENT_SCHEMA_VERSION, UNCOMMITTED_HASH};
pub use event::{Event, DEFAULT_EVENT_SCHEMA_VERSION, EVENT_STREAM_CLOSED};
pub use projection::{
    CheckpointFingerprint, ProjectionStatus, ProjectionStatusInfo, RebuildInfo, RebuildStrategy,
    RebuildToken,
};
pub use snapshot::Snapshot;
pub use stream::{
    StoreRouting, StreamChunk, StreamInformation, StreamTypeNames, TerminatedStream,
};
