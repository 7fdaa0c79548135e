// File: src/lib.rs
//
// Storage engine for event-sourced aggregates on blob and wide-column
// substrates:
// - Event stream data plane with optimistic concurrency and chunking
// - Object document control plane with a hash-chained descriptor
// - Snapshot stores and tag secondary indexes
// - Object-id pagination
// - Projection checkpoints with historical retention
// - Projection rebuild coordination with expiring leases
// - Storage tiering and stream metrics

pub mod checkpoint;
pub mod containers;
pub mod data;
pub mod document;
pub mod pager;
pub mod projection_status;
pub mod snapshot;
pub mod stream;
pub mod tags;
pub mod tiering;

mod cancel;

pub use checkpoint::{CheckpointPointer, LoadedCheckpoint, TableCheckpointStore};
pub use containers::{ensure_blob_container, ensure_table};
pub use data::{BlobDataStore, DataStore, EventReadStream, TableDataStore};
pub use document::{BlobDocumentStore, DocumentStore, TableDocumentStore};
pub use pager::{BlobObjectIdPager, ObjectIdPage, ObjectIdPager, TableObjectIdPager};
pub use projection_status::{ProjectionStatusCoordinator, REBUILD_TIMED_OUT};
pub use snapshot::{BlobSnapshotStore, SnapshotStore, TableSnapshotStore};
pub use stream::EventStream;
pub use tags::{BlobTagStore, DocumentTagStore, StreamTagStore, TableTagStore};
pub use tiering::{BlobTierProvider, StreamMetrics, StreamMetricsProvider};
