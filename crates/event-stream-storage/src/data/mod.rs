// File: src/data/mod.rs
//
// Event stream data plane: append-only per-stream logs with optimistic
// concurrency, ordered range reads, streaming reads, and failed-commit
// compensation. One implementation per substrate; the semantics are
// shared.

pub mod blob;
pub mod table;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use event_stream_core::error::{StoreError, StoreResult};
use event_stream_core::model::{Event, ObjectDocument};

pub use blob::BlobDataStore;
pub use table::TableDataStore;

/// A lazily evaluated, single-pass sequence of events
pub type EventReadStream = BoxStream<'static, StoreResult<Event>>;

/// Append/read contract for event stream data
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Append events to the document's active stream.
    ///
    /// The caller assigns `event_version`s starting from
    /// `document.active.current_version + 1`. Timestamps are stamped
    /// with now unless `preserve_timestamps` is set (migrations).
    async fn append(
        &self,
        document: &ObjectDocument,
        preserve_timestamps: bool,
        events: Vec<Event>,
        ctx: &CancellationToken,
    ) -> StoreResult<()>;

    /// Read events in `[start_version, until_version]` inclusive from
    /// the active chunk, or from an explicit chunk when given.
    /// `None` when the stream data is absent.
    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        chunk: Option<i32>,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<Vec<Event>>>;

    /// Lazy streaming read; stops yielding promptly on cancellation
    fn read_stream(
        &self,
        document: &ObjectDocument,
        start_version: i64,
        until_version: Option<i64>,
        ctx: CancellationToken,
    ) -> EventReadStream;

    /// Delete `[from_version, to_version]` from the active chunk after
    /// a partial append failed downstream. Idempotent; returns the
    /// number of events removed.
    async fn remove_events_for_failed_commit(
        &self,
        document: &ObjectDocument,
        from_version: i64,
        to_version: i64,
        ctx: &CancellationToken,
    ) -> StoreResult<usize>;
}

/// Preconditions shared by every append implementation
pub(crate) fn validate_append(document: &ObjectDocument, events: &[Event]) -> StoreResult<()> {
    if events.is_empty() {
        return Err(StoreError::InvalidArgument {
            message: "append requires at least one event".to_string(),
        });
    }
    if document.active.stream_id.is_empty() {
        return Err(StoreError::InvalidArgument {
            message: format!("document {} has no active stream id", document.object_id),
        });
    }
    Ok(())
}

/// Stamp event timestamps with now unless the caller preserves them
pub(crate) fn stamp_timestamps(events: &mut [Event], preserve_timestamps: bool) {
    if preserve_timestamps {
        return;
    }
    let now = Utc::now();
    for event in events {
        event.timestamp = now;
    }
}

/// Inclusive version-range filter applied by readers
pub(crate) fn in_range(version: i64, start_version: i64, until_version: Option<i64>) -> bool {
    version >= start_version && until_version.map_or(true, |until| version <= until)
}
