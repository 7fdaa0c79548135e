// File: tests/integration_tests.rs
//
// End-to-end scenarios across the stores, running against the
// in-memory substrates: append bootstrap, optimistic conflicts, stream
// closure, large payloads, rebuild leasing, and stuck-rebuild
// recovery.

use std::sync::Arc;

use chrono::Duration;
use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use event_stream_core::error::StoreError;
use event_stream_core::model::{Event, ObjectDocument, ProjectionStatus, RebuildStrategy};
use event_stream_core::substrate::{
    InMemoryBlobStore, InMemoryTableStore, KvBlob, Precondition, WideTable,
};
use event_stream_storage::{
    BlobDataStore, BlobDocumentStore, BlobSnapshotStore, BlobTagStore, DataStore, DocumentStore,
    DocumentTagStore, EventStream, ProjectionStatusCoordinator, TableCheckpointStore,
    TableDataStore, REBUILD_TIMED_OUT,
};

fn ctx() -> CancellationToken {
    CancellationToken::new()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct BlobFixture {
    blob: Arc<InMemoryBlobStore>,
    documents: Arc<BlobDocumentStore>,
    data: Arc<BlobDataStore>,
    tags: Arc<BlobTagStore>,
    stream: EventStream,
}

async fn blob_fixture() -> BlobFixture {
    init_tracing();
    let blob = Arc::new(InMemoryBlobStore::new());
    for container in ["documents", "items", "snapshots"] {
        blob.create_container_if_not_exists(container, &ctx())
            .await
            .unwrap();
    }
    let tags = Arc::new(BlobTagStore::new(blob.clone(), "documents", false));
    let documents = Arc::new(BlobDocumentStore::new(
        blob.clone(),
        "documents",
        tags.clone(),
    ));
    let data = Arc::new(BlobDataStore::new(blob.clone(), "items"));
    let snapshots = Arc::new(BlobSnapshotStore::new(blob.clone(), "snapshots"));
    let stream = EventStream::new(documents.clone(), data.clone(), snapshots);
    BlobFixture {
        blob,
        documents,
        data,
        tags,
        stream,
    }
}

// Scenario: first append on a fresh document bootstraps the container
// blob with the uncommitted hash marker.
#[tokio::test]
async fn blob_append_bootstrap_writes_expected_layout() {
    let fixture = blob_fixture().await;
    let document = ObjectDocument::new("Item", "A", false, 0);
    assert_eq!(document.active.stream_id, "A-0000000000");
    assert_eq!(document.active.current_version, -1);
    assert!(document.hash.is_none());

    fixture
        .data
        .append(
            &document,
            false,
            vec![Event::new(0, "Created", json!({"x": 1}))],
            &ctx(),
        )
        .await
        .unwrap();

    let content = fixture
        .blob
        .read("items", "a-0000000000.json", &Precondition::None, &ctx())
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&content.data).unwrap();
    assert_eq!(value["objectId"], "A");
    assert_eq!(value["objectName"], "Item");
    assert_eq!(value["lastObjectDocumentHash"], "*");
    assert_eq!(value["events"].as_array().unwrap().len(), 1);
    assert_eq!(value["events"][0]["eventVersion"], 0);
    assert_eq!(value["events"][0]["eventType"], "Created");
}

// Scenario: of two writers holding the same document, exactly one
// commits; the loser conflicts and its events are never observable.
#[tokio::test]
async fn optimistic_conflict_loser_writes_nothing() {
    let fixture = blob_fixture().await;
    fixture.documents.create("Item", "A", &ctx()).await.unwrap();

    let mut winner = fixture.documents.get("Item", "A", &ctx()).await.unwrap();
    let mut loser = fixture.documents.get("Item", "A", &ctx()).await.unwrap();

    fixture
        .stream
        .append(
            &mut winner,
            false,
            vec![Event::new(0, "Won", json!({"who": "winner"}))],
            &ctx(),
        )
        .await
        .unwrap();

    let error = fixture
        .stream
        .append(
            &mut loser,
            false,
            vec![Event::new(0, "Lost", json!({"who": "loser"}))],
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::ConcurrencyConflict { .. }));

    // The tail shows only the winner's events.
    let events = fixture
        .stream
        .read(&winner, 0, None, &ctx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "Won");

    // The loser retries after reloading.
    let mut reloaded = fixture.documents.get("Item", "A", &ctx()).await.unwrap();
    fixture
        .stream
        .append(
            &mut reloaded,
            false,
            vec![Event::new(1, "Retried", json!({}))],
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(reloaded.active.current_version, 1);
}

// Scenario: once the closure marker is the tail, every further append
// is rejected without writing.
#[tokio::test]
async fn closed_stream_is_terminal() {
    let fixture = blob_fixture().await;
    let document = ObjectDocument::new("Item", "A", false, 0);
    fixture
        .data
        .append(
            &document,
            false,
            vec![
                Event::new(0, "Created", json!({})),
                Event::stream_closed(1, "retired"),
            ],
            &ctx(),
        )
        .await
        .unwrap();

    let error = fixture
        .data
        .append(
            &document,
            false,
            vec![Event::new(2, "TooLate", json!({}))],
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::StreamClosed { .. }));

    let events = fixture
        .data
        .read(&document, 0, None, None, &ctx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(events.len(), 2);
}

// Closure through the facade records the continuation, and appends
// continue on the new stream.
#[tokio::test]
async fn closed_stream_continues_on_the_continuation_stream() {
    let fixture = blob_fixture().await;
    let mut document = fixture.documents.create("Item", "A", &ctx()).await.unwrap();
    fixture
        .stream
        .append(
            &mut document,
            false,
            vec![Event::new(0, "Created", json!({}))],
            &ctx(),
        )
        .await
        .unwrap();

    let continuation = fixture
        .stream
        .close(&mut document, "schema migration", &ctx())
        .await
        .unwrap();

    let reloaded = fixture.documents.get("Item", "A", &ctx()).await.unwrap();
    assert_eq!(reloaded.active.stream_id, continuation);
    assert_eq!(reloaded.terminated_streams.len(), 1);
    assert_eq!(
        reloaded.terminated_streams[0]
            .continuation_stream_id
            .as_deref(),
        Some(continuation.as_str())
    );

    let mut document = reloaded;
    fixture
        .stream
        .append(
            &mut document,
            false,
            vec![Event::new(0, "MigratedIn", json!({}))],
            &ctx(),
        )
        .await
        .unwrap();
}

// Scenario: a 200 KiB payload spreads over continuation rows on the
// table substrate, reads back byte-for-byte, and the compensating
// delete removes every row.
#[tokio::test]
async fn large_payload_chunked_round_trip_on_table() {
    let table = Arc::new(InMemoryTableStore::new());
    table
        .create_table_if_not_exists("events", &ctx())
        .await
        .unwrap();
    let codec = event_stream_core::PayloadCodec {
        compression_enabled: false,
        ..Default::default()
    };
    let store = TableDataStore::new(table.clone(), "events").with_codec(codec);
    let document = ObjectDocument::new("Item", "A", false, 0);

    let blob: String = (0..200 * 1024)
        .map(|i| char::from(b'a' + ((i * 37 + i / 101) % 26) as u8))
        .collect();
    let payload = json!({ "blob": blob });
    store
        .append(
            &document,
            false,
            vec![Event::new(0, "Big", payload.clone())],
            &ctx(),
        )
        .await
        .unwrap();

    // Continuation rows exist alongside the primary.
    let partition = document.active.partition_key();
    for index in 1..4 {
        let row_key = format!("00000000000000000000_p{}", index);
        assert!(
            table.get("events", &partition, &row_key, &ctx()).await.is_ok(),
            "continuation row {} should exist",
            index
        );
    }

    let events = store
        .read(&document, 0, None, None, &ctx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload, payload);

    let removed = store
        .remove_events_for_failed_commit(&document, 0, 0, &ctx())
        .await
        .unwrap();
    assert_eq!(removed, 1);
    for index in 1..4 {
        let row_key = format!("00000000000000000000_p{}", index);
        assert!(table.get("events", &partition, &row_key, &ctx()).await.is_err());
    }
    assert!(store.read(&document, 0, None, None, &ctx()).await.unwrap().is_none());
}

// Scenario: the rebuild lease walks the full state machine, foreign
// tokens are rejected mid-flight, and completion releases the lease.
#[tokio::test]
async fn rebuild_lease_happy_path() {
    let table = Arc::new(InMemoryTableStore::new());
    table
        .create_table_if_not_exists("projectionstatus", &ctx())
        .await
        .unwrap();
    let coordinator = ProjectionStatusCoordinator::new(table, "projectionstatus");

    let token = coordinator
        .start_rebuild("P", "A", RebuildStrategy::Full, Duration::seconds(5), &ctx())
        .await
        .unwrap();
    coordinator.start_catch_up(&token, &ctx()).await.unwrap();

    let mut foreign = token.clone();
    foreign.token = "not-the-lease".to_string();
    let error = coordinator.mark_ready(&foreign, &ctx()).await.unwrap_err();
    assert!(matches!(error, StoreError::InvalidToken { .. }));

    coordinator.mark_ready(&token, &ctx()).await.unwrap();
    coordinator.complete_rebuild(&token, &ctx()).await.unwrap();

    let record = coordinator
        .get_status("P", "A", &ctx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProjectionStatus::Active);
    assert!(record.active_token.is_none());
}

// Scenario: an expired lease is promoted to Failed exactly once.
#[tokio::test]
async fn stuck_rebuild_recovery_is_idempotent() {
    let table = Arc::new(InMemoryTableStore::new());
    table
        .create_table_if_not_exists("projectionstatus", &ctx())
        .await
        .unwrap();
    let coordinator = ProjectionStatusCoordinator::new(table, "projectionstatus");

    coordinator
        .start_rebuild(
            "P",
            "A",
            RebuildStrategy::Full,
            Duration::milliseconds(1),
            &ctx(),
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    assert_eq!(coordinator.recover_stuck_rebuilds(&ctx()).await.unwrap(), 1);
    let record = coordinator
        .get_status("P", "A", &ctx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProjectionStatus::Failed);
    assert_eq!(
        record.rebuild_info.unwrap().error.as_deref(),
        Some(REBUILD_TIMED_OUT)
    );
    assert_eq!(coordinator.recover_stuck_rebuilds(&ctx()).await.unwrap(), 0);
}

// Property: reads return exactly the committed versions in the range,
// strictly increasing.
#[tokio::test]
async fn reads_return_exact_version_ranges() {
    let fixture = blob_fixture().await;
    let mut document = fixture.documents.create("Item", "A", &ctx()).await.unwrap();

    for batch in 0..4i64 {
        let events: Vec<Event> = (0..3)
            .map(|i| {
                let version = batch * 3 + i;
                Event::new(version, "E", json!({ "v": version }))
            })
            .collect();
        fixture
            .stream
            .append(&mut document, false, events, &ctx())
            .await
            .unwrap();
    }
    // Four appends of three events from version 0.
    assert_eq!(document.active.current_version, 11);

    let events = fixture
        .stream
        .read(&document, 3, Some(8), &ctx())
        .await
        .unwrap()
        .unwrap();
    let versions: Vec<i64> = events.iter().map(|e| e.event_version).collect();
    assert_eq!(versions, vec![3, 4, 5, 6, 7, 8]);
    assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));

    // The streaming read yields the same sequence.
    let collected: Vec<i64> = fixture
        .stream
        .read_stream(&document, 3, Some(8), ctx())
        .map(|event| event.unwrap().event_version)
        .collect()
        .await;
    assert_eq!(collected, versions);
}

// Property: after tagging a document, the tag index resolves it.
#[tokio::test]
async fn tag_index_resolves_documents() {
    let fixture = blob_fixture().await;
    fixture.documents.create("Item", "A", &ctx()).await.unwrap();

    fixture
        .tags
        .set("Item", "A", "color:red", &ctx())
        .await
        .unwrap();

    let documents = fixture
        .documents
        .get_by_tag("Item", "color:red", &ctx())
        .await
        .unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].object_id, "A");

    let first = fixture
        .documents
        .get_first_by_tag("Item", "color:red", &ctx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.object_id, "A");

    assert!(fixture
        .documents
        .get_first_by_tag("Item", "color:blue", &ctx())
        .await
        .unwrap()
        .is_none());
}

// Checkpoints round-trip through compression and chunking, and the
// document hash chain stays intact across the full flow.
#[tokio::test]
async fn checkpoint_and_document_chain_end_to_end() {
    let table = Arc::new(InMemoryTableStore::new());
    table
        .create_table_if_not_exists("checkpoints", &ctx())
        .await
        .unwrap();
    let checkpoints = TableCheckpointStore::new(table, "checkpoints");

    let state = json!({"position": 12, "totals": {"a": 3, "b": 9}});
    let fingerprint = checkpoints.save("P", &state, "live", &ctx()).await.unwrap();
    let loaded = checkpoints.load("P", &ctx()).await.unwrap().unwrap();
    assert_eq!(loaded.state, state);
    assert_eq!(loaded.pointer.unwrap().fingerprint, fingerprint);

    let fixture = blob_fixture().await;
    let mut document = fixture.documents.create("Item", "A", &ctx()).await.unwrap();
    for version in 0..3i64 {
        fixture
            .stream
            .append(
                &mut document,
                false,
                vec![Event::new(version, "E", json!({ "v": version }))],
                &ctx(),
            )
            .await
            .unwrap();
    }
    let reloaded = fixture.documents.get("Item", "A", &ctx()).await.unwrap();
    assert_eq!(reloaded.active.current_version, 2);
    assert!(reloaded.hash.is_some());
    assert!(reloaded.prev_hash.is_some());
    assert_ne!(reloaded.hash, reloaded.prev_hash);
}

// Snapshots taken through the facade are addressable and survive
// further appends.
#[tokio::test]
async fn snapshot_flow_through_the_facade() {
    let fixture = blob_fixture().await;
    let mut document = fixture.documents.create("Item", "A", &ctx()).await.unwrap();
    let events: Vec<Event> = (0..5).map(|v| Event::new(v, "E", json!({"v": v}))).collect();
    fixture
        .stream
        .append(&mut document, false, events, &ctx())
        .await
        .unwrap();

    fixture
        .stream
        .snapshot(&document, json!({"sum": 10}), None, &ctx())
        .await
        .unwrap();

    let more: Vec<Event> = (5..8).map(|v| Event::new(v, "E", json!({"v": v}))).collect();
    fixture
        .stream
        .append(&mut document, false, more, &ctx())
        .await
        .unwrap();

    let (snapshot, suffix) = fixture
        .stream
        .read_from_snapshot(&document, None, &ctx())
        .await
        .unwrap();
    assert_eq!(snapshot.unwrap().version, 4);
    let versions: Vec<i64> = suffix.iter().map(|e| e.event_version).collect();
    assert_eq!(versions, vec![5, 6, 7]);
}

// A cancelled token stops operations before substrate round-trips.
#[tokio::test]
async fn cancellation_is_observed() {
    let fixture = blob_fixture().await;
    let document = ObjectDocument::new("Item", "A", false, 0);

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let error = fixture
        .data
        .append(
            &document,
            false,
            vec![Event::new(0, "E", json!({}))],
            &cancelled,
        )
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::Cancelled { .. }));

    let error = fixture
        .data
        .read(&document, 0, None, None, &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(error, StoreError::Cancelled { .. }));
}
