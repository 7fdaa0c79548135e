// File: src/containers.rs
//
// Process-wide verified-container set. Once a container or table has
// been ensured it is never re-checked for the life of the process;
// membership is additive only and an entry is added only after the
// create call succeeded.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use event_stream_core::error::{StoreError, StoreResult};
use event_stream_core::substrate::{KvBlob, WideTable};

static VERIFIED_CONTAINERS: Lazy<RwLock<HashSet<String>>> =
    Lazy::new(|| RwLock::new(HashSet::new()));

fn is_verified(name: &str) -> bool {
    VERIFIED_CONTAINERS
        .read()
        .expect("verified-container set lock poisoned")
        .contains(&name.to_lowercase())
}

fn mark_verified(name: &str) {
    VERIFIED_CONTAINERS
        .write()
        .expect("verified-container set lock poisoned")
        .insert(name.to_lowercase());
}

/// Ensure a blob container exists when auto-create is enabled.
/// With auto-create off this is a no-op: a missing container surfaces
/// from the operation itself as `ContainerNotFound`.
pub async fn ensure_blob_container(
    blob: &dyn KvBlob,
    container: &str,
    auto_create: bool,
    ctx: &CancellationToken,
) -> StoreResult<()> {
    if !auto_create || is_verified(container) {
        return Ok(());
    }
    blob.create_container_if_not_exists(container, ctx)
        .await
        .map_err(|e| StoreError::from_substrate(e, container))?;
    debug!(container = container, "verified blob container");
    mark_verified(container);
    Ok(())
}

/// Ensure a table exists when auto-create is enabled
pub async fn ensure_table(
    table: &dyn WideTable,
    name: &str,
    auto_create: bool,
    ctx: &CancellationToken,
) -> StoreResult<()> {
    if !auto_create || is_verified(name) {
        return Ok(());
    }
    table
        .create_table_if_not_exists(name, ctx)
        .await
        .map_err(|e| StoreError::from_substrate(e, name))?;
    debug!(table = name, "verified table");
    mark_verified(name);
    Ok(())
}

/// Clear the verified set. Tests only; production code never resets.
#[doc(hidden)]
pub fn reset_verified_containers() {
    VERIFIED_CONTAINERS
        .write()
        .expect("verified-container set lock poisoned")
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_stream_core::substrate::InMemoryBlobStore;
    use serial_test::serial;

    #[tokio::test]
    #[serial]
    async fn verification_is_case_insensitive_and_sticky() {
        reset_verified_containers();
        let blob = InMemoryBlobStore::new();
        let ctx = CancellationToken::new();

        ensure_blob_container(&blob, "Events", true, &ctx)
            .await
            .unwrap();
        assert!(is_verified("events"));
        assert!(is_verified("EVENTS"));

        // Second call short-circuits on the set.
        ensure_blob_container(&blob, "events", true, &ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn auto_create_off_never_touches_the_set() {
        reset_verified_containers();
        let blob = InMemoryBlobStore::new();
        let ctx = CancellationToken::new();

        ensure_blob_container(&blob, "events", false, &ctx)
            .await
            .unwrap();
        assert!(!is_verified("events"));
    }
}
