// File: src/cancel.rs
//
// Cooperative cancellation guard, checked between substrate round-trips.

use tokio_util::sync::CancellationToken;

use event_stream_core::error::{StoreError, StoreResult};

pub(crate) fn guard(ctx: &CancellationToken, operation: &str) -> StoreResult<()> {
    if ctx.is_cancelled() {
        Err(StoreError::Cancelled {
            operation: operation.to_string(),
        })
    } else {
        Ok(())
    }
}
