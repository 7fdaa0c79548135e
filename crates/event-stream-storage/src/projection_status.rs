// File: src/projection_status.rs
//
// Projection rebuild coordination: a per-(projection, object) status
// record driven through a state machine, guarded by expiring lease
// tokens and etag-conditional writes, with a scanner that fails over
// rebuilds whose owner disappeared.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use event_stream_core::error::{NotFoundKind, StoreError, StoreResult, SubstrateError};
use event_stream_core::model::{
    ProjectionStatus, ProjectionStatusInfo, RebuildInfo, RebuildStrategy, RebuildToken,
};
use event_stream_core::substrate::{Precondition, RowQuery, TableRow, UpsertMode, WideTable};

use crate::cancel::guard;
use crate::containers::ensure_table;

const STATUS_SCHEMA_VERSION: &str = "1.0.0";

/// Error text stamped on rebuilds recovered by the scanner
pub const REBUILD_TIMED_OUT: &str = "Rebuild timed out";

const COL_STATUS: &str = "Status";
const COL_STATUS_CHANGED: &str = "StatusChanged";
const COL_SCHEMA_VERSION: &str = "SchemaVersion";
const COL_REBUILD_STRATEGY: &str = "RebuildStrategy";
const COL_REBUILD_STARTED: &str = "RebuildStarted";
const COL_REBUILD_COMPLETED: &str = "RebuildCompleted";
const COL_REBUILD_ERROR: &str = "RebuildError";
const COL_TOKEN: &str = "ActiveToken";
const COL_TOKEN_STARTED: &str = "TokenStarted";
const COL_TOKEN_EXPIRES: &str = "TokenExpires";

/// Coordinates projection rebuilds on the wide-column substrate
pub struct ProjectionStatusCoordinator {
    table: Arc<dyn WideTable>,
    table_name: String,
    auto_create: bool,
}

impl ProjectionStatusCoordinator {
    pub fn new(table: Arc<dyn WideTable>, table_name: impl Into<String>) -> Self {
        Self {
            table,
            table_name: table_name.into(),
            auto_create: false,
        }
    }

    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    fn map_substrate(&self, error: SubstrateError) -> StoreError {
        StoreError::from_substrate(error, &self.table_name)
    }

    fn record_to_row(record: &ProjectionStatusInfo) -> TableRow {
        let mut row = TableRow::new(
            record.projection_name.clone(),
            record.object_id.clone(),
        )
        .with_string(COL_STATUS, record.status.as_str())
        .with_datetime(COL_STATUS_CHANGED, record.status_changed_timestamp)
        .with_string(COL_SCHEMA_VERSION, record.schema_version.clone());

        if let Some(rebuild) = &record.rebuild_info {
            row = row
                .with_string(COL_REBUILD_STRATEGY, rebuild.strategy.as_str())
                .with_datetime(COL_REBUILD_STARTED, rebuild.started_timestamp);
            if let Some(completed) = rebuild.completed_timestamp {
                row = row.with_datetime(COL_REBUILD_COMPLETED, completed);
            }
            if let Some(error) = &rebuild.error {
                row = row.with_string(COL_REBUILD_ERROR, error.clone());
            }
        }
        if let Some(token) = &record.active_token {
            row = row
                .with_string(COL_TOKEN, token.token.clone())
                .with_datetime(COL_TOKEN_STARTED, token.started_timestamp)
                .with_datetime(COL_TOKEN_EXPIRES, token.expires_timestamp);
        }
        row
    }

    fn row_to_record(row: &TableRow) -> StoreResult<ProjectionStatusInfo> {
        let status_text = row
            .string(COL_STATUS)
            .ok_or_else(|| StoreError::SerializationError {
                message: format!("status row {} has no status", row.row_key),
            })?;
        let status =
            ProjectionStatus::parse(status_text).ok_or_else(|| StoreError::SerializationError {
                message: format!("unknown projection status: {}", status_text),
            })?;

        let strategy = row
            .string(COL_REBUILD_STRATEGY)
            .and_then(RebuildStrategy::parse);
        let rebuild_info = strategy.map(|strategy| RebuildInfo {
            strategy,
            started_timestamp: row.datetime(COL_REBUILD_STARTED).unwrap_or_else(Utc::now),
            completed_timestamp: row.datetime(COL_REBUILD_COMPLETED),
            error: row.string(COL_REBUILD_ERROR).map(str::to_string),
        });
        let active_token = row.string(COL_TOKEN).map(|token| RebuildToken {
            projection_name: row.partition_key.clone(),
            object_id: row.row_key.clone(),
            token: token.to_string(),
            strategy: strategy.unwrap_or(RebuildStrategy::Full),
            started_timestamp: row.datetime(COL_TOKEN_STARTED).unwrap_or_else(Utc::now),
            expires_timestamp: row.datetime(COL_TOKEN_EXPIRES).unwrap_or_else(Utc::now),
        });

        Ok(ProjectionStatusInfo {
            projection_name: row.partition_key.clone(),
            object_id: row.row_key.clone(),
            status,
            status_changed_timestamp: row.datetime(COL_STATUS_CHANGED).unwrap_or_else(Utc::now),
            schema_version: row
                .string(COL_SCHEMA_VERSION)
                .unwrap_or(STATUS_SCHEMA_VERSION)
                .to_string(),
            rebuild_info,
            active_token,
        })
    }

    /// Take the rebuild lease for a projection/object pair.
    ///
    /// The write is unconditional: concurrent starters race and the
    /// surviving record holds the only honored token.
    pub async fn start_rebuild(
        &self,
        projection_name: &str,
        object_id: &str,
        strategy: RebuildStrategy,
        timeout: Duration,
        ctx: &CancellationToken,
    ) -> StoreResult<RebuildToken> {
        ensure_table(self.table.as_ref(), &self.table_name, self.auto_create, ctx).await?;
        guard(ctx, "start rebuild")?;

        let token = RebuildToken::issue(projection_name, object_id, strategy, timeout);
        let record = ProjectionStatusInfo {
            projection_name: projection_name.to_string(),
            object_id: object_id.to_string(),
            status: ProjectionStatus::Rebuilding,
            status_changed_timestamp: token.started_timestamp,
            schema_version: STATUS_SCHEMA_VERSION.to_string(),
            rebuild_info: Some(RebuildInfo {
                strategy,
                started_timestamp: token.started_timestamp,
                completed_timestamp: None,
                error: None,
            }),
            active_token: Some(token.clone()),
        };
        self.table
            .upsert(
                &self.table_name,
                Self::record_to_row(&record),
                UpsertMode::Replace,
                ctx,
            )
            .await
            .map_err(|e| self.map_substrate(e))?;

        info!(
            projection = projection_name,
            object_id = object_id,
            strategy = strategy.as_str(),
            "started projection rebuild"
        );
        Ok(token)
    }

    async fn load_with_etag(
        &self,
        projection_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<(ProjectionStatusInfo, String)>> {
        match self
            .table
            .get(&self.table_name, projection_name, object_id, ctx)
            .await
        {
            Ok(row) => {
                let etag = row.etag.clone().unwrap_or_default();
                Ok(Some((Self::row_to_record(&row)?, etag)))
            }
            Err(SubstrateError::NotFound {
                kind: NotFoundKind::Row,
            }) => Ok(None),
            Err(other) => Err(self.map_substrate(other)),
        }
    }

    /// Token-validated, etag-conditional state transition
    async fn transition(
        &self,
        token: &RebuildToken,
        allowed_from: &[ProjectionStatus],
        to: ProjectionStatus,
        clear_token: bool,
        error: Option<String>,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        if token.is_expired() {
            return Err(StoreError::TokenExpired {
                message: format!(
                    "rebuild token for {}/{} expired at {}",
                    token.projection_name, token.object_id, token.expires_timestamp
                ),
            });
        }
        guard(ctx, "rebuild transition")?;

        let Some((mut record, etag)) = self
            .load_with_etag(&token.projection_name, &token.object_id, ctx)
            .await?
        else {
            return Err(StoreError::InvalidToken {
                message: format!(
                    "no status record for {}/{}",
                    token.projection_name, token.object_id
                ),
            });
        };

        let holder_matches = record
            .active_token
            .as_ref()
            .is_some_and(|active| active.token == token.token);
        if !holder_matches {
            return Err(StoreError::InvalidToken {
                message: format!(
                    "token does not hold the rebuild lease for {}/{}",
                    token.projection_name, token.object_id
                ),
            });
        }
        if !allowed_from.contains(&record.status) {
            return Err(StoreError::InvalidArgument {
                message: format!(
                    "cannot transition {}/{} from {} to {}",
                    token.projection_name, token.object_id, record.status, to
                ),
            });
        }

        record.status = to;
        record.status_changed_timestamp = Utc::now();
        if clear_token {
            record.active_token = None;
        }
        if let Some(rebuild) = record.rebuild_info.as_mut() {
            if error.is_some() {
                rebuild.error = error;
            }
            if matches!(to, ProjectionStatus::Active | ProjectionStatus::Failed) {
                rebuild.completed_timestamp = Some(record.status_changed_timestamp);
            }
        }

        guard(ctx, "rebuild transition")?;
        self.table
            .update(
                &self.table_name,
                Self::record_to_row(&record),
                &Precondition::match_version(etag),
                ctx,
            )
            .await
            .map_err(|e| match e {
                SubstrateError::PreconditionFailed | SubstrateError::Conflict => {
                    StoreError::ConcurrencyConflict {
                        message: format!(
                            "status record for {}/{} changed during the transition",
                            token.projection_name, token.object_id
                        ),
                    }
                }
                other => self.map_substrate(other),
            })?;

        debug!(
            projection = token.projection_name.as_str(),
            object_id = token.object_id.as_str(),
            status = to.as_str(),
            "projection status transition"
        );
        Ok(())
    }

    /// Replay finished, switch to consuming the rebuild backlog
    pub async fn start_catch_up(
        &self,
        token: &RebuildToken,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        self.transition(
            token,
            &[ProjectionStatus::Rebuilding],
            ProjectionStatus::CatchingUp,
            false,
            None,
            ctx,
        )
        .await
    }

    /// Backlog drained, ready for the swap
    pub async fn mark_ready(
        &self,
        token: &RebuildToken,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        self.transition(
            token,
            &[ProjectionStatus::CatchingUp],
            ProjectionStatus::Ready,
            false,
            None,
            ctx,
        )
        .await
    }

    /// Finish the rebuild and release the lease
    pub async fn complete_rebuild(
        &self,
        token: &RebuildToken,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        self.transition(
            token,
            &[
                ProjectionStatus::Rebuilding,
                ProjectionStatus::CatchingUp,
                ProjectionStatus::Ready,
            ],
            ProjectionStatus::Active,
            true,
            None,
            ctx,
        )
        .await
    }

    /// Abort the rebuild, releasing the lease. With an error the
    /// record lands in Failed, otherwise back in Active.
    pub async fn cancel_rebuild(
        &self,
        token: &RebuildToken,
        error: Option<String>,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        let to = if error.is_some() {
            ProjectionStatus::Failed
        } else {
            ProjectionStatus::Active
        };
        self.transition(
            token,
            &[
                ProjectionStatus::Rebuilding,
                ProjectionStatus::CatchingUp,
                ProjectionStatus::Ready,
            ],
            to,
            true,
            error,
            ctx,
        )
        .await
    }

    /// Fail over rebuilds whose lease expired. Conditional writes:
    /// losing the race to another recoverer is silently skipped.
    /// Returns the number of records recovered.
    pub async fn recover_stuck_rebuilds(&self, ctx: &CancellationToken) -> StoreResult<usize> {
        let mut recovered = 0usize;
        let mut continuation = None;
        loop {
            guard(ctx, "recover rebuilds")?;
            let query = RowQuery::full_scan().with_continuation(continuation.take());
            let page = match self.table.query(&self.table_name, &query, ctx).await {
                Ok(page) => page,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Table,
                }) => return Ok(0),
                Err(other) => return Err(self.map_substrate(other)),
            };

            for row in &page.rows {
                let mut record = Self::row_to_record(row)?;
                let in_rebuild = matches!(
                    record.status,
                    ProjectionStatus::Rebuilding | ProjectionStatus::CatchingUp
                );
                let expired = record
                    .active_token
                    .as_ref()
                    .is_some_and(RebuildToken::is_expired);
                if !in_rebuild || !expired {
                    continue;
                }

                record.status = ProjectionStatus::Failed;
                record.status_changed_timestamp = Utc::now();
                record.active_token = None;
                if let Some(rebuild) = record.rebuild_info.as_mut() {
                    rebuild.error = Some(REBUILD_TIMED_OUT.to_string());
                    rebuild.completed_timestamp = Some(record.status_changed_timestamp);
                }

                guard(ctx, "recover rebuilds")?;
                let etag = row.etag.clone().unwrap_or_default();
                match self
                    .table
                    .update(
                        &self.table_name,
                        Self::record_to_row(&record),
                        &Precondition::match_version(etag),
                        ctx,
                    )
                    .await
                {
                    Ok(_) => {
                        warn!(
                            projection = record.projection_name.as_str(),
                            object_id = record.object_id.as_str(),
                            "recovered stuck rebuild"
                        );
                        recovered += 1;
                    }
                    // Another recoverer (or the owner) got there first.
                    Err(SubstrateError::PreconditionFailed) | Err(SubstrateError::Conflict) => {
                        debug!(
                            projection = record.projection_name.as_str(),
                            object_id = record.object_id.as_str(),
                            "stuck rebuild already recovered elsewhere"
                        );
                    }
                    Err(other) => return Err(self.map_substrate(other)),
                }
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(recovered)
    }

    /// Current status record, if any
    pub async fn get_status(
        &self,
        projection_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<Option<ProjectionStatusInfo>> {
        guard(ctx, "get status")?;
        Ok(self
            .load_with_etag(projection_name, object_id, ctx)
            .await?
            .map(|(record, _)| record))
    }

    /// All records currently in a status
    pub async fn get_by_status(
        &self,
        status: ProjectionStatus,
        ctx: &CancellationToken,
    ) -> StoreResult<Vec<ProjectionStatusInfo>> {
        let mut records = Vec::new();
        let mut continuation = None;
        loop {
            guard(ctx, "get by status")?;
            let query = RowQuery::full_scan().with_continuation(continuation.take());
            let page = match self.table.query(&self.table_name, &query, ctx).await {
                Ok(page) => page,
                Err(SubstrateError::NotFound {
                    kind: NotFoundKind::Table,
                }) => return Ok(records),
                Err(other) => return Err(self.map_substrate(other)),
            };
            for row in &page.rows {
                let record = Self::row_to_record(row)?;
                if record.status == status {
                    records.push(record);
                }
            }
            match page.next_token {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        Ok(records)
    }

    /// Administratively disable a projection
    pub async fn disable(
        &self,
        projection_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        self.write_status(projection_name, object_id, ProjectionStatus::Disabled, ctx)
            .await
    }

    /// Re-enable a disabled projection
    pub async fn enable(
        &self,
        projection_name: &str,
        object_id: &str,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        self.write_status(projection_name, object_id, ProjectionStatus::Active, ctx)
            .await
    }

    async fn write_status(
        &self,
        projection_name: &str,
        object_id: &str,
        status: ProjectionStatus,
        ctx: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_table(self.table.as_ref(), &self.table_name, self.auto_create, ctx).await?;
        guard(ctx, "write status")?;
        let row = TableRow::new(projection_name, object_id)
            .with_string(COL_STATUS, status.as_str())
            .with_datetime(COL_STATUS_CHANGED, Utc::now())
            .with_string(COL_SCHEMA_VERSION, STATUS_SCHEMA_VERSION);
        self.table
            .upsert(&self.table_name, row, UpsertMode::Merge, ctx)
            .await
            .map_err(|e| self.map_substrate(e))?;
        info!(
            projection = projection_name,
            object_id = object_id,
            status = status.as_str(),
            "set projection status"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_stream_core::substrate::InMemoryTableStore;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn coordinator() -> ProjectionStatusCoordinator {
        let table = Arc::new(InMemoryTableStore::new());
        table
            .create_table_if_not_exists("projectionstatus", &ctx())
            .await
            .unwrap();
        ProjectionStatusCoordinator::new(table, "projectionstatus")
    }

    #[tokio::test]
    async fn rebuild_happy_path_lands_active_with_no_token() {
        let coordinator = coordinator().await;
        let token = coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::seconds(5), &ctx())
            .await
            .unwrap();

        coordinator.start_catch_up(&token, &ctx()).await.unwrap();
        coordinator.mark_ready(&token, &ctx()).await.unwrap();
        coordinator.complete_rebuild(&token, &ctx()).await.unwrap();

        let record = coordinator
            .get_status("P", "A", &ctx())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ProjectionStatus::Active);
        assert!(record.active_token.is_none());
        assert!(record.rebuild_info.unwrap().completed_timestamp.is_some());
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let coordinator = coordinator().await;
        let token = coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::seconds(5), &ctx())
            .await
            .unwrap();
        coordinator.start_catch_up(&token, &ctx()).await.unwrap();

        let mut impostor = token.clone();
        impostor.token = "someone-else".to_string();
        let error = coordinator.mark_ready(&impostor, &ctx()).await.unwrap_err();
        assert!(matches!(error, StoreError::InvalidToken { .. }));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let coordinator = coordinator().await;
        let token = coordinator
            .start_rebuild(
                "P",
                "A",
                RebuildStrategy::Full,
                Duration::milliseconds(-1),
                &ctx(),
            )
            .await
            .unwrap();
        let error = coordinator.start_catch_up(&token, &ctx()).await.unwrap_err();
        assert!(matches!(error, StoreError::TokenExpired { .. }));
    }

    #[tokio::test]
    async fn transitions_enforce_the_state_machine() {
        let coordinator = coordinator().await;
        let token = coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::seconds(5), &ctx())
            .await
            .unwrap();

        // Ready requires CatchingUp first.
        let error = coordinator.mark_ready(&token, &ctx()).await.unwrap_err();
        assert!(matches!(error, StoreError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn restart_invalidates_the_previous_lease() {
        let coordinator = coordinator().await;
        let first = coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::seconds(5), &ctx())
            .await
            .unwrap();
        let second = coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::seconds(5), &ctx())
            .await
            .unwrap();

        let error = coordinator.start_catch_up(&first, &ctx()).await.unwrap_err();
        assert!(matches!(error, StoreError::InvalidToken { .. }));
        coordinator.start_catch_up(&second, &ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_with_error_fails_the_projection() {
        let coordinator = coordinator().await;
        let token = coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::seconds(5), &ctx())
            .await
            .unwrap();
        coordinator
            .cancel_rebuild(&token, Some("replay blew up".to_string()), &ctx())
            .await
            .unwrap();

        let record = coordinator
            .get_status("P", "A", &ctx())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ProjectionStatus::Failed);
        assert!(record.active_token.is_none());
        assert_eq!(
            record.rebuild_info.unwrap().error.as_deref(),
            Some("replay blew up")
        );
    }

    #[tokio::test]
    async fn recover_promotes_expired_rebuilds_once() {
        let coordinator = coordinator().await;
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
        assert!(record.active_token.is_none());
        assert_eq!(
            record.rebuild_info.unwrap().error.as_deref(),
            Some(REBUILD_TIMED_OUT)
        );

        // Idempotent: nothing new expired.
        assert_eq!(coordinator.recover_stuck_rebuilds(&ctx()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recover_skips_live_rebuilds() {
        let coordinator = coordinator().await;
        coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::minutes(5), &ctx())
            .await
            .unwrap();
        assert_eq!(coordinator.recover_stuck_rebuilds(&ctx()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_by_status_filters_records() {
        let coordinator = coordinator().await;
        coordinator
            .start_rebuild("P", "A", RebuildStrategy::Full, Duration::minutes(5), &ctx())
            .await
            .unwrap();
        coordinator.disable("P", "B", &ctx()).await.unwrap();

        let rebuilding = coordinator
            .get_by_status(ProjectionStatus::Rebuilding, &ctx())
            .await
            .unwrap();
        assert_eq!(rebuilding.len(), 1);
        assert_eq!(rebuilding[0].object_id, "A");

        let disabled = coordinator
            .get_by_status(ProjectionStatus::Disabled, &ctx())
            .await
            .unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].object_id, "B");
    }

    #[tokio::test]
    async fn disable_then_enable_round_trips() {
        let coordinator = coordinator().await;
        coordinator.disable("P", "A", &ctx()).await.unwrap();
        let record = coordinator.get_status("P", "A", &ctx()).await.unwrap().unwrap();
        assert_eq!(record.status, ProjectionStatus::Disabled);

        coordinator.enable("P", "A", &ctx()).await.unwrap();
        let record = coordinator.get_status("P", "A", &ctx()).await.unwrap().unwrap();
        assert_eq!(record.status, ProjectionStatus::Active);
    }
}
