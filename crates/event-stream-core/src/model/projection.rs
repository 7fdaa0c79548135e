// File: src/model/projection.rs
//
// Projection status records, rebuild leases, and checkpoint
// fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a projection for one object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProjectionStatus {
    /// Serving reads and consuming new events
    Active,
    /// A rebuild owns the projection and is replaying history
    Rebuilding,
    /// Replay finished; consuming events written during the rebuild
    CatchingUp,
    /// Caught up; waiting for the rebuild owner to swap it in
    Ready,
    /// Rebuild failed or timed out
    Failed,
    /// Administratively disabled
    Disabled,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::Active => "Active",
            ProjectionStatus::Rebuilding => "Rebuilding",
            ProjectionStatus::CatchingUp => "CatchingUp",
            ProjectionStatus::Ready => "Ready",
            ProjectionStatus::Failed => "Failed",
            ProjectionStatus::Disabled => "Disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Active" => Some(ProjectionStatus::Active),
            "Rebuilding" => Some(ProjectionStatus::Rebuilding),
            "CatchingUp" => Some(ProjectionStatus::CatchingUp),
            "Ready" => Some(ProjectionStatus::Ready),
            "Failed" => Some(ProjectionStatus::Failed),
            "Disabled" => Some(ProjectionStatus::Disabled),
            _ => None,
        }
    }

    /// Statuses during which a rebuild lease may be held
    pub fn is_rebuild_phase(&self) -> bool {
        matches!(
            self,
            ProjectionStatus::Rebuilding | ProjectionStatus::CatchingUp | ProjectionStatus::Ready
        )
    }
}

impl std::fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a rebuild replays history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RebuildStrategy {
    /// Reset and replay from version 0
    Full,
    /// Resume from the projection's last checkpoint
    Incremental,
}

impl RebuildStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildStrategy::Full => "Full",
            RebuildStrategy::Incremental => "Incremental",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Full" => Some(RebuildStrategy::Full),
            "Incremental" => Some(RebuildStrategy::Incremental),
            _ => None,
        }
    }
}

/// Metadata about the current or last rebuild of a projection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildInfo {
    pub strategy: RebuildStrategy,
    pub started_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Lease that authorizes rebuild state transitions.
///
/// Owned by the caller of `start_rebuild` until complete, cancel, or
/// wall-clock expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebuildToken {
    pub projection_name: String,
    pub object_id: String,
    pub token: String,
    pub strategy: RebuildStrategy,
    pub started_timestamp: DateTime<Utc>,
    pub expires_timestamp: DateTime<Utc>,
}

impl RebuildToken {
    pub fn issue(
        projection_name: impl Into<String>,
        object_id: impl Into<String>,
        strategy: RebuildStrategy,
        timeout: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            projection_name: projection_name.into(),
            object_id: object_id.into(),
            token: Uuid::new_v4().simple().to_string(),
            strategy,
            started_timestamp: now,
            expires_timestamp: now + timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_timestamp
    }
}

/// Persisted status record for a `(projection, object)` pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionStatusInfo {
    pub projection_name: String,
    pub object_id: String,
    pub status: ProjectionStatus,
    pub status_changed_timestamp: DateTime<Utc>,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_info: Option<RebuildInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_token: Option<RebuildToken>,
}

/// Content digest addressing a stored checkpoint version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CheckpointFingerprint(pub String);

impl CheckpointFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CheckpointFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
