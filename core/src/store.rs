//! Record store contract shared by every backend.

use async_trait::async_trait;

use crate::model::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("{record} {id} not found")]
    NotFound { record: &'static str, id: String },
    /// The store schema does not know an optional column the caller sent.
    #[error("{record} has no field named {field}")]
    UnknownField { record: &'static str, field: String },
    #[error("could not decode stored {record}: {reason}")]
    Decode { record: &'static str, reason: String },
}

/// Typed accessors over the run/session/event/finding records.
///
/// Implementations hold no business rules beyond two status guards:
/// `claim_next_run` must move exactly one `Queued` run to `Running` per call
/// even under concurrent callers, and a `Cancelled` session is never
/// overwritten by `set_session_status`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_run(&self, run: &NewRun) -> Result<Run, StoreError>;
    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError>;
    async fn set_run_status(&self, id: RunId, status: RunStatus) -> Result<(), StoreError>;

    /// Oldest `Queued` run (creation order), moved to `Running` with
    /// `started_at` stamped. `None` when nothing is waiting.
    async fn claim_next_run(&self) -> Result<Option<Run>, StoreError>;

    /// Move a `Running` run to a terminal status and stamp `ended_at`.
    /// Returns `false` when the run was no longer `Running` (e.g. cancelled).
    async fn finish_run(&self, id: RunId, status: RunStatus) -> Result<bool, StoreError>;

    /// Cancel the run and every non-terminal session it owns.
    async fn cancel_run(&self, id: RunId) -> Result<(), StoreError>;

    async fn insert_sessions(&self, run_id: RunId, probe_types: &[String]) -> Result<Vec<Session>, StoreError>;

    /// Sessions of a run in creation order, optionally filtered by status.
    async fn sessions_for_run(&self, run_id: RunId, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError>;

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Returns `false` when the session is cancelled and was left untouched.
    async fn set_session_status(&self, id: SessionId, status: SessionStatus) -> Result<bool, StoreError>;

    async fn set_session_progress(&self, id: SessionId, percent: u8) -> Result<(), StoreError>;

    async fn append_event(&self, event: &NewEvent) -> Result<EventId, StoreError>;
    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<Event>, StoreError>;

    async fn append_finding(&self, finding: &NewFinding) -> Result<FindingId, StoreError>;
    async fn findings_for_run(&self, run_id: RunId) -> Result<Vec<Finding>, StoreError>;
}
