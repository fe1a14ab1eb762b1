//! In-process `RecordStore`, used by tests and by `--store memory` runs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::model::*;
use crate::now_rfc3339;
use crate::store::{RecordStore, StoreError};

#[derive(Default)]
struct State {
    runs: Vec<Run>,
    sessions: Vec<Session>,
    events: Vec<Event>,
    findings: Vec<Finding>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    missing_finding_fields: HashSet<String>,
    fail_event_writes: AtomicBool,
    fail_session_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose findings "table" lacks the named optional columns, so
    /// writes carrying them are rejected the way an outdated schema would.
    pub fn with_missing_finding_fields(fields: &[&str]) -> Self {
        MemoryStore { missing_finding_fields: fields.iter().map(|f| f.to_string()).collect(), ..Self::default() }
    }

    /// Make every subsequent event append fail.
    pub fn fail_event_writes(&self, fail: bool) {
        self.fail_event_writes.store(fail, Ordering::SeqCst);
    }

    /// Make listing a run's sessions fail, as a lost connection would.
    pub fn fail_session_reads(&self, fail: bool) {
        self.fail_session_reads.store(fail, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(record: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound { record, id: id.to_string() }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_run(&self, run: &NewRun) -> Result<Run, StoreError> {
        let row = Run {
            id: new_id(),
            target_url: run.target_url.clone(),
            probes: run.probes.clone(),
            status: RunStatus::Initializing,
            configuration: run.configuration.clone(),
            created_at: now_rfc3339(),
            started_at: None,
            ended_at: None,
        };
        self.state().runs.push(row.clone());
        Ok(row)
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.state().runs.iter().find(|r| r.id == id).cloned())
    }

    async fn set_run_status(&self, id: RunId, status: RunStatus) -> Result<(), StoreError> {
        let mut st = self.state();
        let run = st.runs.iter_mut().find(|r| r.id == id).ok_or_else(|| not_found("run", id))?;
        run.status = status;
        Ok(())
    }

    async fn claim_next_run(&self) -> Result<Option<Run>, StoreError> {
        let mut st = self.state();
        // runs are kept in insertion order, so the first match is the oldest
        let Some(run) = st.runs.iter_mut().find(|r| r.status == RunStatus::Queued) else {
            return Ok(None);
        };
        run.status = RunStatus::Running;
        run.started_at = Some(now_rfc3339());
        Ok(Some(run.clone()))
    }

    async fn finish_run(&self, id: RunId, status: RunStatus) -> Result<bool, StoreError> {
        let mut st = self.state();
        let run = st.runs.iter_mut().find(|r| r.id == id).ok_or_else(|| not_found("run", id))?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = status;
        run.ended_at = Some(now_rfc3339());
        Ok(true)
    }

    async fn cancel_run(&self, id: RunId) -> Result<(), StoreError> {
        let mut st = self.state();
        let run = st.runs.iter_mut().find(|r| r.id == id).ok_or_else(|| not_found("run", id))?;
        if !run.status.is_terminal() {
            run.status = RunStatus::Cancelled;
            run.ended_at = Some(now_rfc3339());
        }
        let now = now_rfc3339();
        for s in st.sessions.iter_mut().filter(|s| s.run_id == id && !s.status.is_terminal()) {
            s.status = SessionStatus::Cancelled;
            s.updated_at = Some(now.clone());
        }
        Ok(())
    }

    async fn insert_sessions(&self, run_id: RunId, probe_types: &[String]) -> Result<Vec<Session>, StoreError> {
        let mut st = self.state();
        if !st.runs.iter().any(|r| r.id == run_id) {
            return Err(not_found("run", run_id));
        }
        let created: Vec<Session> = probe_types
            .iter()
            .map(|p| Session {
                id: new_id(),
                run_id,
                probe_type: p.clone(),
                status: SessionStatus::Queued,
                progress: 0,
                created_at: now_rfc3339(),
                updated_at: None,
            })
            .collect();
        st.sessions.extend(created.iter().cloned());
        Ok(created)
    }

    async fn sessions_for_run(&self, run_id: RunId, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError> {
        if self.fail_session_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("session table unavailable".into()));
        }
        Ok(self
            .state()
            .sessions
            .iter()
            .filter(|s| s.run_id == run_id && status.map_or(true, |want| s.status == want))
            .cloned()
            .collect())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.state().sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn set_session_status(&self, id: SessionId, status: SessionStatus) -> Result<bool, StoreError> {
        let mut st = self.state();
        let s = st.sessions.iter_mut().find(|s| s.id == id).ok_or_else(|| not_found("session", id))?;
        if s.status == SessionStatus::Cancelled {
            return Ok(false);
        }
        s.status = status;
        s.updated_at = Some(now_rfc3339());
        Ok(true)
    }

    async fn set_session_progress(&self, id: SessionId, percent: u8) -> Result<(), StoreError> {
        let mut st = self.state();
        let s = st.sessions.iter_mut().find(|s| s.id == id).ok_or_else(|| not_found("session", id))?;
        s.progress = percent.min(100);
        Ok(())
    }

    async fn append_event(&self, event: &NewEvent) -> Result<EventId, StoreError> {
        if self.fail_event_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("event log unavailable".into()));
        }
        let id = new_id();
        self.state().events.push(Event {
            id,
            run_id: event.run_id,
            probe_type: event.probe_type.clone(),
            level: event.level,
            message: event.message.clone(),
            data: event.data.clone(),
            created_at: now_rfc3339(),
        });
        Ok(id)
    }

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<Event>, StoreError> {
        Ok(self.state().events.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }

    async fn append_finding(&self, finding: &NewFinding) -> Result<FindingId, StoreError> {
        if finding.screenshots.is_some() && self.missing_finding_fields.contains("screenshots") {
            return Err(StoreError::UnknownField { record: "findings", field: "screenshots".into() });
        }
        let id = new_id();
        self.state().findings.push(Finding {
            id,
            run_id: finding.run_id,
            probe_type: finding.probe_type.clone(),
            severity: finding.severity,
            title: finding.title.clone(),
            evidence: finding.evidence.clone(),
            recommendation: finding.recommendation.clone(),
            screenshots: finding.screenshots.clone(),
            created_at: now_rfc3339(),
        });
        Ok(id)
    }

    async fn findings_for_run(&self, run_id: RunId) -> Result<Vec<Finding>, StoreError> {
        Ok(self.state().findings.iter().filter(|f| f.run_id == run_id).cloned().collect())
    }
}
