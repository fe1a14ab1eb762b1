use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sentinel_core::*;

use crate::Db;

/// `RecordStore` over one SQLite connection. Statements run on the blocking
/// pool so slow disks never stall probe tasks.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Db>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::from_db(Db::open_or_create(path)?))
    }

    pub fn from_db(db: Db) -> Self {
        SqliteStore { db: Arc::new(Mutex::new(db)) }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Db) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_run(&self, run: &NewRun) -> Result<Run, StoreError> {
        let run = run.clone();
        self.with_db(move |db| db.insert_run(&run)).await
    }

    async fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        self.with_db(move |db| db.get_run(id)).await
    }

    async fn set_run_status(&self, id: RunId, status: RunStatus) -> Result<(), StoreError> {
        self.with_db(move |db| db.set_run_status(id, status)).await
    }

    async fn claim_next_run(&self) -> Result<Option<Run>, StoreError> {
        self.with_db(|db| db.claim_next_run()).await
    }

    async fn finish_run(&self, id: RunId, status: RunStatus) -> Result<bool, StoreError> {
        self.with_db(move |db| db.finish_run(id, status)).await
    }

    async fn cancel_run(&self, id: RunId) -> Result<(), StoreError> {
        self.with_db(move |db| db.cancel_run(id)).await
    }

    async fn insert_sessions(&self, run_id: RunId, probe_types: &[String]) -> Result<Vec<Session>, StoreError> {
        let probe_types = probe_types.to_vec();
        self.with_db(move |db| db.insert_sessions(run_id, &probe_types)).await
    }

    async fn sessions_for_run(&self, run_id: RunId, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError> {
        self.with_db(move |db| db.sessions_for_run(run_id, status)).await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        self.with_db(move |db| db.get_session(id)).await
    }

    async fn set_session_status(&self, id: SessionId, status: SessionStatus) -> Result<bool, StoreError> {
        self.with_db(move |db| db.set_session_status(id, status)).await
    }

    async fn set_session_progress(&self, id: SessionId, percent: u8) -> Result<(), StoreError> {
        self.with_db(move |db| db.set_session_progress(id, percent)).await
    }

    async fn append_event(&self, event: &NewEvent) -> Result<EventId, StoreError> {
        let event = event.clone();
        self.with_db(move |db| db.append_event(&event)).await
    }

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<Event>, StoreError> {
        self.with_db(move |db| db.events_for_run(run_id)).await
    }

    async fn append_finding(&self, finding: &NewFinding) -> Result<FindingId, StoreError> {
        let finding = finding.clone();
        self.with_db(move |db| db.append_finding(&finding)).await
    }

    async fn findings_for_run(&self, run_id: RunId) -> Result<Vec<Finding>, StoreError> {
        self.with_db(move |db| db.findings_for_run(run_id)).await
    }
}
