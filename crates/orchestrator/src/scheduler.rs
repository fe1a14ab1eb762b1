//! Three-phase execution of one run's queued sessions.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use sentinel_core::*;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendSelector, ProbeJob};
use crate::registry::Phase;

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    backends: BackendSelector,
}

/// Queued sessions of a run grouped by phase, each group in declared order.
#[derive(Debug, Default)]
pub struct PhasePlan {
    pub surface: Vec<Session>,
    pub concurrent: Vec<Session>,
    pub sequential: Vec<Session>,
}

impl PhasePlan {
    pub fn from_sessions(sessions: Vec<Session>) -> Self {
        let mut plan = PhasePlan::default();
        for s in sessions {
            match Phase::of(s.kind()) {
                Phase::SurfaceMapping => plan.surface.push(s),
                Phase::Concurrent => plan.concurrent.push(s),
                Phase::Sequential => plan.sequential.push(s),
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.surface.is_empty() && self.concurrent.is_empty() && self.sequential.is_empty()
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn RecordStore>, backends: BackendSelector) -> Self {
        Scheduler { store, backends }
    }

    /// Run every queued session of `run`. Only a failure to read the run's
    /// sessions is an error; individual probe failures are recorded on
    /// their sessions and execution carries on.
    pub async fn execute(&self, run: &Run, cancel: &CancellationToken) -> anyhow::Result<()> {
        let sessions = self
            .store
            .sessions_for_run(run.id, Some(SessionStatus::Queued))
            .await
            .context("load queued sessions")?;
        let plan = PhasePlan::from_sessions(sessions);
        if plan.is_empty() {
            info!(run_id = %run.id, "no queued sessions");
            return Ok(());
        }
        info!(
            run_id = %run.id,
            surface = plan.surface.len(),
            concurrent = plan.concurrent.len(),
            sequential = plan.sequential.len(),
            "executing run"
        );

        for session in plan.surface {
            if self.halted(run, cancel).await {
                return Ok(());
            }
            self.join_all(run, cancel, vec![session]).await;
        }

        if self.halted(run, cancel).await {
            return Ok(());
        }
        self.join_all(run, cancel, plan.concurrent).await;

        for session in plan.sequential {
            if self.halted(run, cancel).await {
                return Ok(());
            }
            self.join_all(run, cancel, vec![session]).await;
        }
        Ok(())
    }

    /// Dispatch `sessions` side by side and wait for all of them. Each runs
    /// in its own task, so a panicking probe fails only its session. The
    /// tasks are owned by the set: dropping this future (a run timeout)
    /// aborts them instead of leaving them to write after the run ends.
    async fn join_all(&self, run: &Run, cancel: &CancellationToken, sessions: Vec<Session>) {
        let mut tasks = JoinSet::new();
        for session in sessions {
            let this = self.clone();
            let run = run.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(this.dispatch(&run, &session, &cancel)).catch_unwind().await;
                (session, outcome)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((session, Err(payload))) => self.crashed(run, &session, panic_message(payload)).await,
                Ok((_, Ok(()))) => {}
                Err(e) => error!(run_id = %run.id, error = %e, "dispatch task lost"),
            }
        }
    }

    async fn crashed(&self, run: &Run, session: &Session, reason: String) {
        error!(run_id = %run.id, session_id = %session.id, probe = %session.probe_type, error = %reason, "probe crashed");
        let event = NewEvent {
            run_id: run.id,
            probe_type: session.probe_type.clone(),
            level: EventLevel::Error,
            message: format!("Probe crashed: {reason}"),
            data: None,
        };
        if let Err(e) = self.store.append_event(&event).await {
            warn!(session_id = %session.id, error = %e, "could not record crash event");
        }
        self.mark_failed(session.id).await;
    }

    /// Dispatch one session. A dispatch error marks only that session failed.
    async fn dispatch(&self, run: &Run, session: &Session, cancel: &CancellationToken) {
        if let Ok(Some(current)) = self.store.get_session(session.id).await {
            if current.status == SessionStatus::Cancelled {
                debug!(session_id = %session.id, "skipping cancelled session");
                return;
            }
        }
        let job = ProbeJob::new(run, session);
        let backend = self.backends.for_kind(job.kind());
        match backend.dispatch(&job, cancel).await {
            Ok(status) => {
                debug!(run_id = %run.id, session_id = %session.id, backend = backend.name(), %status, "probe returned");
            }
            Err(e) => {
                warn!(
                    run_id = %run.id,
                    session_id = %session.id,
                    probe = %session.probe_type,
                    backend = backend.name(),
                    error = %format!("{e:#}"),
                    "probe dispatch failed"
                );
                self.mark_failed(session.id).await;
            }
        }
    }

    async fn mark_failed(&self, session_id: SessionId) {
        for attempt in 0..2 {
            match self.store.set_session_status(session_id, SessionStatus::Failed).await {
                Ok(_) => return,
                Err(e) => warn!(%session_id, attempt, error = %e, "could not mark session failed"),
            }
        }
    }

    /// True when the run was cancelled, either through the token or in the
    /// store. A store cancellation trips the token so probes see it too.
    async fn halted(&self, run: &Run, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return true;
        }
        match self.store.get_run(run.id).await {
            Ok(Some(r)) if r.status == RunStatus::Cancelled => {
                info!(run_id = %run.id, "run cancelled; stopping");
                cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".into()
    }
}
