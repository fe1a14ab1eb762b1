//! Claims queued runs one at a time and drives each to a terminal status.

use std::sync::Arc;
use std::time::Duration;

use sentinel_core::*;
use tracing::{error, info, warn};

use crate::scheduler::Scheduler;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub run_timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        CoordinatorOptions {
            poll_interval: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
            run_timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn RecordStore>,
    scheduler: Scheduler,
    opts: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(store: Arc<dyn RecordStore>, scheduler: Scheduler, opts: CoordinatorOptions) -> Self {
        Coordinator { store, scheduler, opts }
    }

    /// Claim the oldest queued run. The claim moves it to RUNNING and stamps
    /// `started_at` in one store operation, so two pollers never share a run.
    pub async fn poll(&self) -> Result<Option<Run>, StoreError> {
        self.store.claim_next_run().await
    }

    /// Execute a claimed run and record its terminal status. Never leaves
    /// the run RUNNING unless the store refuses both finishing writes.
    pub async fn drive(&self, run: Run) -> RunStatus {
        let cancel = CancellationToken::new();
        info!(run_id = %run.id, target = %run.target_url, probes = ?run.probes, "run started");

        let outcome = tokio::time::timeout(self.opts.run_timeout, self.scheduler.execute(&run, &cancel)).await;
        let status = match outcome {
            Ok(Ok(())) => RunStatus::Completed,
            Ok(Err(e)) => {
                error!(run_id = %run.id, error = %format!("{e:#}"), "scheduler failed");
                RunStatus::Failed
            }
            Err(_) => {
                error!(run_id = %run.id, timeout_secs = self.opts.run_timeout.as_secs(), "run timed out");
                cancel.cancel();
                self.close_open_sessions(run.id).await;
                RunStatus::Failed
            }
        };
        self.finish(run.id, status).await
    }

    async fn finish(&self, run_id: RunId, status: RunStatus) -> RunStatus {
        for attempt in 0..2 {
            match self.store.finish_run(run_id, status).await {
                Ok(true) => {
                    info!(%run_id, %status, "run finished");
                    return status;
                }
                Ok(false) => {
                    // cancelled (or otherwise finished) while we were driving it
                    let current = match self.store.get_run(run_id).await {
                        Ok(Some(r)) => r.status,
                        _ => status,
                    };
                    info!(%run_id, status = %current, "run already terminal");
                    return current;
                }
                Err(e) => warn!(%run_id, %status, attempt, error = %e, "finish_run failed"),
            }
        }
        error!(%run_id, "run left RUNNING; store rejected both finishing writes");
        RunStatus::Running
    }

    /// Sessions still queued or running when the run times out are failed.
    async fn close_open_sessions(&self, run_id: RunId) {
        let sessions = match self.store.sessions_for_run(run_id, None).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%run_id, error = %e, "could not list sessions after timeout");
                return;
            }
        };
        for s in sessions.into_iter().filter(|s| !s.status.is_terminal()) {
            if let Err(e) = self.store.set_session_status(s.id, SessionStatus::Failed).await {
                warn!(session_id = %s.id, error = %e, "could not fail timed-out session");
            }
        }
    }

    /// Claim and drive at most one run.
    pub async fn run_once(&self) -> Result<Option<(RunId, RunStatus)>, StoreError> {
        match self.poll().await? {
            Some(run) => {
                let id = run.id;
                Ok(Some((id, self.drive(run).await)))
            }
            None => Ok(None),
        }
    }

    /// Poll until `shutdown` trips. A run in progress is always driven to
    /// its end; an idle wait ends as soon as the token is cancelled.
    pub async fn run_forever(&self, shutdown: CancellationToken) {
        info!(poll_ms = self.opts.poll_interval.as_millis() as u64, "coordinator polling");
        while !shutdown.is_cancelled() {
            let pause = match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => self.opts.poll_interval,
                Err(e) => {
                    error!(error = %e, "polling for runs failed");
                    self.opts.error_backoff
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("coordinator stopped");
    }
}
