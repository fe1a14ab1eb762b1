//! Probe contract: the trait every probe implements and the lifecycle
//! wrapper that turns any probe outcome into session and event records.

use async_trait::async_trait;
use sentinel_core::{EventLevel, ProbeKind, SessionStatus};
use tracing::{error, info, warn};

pub mod auth;
pub mod config;
pub mod context;
pub mod services;

pub use auth::login;
pub use config::{Auth, AuthType, RunConfig};
pub use context::{FindingDraft, ProbeContext};
pub use services::{NoBrowser, NoCompletion, ProbeServices};

#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// Probe-specific work. Errors are recorded by [`run_probe`].
    async fn execute(&self, ctx: &ProbeContext) -> anyhow::Result<()>;
}

/// Run one probe under the uniform lifecycle: mark the session running,
/// execute, then record the outcome. Never returns an error; the returned
/// status is what the session ended as.
pub async fn run_probe(probe: &dyn Probe, ctx: &ProbeContext) -> SessionStatus {
    if ctx.is_cancelled().await {
        return SessionStatus::Cancelled;
    }
    if !write_status(ctx, SessionStatus::Running).await {
        return SessionStatus::Cancelled;
    }
    info!(run_id = %ctx.run_id, session_id = %ctx.session_id, probe = %probe.kind(), target = %ctx.target, "probe started");

    let outcome = probe.execute(ctx).await;

    let status = match outcome {
        Ok(()) if ctx.cancel.is_cancelled() => SessionStatus::Cancelled,
        Ok(()) => {
            ctx.update_progress(100).await;
            SessionStatus::Completed
        }
        Err(e) => {
            error!(run_id = %ctx.run_id, session_id = %ctx.session_id, probe = %probe.kind(), error = %format!("{e:#}"), "probe failed");
            ctx.emit(EventLevel::Error, format!("Probe failed: {e:#}")).await;
            SessionStatus::Failed
        }
    };
    if !write_status(ctx, status).await {
        return SessionStatus::Cancelled;
    }
    info!(run_id = %ctx.run_id, session_id = %ctx.session_id, probe = %probe.kind(), status = %status, "probe finished");
    status
}

/// Returns false when the session was cancelled underneath us. A failed
/// write is retried once and otherwise logged.
async fn write_status(ctx: &ProbeContext, status: SessionStatus) -> bool {
    for attempt in 0..2 {
        match ctx.store.set_session_status(ctx.session_id, status).await {
            Ok(applied) => return applied,
            Err(e) => warn!(session_id = %ctx.session_id, %status, attempt, error = %e, "session status write failed"),
        }
    }
    true
}
