//! Run submission and cancellation.

use anyhow::{bail, Context};
use sentinel_core::*;
use serde_json::Value;
use tracing::info;

/// Probe set used when a submission names none.
pub const DEFAULT_PROBES: [&str; 2] = ["exposure", "headers_tls"];

/// Create a run with one queued session per probe, in request order. The
/// run only becomes claimable once all of its sessions exist.
pub async fn submit_run(store: &dyn RecordStore, target: &str, probes: &[String], configuration: Value) -> anyhow::Result<Run> {
    let Some(target) = Target::parse(target) else {
        bail!("target address is empty");
    };
    let probes: Vec<String> = probes.iter().map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect();
    let probes = if probes.is_empty() { DEFAULT_PROBES.iter().map(|p| p.to_string()).collect() } else { probes };

    let run = store
        .insert_run(&NewRun { target_url: target.as_str().to_string(), probes: probes.clone(), configuration })
        .await
        .context("insert run")?;
    store.insert_sessions(run.id, &probes).await.context("insert sessions")?;
    store.set_run_status(run.id, RunStatus::Queued).await.context("queue run")?;
    info!(run_id = %run.id, target = %run.target_url, ?probes, "run queued");
    Ok(Run { status: RunStatus::Queued, ..run })
}

/// Move the run and its unfinished sessions to CANCELLED. Probes notice at
/// their next cancellation check.
pub async fn cancel_run(store: &dyn RecordStore, run_id: RunId) -> anyhow::Result<()> {
    store.cancel_run(run_id).await.with_context(|| format!("cancel run {run_id}"))?;
    info!(%run_id, "run cancelled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_probe_list_gets_defaults() {
        let store = MemoryStore::new();
        let run = submit_run(&store, " https://a.test ", &[], Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.target_url, "https://a.test");
        let sessions = store.sessions_for_run(run.id, None).await.unwrap();
        let types: Vec<_> = sessions.iter().map(|s| s.probe_type.as_str()).collect();
        assert_eq!(types, DEFAULT_PROBES);
        assert!(sessions.iter().all(|s| s.status == SessionStatus::Queued));
    }

    #[tokio::test]
    async fn blank_target_is_rejected() {
        let store = MemoryStore::new();
        assert!(submit_run(&store, "  ", &["xss".into()], Value::Null).await.is_err());
        assert!(store.claim_next_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_marks_run_and_sessions() {
        let store = MemoryStore::new();
        let run = submit_run(&store, "https://a.test", &["sqli".into(), "xss".into()], Value::Null).await.unwrap();
        cancel_run(&store, run.id).await.unwrap();
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().status, RunStatus::Cancelled);
        let sessions = store.sessions_for_run(run.id, Some(SessionStatus::Cancelled)).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(store.claim_next_run().await.unwrap().is_none());
    }
}
