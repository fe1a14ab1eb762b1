//! Run orchestration: claiming runs, phasing their sessions and choosing
//! where each probe executes.

pub mod backend;
pub mod coordinator;
pub mod registry;
pub mod scheduler;
pub mod submit;

pub use backend::{BackendSelector, ExecutionBackend, LocalBackend, ProbeJob, RemoteBackend, RemoteOptions};
pub use coordinator::{Coordinator, CoordinatorOptions};
pub use registry::{Phase, ProbeRegistry};
pub use scheduler::{PhasePlan, Scheduler};
pub use submit::{cancel_run, submit_run, DEFAULT_PROBES};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use probe::{Probe, ProbeContext, ProbeServices};
    use sentinel_core::*;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Barrier;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records begin/end around an optional rendezvous and pause.
    struct Scripted {
        kind: ProbeKind,
        log: Log,
        barrier: Option<Arc<Barrier>>,
        pause: Duration,
        fail: bool,
        cancel_run: bool,
        panic: bool,
    }

    impl Scripted {
        fn new(kind: ProbeKind, log: &Log) -> Self {
            Scripted { kind, log: log.clone(), barrier: None, pause: Duration::from_millis(5), fail: false, cancel_run: false, panic: false }
        }

        fn push(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}:{what}", self.kind));
        }
    }

    #[async_trait]
    impl Probe for Scripted {
        fn kind(&self) -> ProbeKind {
            self.kind
        }

        async fn execute(&self, ctx: &ProbeContext) -> anyhow::Result<()> {
            self.push("begin");
            if self.panic {
                panic!("scripted crash");
            }
            if let Some(barrier) = &self.barrier {
                tokio::time::timeout(Duration::from_secs(5), barrier.wait())
                    .await
                    .map_err(|_| anyhow::anyhow!("siblings never ran alongside"))?;
            }
            tokio::time::sleep(self.pause).await;
            if self.cancel_run {
                ctx.store.cancel_run(ctx.run_id).await?;
            }
            self.push("end");
            if self.fail {
                anyhow::bail!("forced failure");
            }
            Ok(())
        }
    }

    fn coordinator(store: Arc<MemoryStore>, registry: ProbeRegistry, run_timeout: Duration) -> Coordinator {
        let services = Arc::new(ProbeServices::offline(reqwest::Client::new()));
        let local = Arc::new(LocalBackend::new(registry, store.clone(), services));
        let scheduler = Scheduler::new(store.clone(), BackendSelector::local_only(local));
        let opts = CoordinatorOptions { run_timeout, ..CoordinatorOptions::default() };
        Coordinator::new(store, scheduler, opts)
    }

    fn strs(probes: &[&str]) -> Vec<String> {
        probes.iter().map(|p| p.to_string()).collect()
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter().position(|e| e == entry).unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
    }

    async fn session_status(store: &MemoryStore, run_id: RunId, probe_type: &str) -> SessionStatus {
        store
            .sessions_for_run(run_id, None)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.probe_type == probe_type)
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn phases_run_in_order_and_failures_stay_isolated() {
        let log: Log = Arc::default();
        let barrier = Arc::new(Barrier::new(2));
        let fast_a = Scripted { barrier: Some(barrier.clone()), ..Scripted::new(ProbeKind::Exposure, &log) };
        let fast_b = Scripted { barrier: Some(barrier), fail: true, ..Scripted::new(ProbeKind::HeadersTls, &log) };
        let registry = ProbeRegistry::new()
            .with(Arc::new(Scripted::new(ProbeKind::Crawler, &log)))
            .with(Arc::new(fast_a))
            .with(Arc::new(fast_b))
            .with(Arc::new(Scripted::new(ProbeKind::LlmAnalysis, &log)));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["crawler", "exposure", "headers_tls", "llm_analysis"]), Value::Null)
            .await
            .unwrap();

        let outcome = coordinator(store.clone(), registry, Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Completed)));

        let log = log.lock().unwrap().clone();
        assert_eq!(&log[..2], ["crawler:begin", "crawler:end"]);
        let crawler_end = position(&log, "crawler:end");
        for fast in ["exposure:begin", "headers_tls:begin", "exposure:end", "headers_tls:end"] {
            assert!(position(&log, fast) > crawler_end);
            assert!(position(&log, fast) < position(&log, "llm_analysis:begin"));
        }
        assert_eq!(log.last().unwrap(), "llm_analysis:end");

        assert_eq!(session_status(&store, run.id, "headers_tls").await, SessionStatus::Failed);
        assert_eq!(session_status(&store, run.id, "exposure").await, SessionStatus::Completed);
        assert_eq!(session_status(&store, run.id, "llm_analysis").await, SessionStatus::Completed);
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn sequential_probes_follow_declared_order() {
        let log: Log = Arc::default();
        let registry = ProbeRegistry::new()
            .with(Arc::new(Scripted { pause: Duration::from_millis(20), ..Scripted::new(ProbeKind::RedTeam, &log) }))
            .with(Arc::new(Scripted::new(ProbeKind::LlmAnalysis, &log)));
        let store = Arc::new(MemoryStore::new());
        submit_run(store.as_ref(), "https://a.test", &strs(&["red_team", "llm_analysis"]), Value::Null).await.unwrap();

        coordinator(store, registry, Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["red_team:begin", "red_team:end", "llm_analysis:begin", "llm_analysis:end"]);
    }

    #[tokio::test]
    async fn unknown_probe_types_run_the_default_probe() {
        let log: Log = Arc::default();
        let registry = ProbeRegistry::new().with(Arc::new(Scripted::new(ProbeKind::Exposure, &log)));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["custom"]), Value::Null).await.unwrap();

        coordinator(store.clone(), registry, Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["exposure:begin", "exposure:end"]);
        assert_eq!(session_status(&store, run.id, "custom").await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn scheduler_failure_still_reaches_a_terminal_status() {
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["xss"]), Value::Null).await.unwrap();
        store.fail_session_reads(true);

        let outcome = coordinator(store.clone(), ProbeRegistry::new(), Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Failed)));
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn run_without_sessions_completes() {
        let store = Arc::new(MemoryStore::new());
        let run = store
            .insert_run(&NewRun { target_url: "https://a.test".into(), probes: vec![], configuration: Value::Null })
            .await
            .unwrap();
        store.set_run_status(run.id, RunStatus::Queued).await.unwrap();

        let outcome = coordinator(store, ProbeRegistry::new(), Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Completed)));
    }

    #[tokio::test]
    async fn missing_implementation_fails_only_that_session() {
        let log: Log = Arc::default();
        // no default registered, so `sqli` cannot be resolved
        let registry = ProbeRegistry::new().with(Arc::new(Scripted::new(ProbeKind::Crawler, &log)));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["crawler", "sqli"]), Value::Null).await.unwrap();

        let outcome = coordinator(store.clone(), registry, Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Completed)));
        assert_eq!(session_status(&store, run.id, "sqli").await, SessionStatus::Failed);
        assert_eq!(session_status(&store, run.id, "crawler").await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_mid_run_is_not_overwritten() {
        let log: Log = Arc::default();
        let registry = ProbeRegistry::new()
            .with(Arc::new(Scripted { cancel_run: true, ..Scripted::new(ProbeKind::Crawler, &log) }))
            .with(Arc::new(Scripted::new(ProbeKind::Xss, &log)));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["crawler", "xss"]), Value::Null).await.unwrap();

        let outcome = coordinator(store.clone(), registry, Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Cancelled)));
        assert!(!log.lock().unwrap().iter().any(|e| e.starts_with("xss")));
        assert_eq!(session_status(&store, run.id, "xss").await, SessionStatus::Cancelled);
        assert_eq!(session_status(&store, run.id, "crawler").await, SessionStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_is_failed() {
        let log: Log = Arc::default();
        let registry = ProbeRegistry::new()
            .with(Arc::new(Scripted { pause: Duration::from_secs(3600), ..Scripted::new(ProbeKind::RedTeam, &log) }));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["red_team"]), Value::Null).await.unwrap();

        let outcome = coordinator(store.clone(), registry, Duration::from_secs(30)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Failed)));
        assert_eq!(session_status(&store, run.id, "red_team").await, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn panicking_probe_fails_only_its_session() {
        let log: Log = Arc::default();
        let registry = ProbeRegistry::new()
            .with(Arc::new(Scripted { panic: true, ..Scripted::new(ProbeKind::RedTeam, &log) }))
            .with(Arc::new(Scripted::new(ProbeKind::LlmAnalysis, &log)));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["red_team", "llm_analysis"]), Value::Null).await.unwrap();

        let outcome = coordinator(store.clone(), registry, Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Completed)));
        assert_eq!(session_status(&store, run.id, "red_team").await, SessionStatus::Failed);
        assert_eq!(session_status(&store, run.id, "llm_analysis").await, SessionStatus::Completed);
        let events = store.events_for_run(run.id).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.level == EventLevel::Error && e.probe_type == "red_team" && e.message.contains("scripted crash")));
    }

    #[tokio::test]
    async fn panic_in_concurrent_phase_spares_siblings() {
        let log: Log = Arc::default();
        let registry = ProbeRegistry::new()
            .with(Arc::new(Scripted { panic: true, ..Scripted::new(ProbeKind::Xss, &log) }))
            .with(Arc::new(Scripted::new(ProbeKind::Sqli, &log)));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["xss", "sqli"]), Value::Null).await.unwrap();

        coordinator(store.clone(), registry, Duration::from_secs(60)).run_once().await.unwrap();
        assert_eq!(session_status(&store, run.id, "xss").await, SessionStatus::Failed);
        assert_eq!(session_status(&store, run.id, "sqli").await, SessionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_leaves_no_probe_behind() {
        let log: Log = Arc::default();
        let registry = ProbeRegistry::new()
            .with(Arc::new(Scripted { pause: Duration::from_secs(3600), ..Scripted::new(ProbeKind::Exposure, &log) }));
        let store = Arc::new(MemoryStore::new());
        let run = submit_run(store.as_ref(), "https://a.test", &strs(&["exposure"]), Value::Null).await.unwrap();

        let outcome = coordinator(store.clone(), registry, Duration::from_secs(30)).run_once().await.unwrap();
        assert_eq!(outcome, Some((run.id, RunStatus::Failed)));

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert_eq!(*log.lock().unwrap(), ["exposure:begin"]);
        assert_eq!(session_status(&store, run.id, "exposure").await, SessionStatus::Failed);
    }
}
