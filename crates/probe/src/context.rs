//! What a running probe sees: its identity, run configuration, shared
//! services, and the telemetry calls (events, progress, screenshots,
//! findings) that never fail the probe.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use base64::Engine;
use browser::BrowserPage;
use sentinel_core::*;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::services::ProbeServices;

/// A finding as a probe reports it; run and probe tags are added on write.
#[derive(Debug, Clone, PartialEq)]
pub struct FindingDraft {
    pub severity: Severity,
    pub title: String,
    pub evidence: String,
    pub recommendation: String,
    pub screenshots: Option<Vec<ScreenshotRef>>,
}

impl FindingDraft {
    pub fn new(severity: Severity, title: impl Into<String>, evidence: impl Into<String>, recommendation: impl Into<String>) -> Self {
        FindingDraft {
            severity,
            title: title.into(),
            evidence: evidence.into(),
            recommendation: recommendation.into(),
            screenshots: None,
        }
    }

    pub fn with_screenshots(mut self, shots: Vec<ScreenshotRef>) -> Self {
        if !shots.is_empty() {
            self.screenshots = Some(shots);
        }
        self
    }
}

/// Everything one probe execution needs: identity, target, run settings,
/// the store it reports into and the external collaborators.
pub struct ProbeContext {
    pub run_id: RunId,
    pub session_id: SessionId,
    pub kind: ProbeKind,
    pub target: String,
    pub config: RunConfig,
    pub store: Arc<dyn RecordStore>,
    pub services: Arc<ProbeServices>,
    pub cancel: CancellationToken,
    progress: AtomicU8,
}

impl ProbeContext {
    pub fn new(
        run_id: RunId,
        session_id: SessionId,
        kind: ProbeKind,
        target: impl Into<String>,
        configuration: &Value,
        store: Arc<dyn RecordStore>,
        services: Arc<ProbeServices>,
        cancel: CancellationToken,
    ) -> Self {
        ProbeContext {
            run_id,
            session_id,
            kind,
            target: target.into(),
            config: RunConfig::from_value(configuration),
            store,
            services,
            cancel,
            progress: AtomicU8::new(0),
        }
    }

    /// Best-effort append to the event log. A failed write is logged and
    /// reported as `None`; it never fails the probe.
    pub async fn emit_event(&self, level: EventLevel, message: impl Into<String>, data: Option<Value>) -> Option<EventId> {
        let event = NewEvent {
            run_id: self.run_id,
            probe_type: self.kind.as_str().to_string(),
            level,
            message: message.into(),
            data,
        };
        match self.store.append_event(&event).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(run_id = %self.run_id, probe = %self.kind, error = %e, message = %event.message, "event dropped");
                None
            }
        }
    }

    pub async fn emit(&self, level: EventLevel, message: impl Into<String>) -> Option<EventId> {
        self.emit_event(level, message, None).await
    }

    /// Persist a finding. When the store rejects an optional field it does
    /// not know, the write is retried once without that field.
    pub async fn report_finding(&self, draft: FindingDraft) -> Option<FindingId> {
        let finding = NewFinding {
            run_id: self.run_id,
            probe_type: self.kind.as_str().to_string(),
            severity: draft.severity,
            title: draft.title,
            evidence: draft.evidence,
            recommendation: draft.recommendation,
            screenshots: draft.screenshots,
        };
        match self.store.append_finding(&finding).await {
            Ok(id) => {
                info!(run_id = %self.run_id, probe = %self.kind, severity = %finding.severity, title = %finding.title, "finding reported");
                Some(id)
            }
            Err(StoreError::UnknownField { field, .. }) => {
                let Some(stripped) = finding.without_field(&field) else {
                    warn!(run_id = %self.run_id, probe = %self.kind, %field, "finding dropped: store rejected a required field");
                    return None;
                };
                match self.store.append_finding(&stripped).await {
                    Ok(id) => {
                        warn!(run_id = %self.run_id, probe = %self.kind, %field, "finding stored without field the schema lacks");
                        Some(id)
                    }
                    Err(e) => {
                        warn!(run_id = %self.run_id, probe = %self.kind, error = %e, "finding dropped after retry");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(run_id = %self.run_id, probe = %self.kind, error = %e, title = %finding.title, "finding dropped");
                None
            }
        }
    }

    /// Display hint; only increases are written.
    pub async fn update_progress(&self, percent: u8) {
        let percent = percent.min(100);
        if self.progress.fetch_max(percent, Ordering::SeqCst) >= percent {
            return;
        }
        if let Err(e) = self.store.set_session_progress(self.session_id, percent).await {
            debug!(session_id = %self.session_id, error = %e, "progress not recorded");
        }
    }

    /// True once the run's token is tripped or the session row was
    /// cancelled in the store. Trips the token in the latter case.
    pub async fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.store.get_session(self.session_id).await {
            Ok(Some(s)) if s.status == SessionStatus::Cancelled => {
                self.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub async fn open_page(&self) -> anyhow::Result<Box<dyn BrowserPage>> {
        Ok(self.services.browser.open_page(&self.services.page).await?)
    }

    /// Screenshot the page, publish it as a SCREENSHOT event and return a
    /// reference that can be attached to findings.
    pub async fn capture_screenshot(&self, page: &dyn BrowserPage, caption: &str) -> Option<ScreenshotRef> {
        let bytes = match page.screenshot().await {
            Ok(b) => b,
            Err(e) => {
                debug!(probe = %self.kind, error = %e, "screenshot failed");
                return None;
            }
        };
        let shot = ScreenshotRef {
            url: format!("data:image/png;base64,{}", base64::engine::general_purpose::STANDARD.encode(bytes)),
            caption: caption.to_string(),
            timestamp: now_rfc3339(),
        };
        self.emit_event(
            EventLevel::Screenshot,
            format!("Screenshot: {caption}"),
            Some(json!({ "image": shot.url, "caption": caption })),
        )
        .await;
        Some(shot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn ctx_with(store: Arc<dyn RecordStore>, run_id: RunId, session_id: SessionId) -> ProbeContext {
        ProbeContext::new(
            run_id,
            session_id,
            ProbeKind::Xss,
            "https://a.test",
            &Value::Null,
            store,
            Arc::new(ProbeServices::offline(reqwest::Client::new())),
            CancellationToken::new(),
        )
    }

    async fn seeded(store: &MemoryStore) -> (RunId, SessionId) {
        let run = store
            .insert_run(&NewRun { target_url: "https://a.test".into(), probes: vec!["xss".into()], configuration: Value::Null })
            .await
            .unwrap();
        let s = store.insert_sessions(run.id, &["xss".to_string()]).await.unwrap();
        (run.id, s[0].id)
    }

    fn shot() -> ScreenshotRef {
        ScreenshotRef { url: "data:image/png;base64,AA==".into(), caption: "c".into(), timestamp: now_rfc3339() }
    }

    #[tokio::test]
    async fn schema_drift_yields_exactly_one_stripped_record() {
        let store = Arc::new(MemoryStore::with_missing_finding_fields(&["screenshots"]));
        let (run_id, session_id) = seeded(&store).await;
        let ctx = ctx_with(store.clone(), run_id, session_id);

        let draft = FindingDraft::new(Severity::High, "XSS", "alert fired", "encode").with_screenshots(vec![shot()]);
        assert!(ctx.report_finding(draft).await.is_some());

        let stored = store.findings_for_run(run_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].screenshots, None);
        assert_eq!(stored[0].title, "XSS");
    }

    #[tokio::test]
    async fn screenshots_are_kept_when_schema_has_them() {
        let store = Arc::new(MemoryStore::new());
        let (run_id, session_id) = seeded(&store).await;
        let ctx = ctx_with(store.clone(), run_id, session_id);
        ctx.report_finding(FindingDraft::new(Severity::Low, "t", "e", "r").with_screenshots(vec![shot()])).await;
        assert_eq!(store.findings_for_run(run_id).await.unwrap()[0].screenshots.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_event_write_is_visible_but_harmless() {
        let store = Arc::new(MemoryStore::new());
        let (run_id, session_id) = seeded(&store).await;
        let ctx = ctx_with(store.clone(), run_id, session_id);
        store.fail_event_writes(true);
        assert!(ctx.emit(EventLevel::Info, "hello").await.is_none());
        store.fail_event_writes(false);
        assert!(ctx.emit(EventLevel::Info, "hello").await.is_some());
    }

    #[tokio::test]
    async fn progress_only_moves_forward() {
        let store = Arc::new(MemoryStore::new());
        let (run_id, session_id) = seeded(&store).await;
        let ctx = ctx_with(store.clone(), run_id, session_id);
        ctx.update_progress(40).await;
        ctx.update_progress(20).await;
        ctx.update_progress(250).await;
        assert_eq!(store.get_session(session_id).await.unwrap().unwrap().progress, 100);
        ctx.update_progress(60).await;
        assert_eq!(store.get_session(session_id).await.unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn store_cancellation_trips_token() {
        let store = Arc::new(MemoryStore::new());
        let (run_id, session_id) = seeded(&store).await;
        let ctx = ctx_with(store.clone(), run_id, session_id);
        assert!(!ctx.is_cancelled().await);
        store.cancel_run(run_id).await.unwrap();
        assert!(ctx.is_cancelled().await);
        assert!(ctx.cancel.is_cancelled());
    }
}
