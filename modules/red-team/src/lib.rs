//! Autonomous red-team exploration: a completion service picks the next
//! browser action from a page snapshot until it finishes or runs out of steps.

mod decision;
mod engine;
mod observe;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use browser::WaitPolicy;
use completion::{CompletionRequest, CompletionService};
use probe::{Probe, ProbeContext};
use sentinel_core::{EventLevel, ProbeKind};
use serde_json::json;
use tracing::{debug, info};

pub use decision::{Decision, DecodeError, ReportedFinding, Tool};
pub use engine::{Decider, Explorer, ExplorerOptions, HistoryEntry, Outcome, Termination};
pub use observe::{observe, Observation, ObservedElement};

/// Upper bound on the per-run step budget.
pub const MAX_STEPS_CAP: usize = 50;

const PERSONA: &str = "You are an expert penetration tester exploring a web application you are authorized to test. \
                       You think step by step and answer with a single JSON object.";

const TOOLS: &str = r#"Available tools:
- click: {"element_index": <int>}
- type: {"element_index": <int>, "text": "<string>"} (submits with Enter)
- navigate: {"url": "<absolute or relative url>"}
- report: {"severity": "LOW|MEDIUM|HIGH|CRITICAL", "title": "<string>", "evidence": "<string>"}
- finish: {"reason": "<string>"}

Answer format:
{"thought": "<reasoning>", "tool": "<tool>", "args": {...}, "finding": null | {"severity": "...", "title": "...", "evidence": "..."}}"#;

/// Decides through a completion service.
pub struct CompletionDecider {
    service: Arc<dyn CompletionService>,
    instructions: Option<String>,
}

impl CompletionDecider {
    pub fn new(service: Arc<dyn CompletionService>, instructions: Option<String>) -> Self {
        CompletionDecider { service, instructions }
    }

    pub fn prompt(&self, obs: &Observation, history: &[HistoryEntry]) -> String {
        let history = serde_json::to_string_pretty(history).unwrap_or_else(|_| "[]".into());
        let mut prompt = format!(
            "Goal: find security vulnerabilities such as injection, broken access control, exposed data or logic flaws.\n\n\
             Current page:\n{}\nRecent steps:\n{history}\n\n{TOOLS}\n",
            obs.render()
        );
        if let Some(extra) = self.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str(&format!("\nOperator instructions:\n{extra}\n"));
        }
        prompt.push_str("\nUse recent signals (console errors, failed responses, dialogs) to judge what your last action did.");
        prompt
    }
}

#[async_trait]
impl Decider for CompletionDecider {
    async fn decide(&self, obs: &Observation, history: &[HistoryEntry]) -> Result<Decision, DecodeError> {
        let request = CompletionRequest::json(self.prompt(obs, history)).with_system(PERSONA);
        let raw = self.service.complete(&request).await?;
        Decision::decode(&raw)
    }
}

#[derive(Default)]
pub struct RedTeamProbe {
    pub options: ExplorerOptions,
}

impl RedTeamProbe {
    fn options_for(&self, ctx: &ProbeContext) -> ExplorerOptions {
        let steps = ctx.config.max_steps.unwrap_or(ctx.services.max_exploration_steps);
        ExplorerOptions { max_steps: steps.clamp(1, MAX_STEPS_CAP), ..self.options.clone() }
    }
}

#[async_trait]
impl Probe for RedTeamProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::RedTeam
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        let opts = self.options_for(ctx);
        ctx.emit(EventLevel::Info, format!("Starting autonomous exploration of {} ({} steps)", ctx.target, opts.max_steps)).await;
        let page = ctx.open_page().await?;
        probe::login(ctx, page.as_ref()).await;

        let outcome = match page.goto(&ctx.target, WaitPolicy::NetworkIdle).await.context("initial navigation") {
            Ok(()) => {
                let decider = CompletionDecider::new(ctx.services.completion.clone(), ctx.config.instructions.clone());
                Ok(Explorer::new(ctx, page.as_ref(), &decider, opts).run().await)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = page.close().await {
            debug!(error = %e, "page close failed");
        }
        let outcome = outcome?;

        info!(run_id = %ctx.run_id, session_id = %ctx.session_id, acts = outcome.acts, "red team finished");
        let reason = match &outcome.termination {
            Termination::Finished(r) => format!("finished: {r}"),
            Termination::BudgetExhausted => "step budget exhausted".into(),
            Termination::DecisionError(e) => format!("decision error: {e}"),
            Termination::DriverError(e) => format!("browser error: {e}"),
            Termination::Cancelled => "cancelled".into(),
        };
        ctx.emit_event(
            EventLevel::Info,
            format!("Exploration ended after {} actions ({reason})", outcome.acts),
            Some(json!({ "acts": outcome.acts, "findings": outcome.findings })),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use browser::fake::{FakeBrowser, FakePage};
    use browser::INTERACTIVE_SELECTOR;
    use completion::CompletionError;
    use probe::{run_probe, ProbeServices};
    use sentinel_core::*;
    use serde_json::Value;
    use std::sync::Mutex;

    struct Canned {
        answers: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(answers: &[&str]) -> Arc<Self> {
            Arc::new(Canned { answers: Mutex::new(answers.iter().rev().map(|s| s.to_string()).collect()), prompts: Mutex::default() })
        }
    }

    #[async_trait]
    impl CompletionService for Canned {
        async fn complete(&self, req: &CompletionRequest) -> Result<String, CompletionError> {
            self.prompts.lock().unwrap().push(req.prompt.clone());
            self.answers.lock().unwrap().pop().ok_or(CompletionError::Empty)
        }
    }

    async fn run_with(config: Value, canned: Arc<Canned>, page: FakePage) -> (Arc<MemoryStore>, RunId, SessionStatus) {
        let store = Arc::new(MemoryStore::new());
        let run = store
            .insert_run(&NewRun { target_url: "https://a.test/".into(), probes: vec!["red_team".into()], configuration: config.clone() })
            .await
            .unwrap();
        let s = store.insert_sessions(run.id, &["red_team".to_string()]).await.unwrap();
        let mut services = ProbeServices::offline(reqwest::Client::new());
        services.browser = Arc::new(FakeBrowser { page });
        services.completion = canned;
        let ctx = ProbeContext::new(run.id, s[0].id, ProbeKind::RedTeam, "https://a.test/", &config, store.clone(), Arc::new(services), CancellationToken::new());
        let status = run_probe(&RedTeamProbe::default(), &ctx).await;
        (store, run.id, status)
    }

    #[tokio::test]
    async fn instructions_reach_the_prompt() {
        let canned = Canned::new(&[r#"{"thought": "look around", "tool": "finish", "args": {"reason": "static page"}}"#]);
        let (store, run_id, status) =
            run_with(json!({"instructions": "Focus on the coupon form"}), canned.clone(), FakePage::new("about:blank")).await;
        assert_eq!(status, SessionStatus::Completed);
        let prompts = canned.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Focus on the coupon form"));
        assert!(prompts[0].contains("URL: https://a.test/"));
        let events = store.events_for_run(run_id).await.unwrap();
        assert!(events.iter().any(|e| e.message == "THINK: look around"));
    }

    #[tokio::test]
    async fn run_configuration_sets_the_budget() {
        let click = r#"{"tool": "click", "args": {"element_index": 0}}"#;
        let canned = Canned::new(&[click; 5]);
        let page = FakePage::new("about:blank").elements(INTERACTIVE_SELECTOR, 1);
        let (_, _, status) = run_with(json!({"max_steps": 3}), canned.clone(), page.clone()).await;
        assert_eq!(status, SessionStatus::Completed);
        assert_eq!(page.count("click"), 3);
        assert_eq!(canned.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn silent_service_ends_exploration_without_failing() {
        let (store, run_id, status) = run_with(Value::Null, Canned::new(&[]), FakePage::new("about:blank")).await;
        assert_eq!(status, SessionStatus::Completed);
        let events = store.events_for_run(run_id).await.unwrap();
        assert!(events.iter().any(|e| e.level == EventLevel::Error && e.message.starts_with("Decision failed")));
    }

    #[tokio::test]
    async fn unreachable_target_fails_the_session() {
        let page = FakePage::new("about:blank").fail_after(0);
        let (_, _, status) = run_with(Value::Null, Canned::new(&[]), page).await;
        assert_eq!(status, SessionStatus::Failed);
    }
}
