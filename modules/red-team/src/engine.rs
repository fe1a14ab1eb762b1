//! Bounded observe, decide, act loop over one browser page.

use std::time::Duration;

use async_trait::async_trait;
use browser::{BrowserPage, DriverError, Key, PageSignal, WaitPolicy, INTERACTIVE_SELECTOR};
use probe::{FindingDraft, ProbeContext};
use sentinel_core::{EventLevel, ScreenshotRef};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::decision::{Decision, DecodeError, ReportedFinding, Tool};
use crate::observe::{observe, Observation};

/// One completed step as remembered by the decision step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub step: usize,
    pub url: String,
    pub thought: String,
    pub action: String,
    pub outcome: String,
}

#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, obs: &Observation, history: &[HistoryEntry]) -> Result<Decision, DecodeError>;
}

#[derive(Debug, Clone)]
pub struct ExplorerOptions {
    pub max_steps: usize,
    pub max_elements: usize,
    pub history_window: usize,
    /// Capture a screenshot on every n-th step.
    pub screenshot_every: usize,
    /// Steps a passive signal stays in the observation.
    pub signal_window: usize,
    pub settle: Duration,
}

impl Default for ExplorerOptions {
    fn default() -> Self {
        ExplorerOptions {
            max_steps: 10,
            max_elements: 30,
            history_window: 3,
            screenshot_every: 2,
            signal_window: 3,
            settle: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Finished(String),
    BudgetExhausted,
    DecisionError(String),
    DriverError(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Act steps performed against the browser.
    pub acts: usize,
    pub findings: usize,
    pub termination: Termination,
}

pub struct Explorer<'a> {
    ctx: &'a ProbeContext,
    page: &'a dyn BrowserPage,
    decider: &'a dyn Decider,
    opts: ExplorerOptions,
}

impl<'a> Explorer<'a> {
    pub fn new(ctx: &'a ProbeContext, page: &'a dyn BrowserPage, decider: &'a dyn Decider, opts: ExplorerOptions) -> Self {
        Explorer { ctx, page, decider, opts }
    }

    pub async fn run(&self) -> Outcome {
        let ctx = self.ctx;
        let max_steps = self.opts.max_steps.max(1);
        let mut history: Vec<HistoryEntry> = Vec::new();
        let mut signals: Vec<(usize, PageSignal)> = Vec::new();
        let mut shots: Vec<ScreenshotRef> = Vec::new();
        let mut acts = 0;
        let mut findings = 0;
        let mut termination = Termination::BudgetExhausted;

        for step in 0..max_steps {
            ctx.update_progress((step * 100 / max_steps) as u8).await;
            if ctx.is_cancelled().await {
                termination = Termination::Cancelled;
                break;
            }

            // observe
            let mut obs = match observe(self.page, self.opts.max_elements).await {
                Ok(o) => o,
                Err(e) if e.is_fatal() => {
                    termination = Termination::DriverError(e.to_string());
                    break;
                }
                Err(e) => {
                    debug!(step, error = %e, "partial observation");
                    Observation::default()
                }
            };
            if ctx.is_cancelled().await {
                termination = Termination::Cancelled;
                break;
            }
            signals.extend(self.page.drain_signals().await.into_iter().map(|s| (step, s)));
            signals.retain(|(at, _)| at + self.opts.signal_window > step);
            obs.signals = signals.iter().map(|(_, s)| s.clone()).collect();

            // decide
            let decision = match self.decider.decide(&obs, &history).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(run_id = %ctx.run_id, step, error = %e, "decision failed; finishing");
                    ctx.emit(EventLevel::Error, format!("Decision failed: {e}")).await;
                    self.capture(&mut shots, "Final state").await;
                    termination = Termination::DecisionError(e.to_string());
                    break;
                }
            };
            if !decision.thought.is_empty() {
                ctx.emit(EventLevel::Info, format!("THINK: {}", decision.thought)).await;
            }
            // the decision may have taken long enough for the run to be cancelled
            if ctx.is_cancelled().await {
                termination = Termination::Cancelled;
                break;
            }

            // act
            let mut captured = false;
            let outcome = match &decision.tool {
                Tool::Finish { reason } => {
                    ctx.emit(EventLevel::Success, format!("Exploration complete: {reason}")).await;
                    self.capture(&mut shots, "Finish").await;
                    if let Some(f) = &decision.finding {
                        self.report(f, &shots).await;
                        findings += 1;
                    }
                    termination = Termination::Finished(reason.clone());
                    break;
                }
                Tool::Report(f) => {
                    captured = self.capture(&mut shots, &f.title).await;
                    self.report(f, &shots).await;
                    findings += 1;
                    format!("reported {}", f.title)
                }
                tool => {
                    let label = decision.description.clone().unwrap_or_else(|| tool.name().to_string());
                    ctx.emit(EventLevel::Info, format!("ACT: {label}")).await;
                    acts += 1;
                    match self.act(tool).await {
                        Ok(done) => done,
                        Err(e) if e.is_fatal() => {
                            warn!(run_id = %ctx.run_id, step, error = %e, "browser lost; finishing");
                            ctx.emit(EventLevel::Error, format!("Browser driver failed: {e}")).await;
                            termination = Termination::DriverError(e.to_string());
                            break;
                        }
                        Err(e) => {
                            ctx.emit(EventLevel::Warning, format!("Tool execution failed: {e}")).await;
                            format!("failed: {e}")
                        }
                    }
                }
            };

            if let Some(f) = &decision.finding {
                if !captured {
                    captured = self.capture(&mut shots, &f.title).await;
                }
                self.report(f, &shots).await;
                findings += 1;
            }
            if !captured && (step + 1) % self.opts.screenshot_every.max(1) == 0 {
                self.capture(&mut shots, &format!("Step {}", step + 1)).await;
            }

            history.push(HistoryEntry {
                step: step + 1,
                url: obs.url.clone(),
                thought: decision.thought.clone(),
                action: describe(&decision.tool),
                outcome,
            });
            if history.len() > self.opts.history_window {
                history.remove(0);
            }
        }

        info!(run_id = %ctx.run_id, acts, findings, termination = ?termination, "exploration ended");
        Outcome { acts, findings, termination }
    }

    /// Browser side of a decision; returns what happened for the history.
    async fn act(&self, tool: &Tool) -> Result<String, DriverError> {
        match tool {
            Tool::Click { index } => {
                let els = self.page.query_all(INTERACTIVE_SELECTOR).await?;
                let Some(el) = els.get(*index) else {
                    return Ok(format!("element {index} no longer present"));
                };
                self.page.click(el).await?;
                self.settle().await?;
                Ok(format!("clicked element {index}"))
            }
            Tool::Type { index, text } => {
                let els = self.page.query_all(INTERACTIVE_SELECTOR).await?;
                let Some(el) = els.get(*index) else {
                    return Ok(format!("element {index} no longer present"));
                };
                self.page.fill(el, text).await?;
                self.page.press(el, Key::Enter).await?;
                self.settle().await?;
                Ok(format!("typed into element {index} and submitted"))
            }
            Tool::Navigate { url } => {
                let current = self.page.current_url().await?;
                let dest = match resolve(&current, url) {
                    Ok(dest) => dest,
                    Err(e) => {
                        self.ctx.emit(EventLevel::Warning, format!("Tool execution failed: cannot resolve {url}: {e}")).await;
                        return Ok(format!("failed: cannot resolve {url}"));
                    }
                };
                self.page.goto(dest.as_str(), WaitPolicy::DomContentLoaded).await?;
                self.settle().await?;
                Ok(format!("navigated to {dest}"))
            }
            Tool::Report(_) | Tool::Finish { .. } => Ok("not a browser action".into()),
        }
    }

    /// Best-effort wait; only a lost session is worth surfacing. A cancelled
    /// run cuts the wait short and the next step notices.
    async fn settle(&self) -> Result<(), DriverError> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => Ok(()),
            settled = self.page.wait_for_settle(self.opts.settle) => match settled {
                Err(e) if e.is_fatal() => Err(e),
                _ => Ok(()),
            },
        }
    }

    async fn capture(&self, shots: &mut Vec<ScreenshotRef>, caption: &str) -> bool {
        match self.ctx.capture_screenshot(self.page, caption).await {
            Some(s) => {
                shots.push(s);
                true
            }
            None => false,
        }
    }

    async fn report(&self, f: &ReportedFinding, shots: &[ScreenshotRef]) {
        self.ctx
            .emit_event(EventLevel::Warning, format!("Finding: {}", f.title), Some(json!({ "severity": f.severity })))
            .await;
        let draft = FindingDraft::new(f.severity, f.title.clone(), f.evidence.clone(), "Review automated red team findings.")
            .with_screenshots(shots.to_vec());
        self.ctx.report_finding(draft).await;
    }
}

fn describe(tool: &Tool) -> String {
    match tool {
        Tool::Click { index } => format!("click({index})"),
        Tool::Type { index, text } => format!("type({index}, {text:?})"),
        Tool::Navigate { url } => format!("navigate({url})"),
        Tool::Report(f) => format!("report({})", f.title),
        Tool::Finish { reason } => format!("finish({reason})"),
    }
}

/// Relative navigation targets are joined onto the current address.
fn resolve(current: &str, target: &str) -> Result<Url, url::ParseError> {
    match Url::parse(current) {
        Ok(base) => base.join(target),
        Err(_) => Url::parse(target),
    }
}
