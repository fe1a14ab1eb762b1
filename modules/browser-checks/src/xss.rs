use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use browser::{BrowserPage, DriverError, Key, PageSignal, WaitPolicy};
use probe::{FindingDraft, Probe, ProbeContext};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sentinel_core::{EventLevel, ProbeKind, Severity};
use tracing::debug;

use crate::{close, fuzzed_urls, open_authenticated, TEXT_INPUTS};

const SETTLE: Duration = Duration::from_millis(1500);

/// Unique marker carried by an injected `alert()`, so unrelated dialogs
/// raised by the site are not mistaken for execution.
pub fn canary() -> String {
    let tail: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .filter(|c| c.is_ascii_alphabetic())
        .take(6)
        .map(char::from)
        .collect();
    format!("Sent{tail}")
}

fn payload(canary: &str) -> String {
    format!("<script>alert('{canary}')</script>")
}

/// Dialog raised since the last drain that carries `canary`.
async fn fired(page: &dyn BrowserPage, canary: &str) -> Option<String> {
    page.drain_signals().await.into_iter().find_map(|s| match s {
        PageSignal::Dialog { message, .. } if message.contains(canary) => Some(message),
        _ => None,
    })
}

/// Reflected XSS probe: canary alerts through query parameters and inputs.
pub struct XssProbe;

impl XssProbe {
    async fn scan(&self, ctx: &ProbeContext, page: &dyn BrowserPage) -> Result<()> {
        let params = fuzzed_urls(&ctx.target, "");
        if !params.is_empty() {
            ctx.emit(EventLevel::Info, format!("Testing {} URL parameters for reflected XSS...", params.len())).await;
        }
        for (param, _) in &params {
            if ctx.is_cancelled().await {
                return Ok(());
            }
            let canary = canary();
            let payload = payload(&canary);
            let Some((_, url)) = fuzzed_urls(&ctx.target, &payload).into_iter().find(|(p, _)| p == param) else { continue };
            page.drain_signals().await;
            page.goto(&url, WaitPolicy::Load).await?;
            page.wait_for_settle(SETTLE).await?;
            if let Some(message) = fired(page, &canary).await {
                ctx.emit(EventLevel::Success, format!("XSS confirmed: alert dialog triggered with message: {message}")).await;
                let shot = ctx.capture_screenshot(page, &format!("XSS Found in Param: {param}")).await;
                ctx.report_finding(
                    FindingDraft::new(
                        Severity::High,
                        "Reflected XSS in URL Parameter",
                        format!("Vulnerability found in `{param}` parameter.\nURL: {url}\nPayload: {payload}"),
                        "Sanitize all user input, prefer innerText over innerHTML, and deploy a strict CSP.",
                    )
                    .with_screenshots(shot.into_iter().collect()),
                )
                .await;
            }
        }
        ctx.update_progress(50).await;

        page.goto(&ctx.target, WaitPolicy::Load).await?;
        let inputs = page.query_all(TEXT_INPUTS).await?.len();
        if inputs > 0 {
            ctx.emit(EventLevel::Info, format!("Found {inputs} input fields. Testing for XSS...")).await;
        }
        for i in 0..inputs {
            if ctx.is_cancelled().await {
                return Ok(());
            }
            let canary = canary();
            let payload = payload(&canary);
            match self.try_input(page, &ctx.target, i, &payload, &canary).await {
                Ok(Some(message)) => {
                    ctx.emit(EventLevel::Success, format!("XSS confirmed: alert dialog triggered with message: {message}")).await;
                    let shot = ctx.capture_screenshot(page, &format!("XSS Found in Form Input {i}")).await;
                    ctx.report_finding(
                        FindingDraft::new(
                            Severity::High,
                            "Stored or Reflected XSS in Form",
                            format!("Vulnerability found in form input field #{i}.\nPayload: {payload}"),
                            "Apply context-aware output encoding and use frameworks that auto-escape data.",
                        )
                        .with_screenshots(shot.into_iter().collect()),
                    )
                    .await;
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => debug!(input = i, error = %e, "input injection skipped"),
            }
            ctx.update_progress(50 + ((i + 1) * 45 / inputs) as u8).await;
        }
        ctx.emit(EventLevel::Success, "XSS scan completed.").await;
        Ok(())
    }

    async fn try_input(&self, page: &dyn BrowserPage, target: &str, i: usize, payload: &str, canary: &str) -> Result<Option<String>, DriverError> {
        page.goto(target, WaitPolicy::DomContentLoaded).await?;
        let Some(input) = page.query_all(TEXT_INPUTS).await?.into_iter().nth(i) else { return Ok(None) };
        page.drain_signals().await;
        page.fill(&input, payload).await?;
        page.press(&input, Key::Enter).await?;
        page.wait_for_settle(SETTLE).await?;
        Ok(fired(page, canary).await)
    }
}

#[async_trait]
impl Probe for XssProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Xss
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        ctx.emit(EventLevel::Info, format!("Starting XSS auditor on {}", ctx.target)).await;
        let page = open_authenticated(ctx).await?;
        let result = self.scan(ctx, page.as_ref()).await;
        close(page).await;
        result
    }
}
