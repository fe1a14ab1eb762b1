//! Page-content review by the completion service: business logic flaws,
//! leaked secrets and debug output a pattern matcher would miss.

use anyhow::{Context, Result};
use async_trait::async_trait;
use browser::{inner_text, WaitPolicy};
use completion::{decode_json, CompletionRequest};
use probe::{FindingDraft, Probe, ProbeContext};
use sentinel_core::{EventLevel, ProbeKind, Severity};
use serde::Deserialize;
use tracing::info;

/// Characters of page text sent for review.
pub const MAX_CONTENT_CHARS: usize = 10_000;

const SYSTEM: &str = "You are a professional security auditor focusing on high-signal findings.";

#[derive(Debug, Deserialize)]
pub struct Review {
    #[serde(default)]
    pub findings: Vec<ReviewItem>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewItem {
    #[serde(default)]
    pub severity: String,
    pub title: String,
    #[serde(default)]
    pub evidence: String,
    pub justification: Option<String>,
    #[serde(default)]
    pub recommendation: String,
}

impl ReviewItem {
    fn into_draft(self) -> FindingDraft {
        let evidence = match self.justification {
            Some(j) if !j.trim().is_empty() => format!("Justification: {j}\n\nEvidence: {}", self.evidence),
            _ => self.evidence,
        };
        FindingDraft::new(Severity::parse_lossy(&self.severity), self.title, evidence, self.recommendation)
    }
}

pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn review_prompt(target: &str, content: &str) -> String {
    format!(
        "Assess the web page at {target} for actionable security issues with high precision.\n\n\
         Look for:\n\
         1. Business logic and authorization flaws: admin links visible to anonymous users, \
         price or payment manipulation, debug features exposed in production.\n\
         2. Sensitive data exposure: cloud access keys (AKIA...), secret API keys (sk_live...), private keys, \
         personal data in debug output. Publishable keys, analytics ids and map keys are public by design; ignore them.\n\
         3. Information leakage: stack traces, developer comments about security, internal hostnames.\n\n\
         Do not report ordinary login or registration forms, expected dashboard links or public support contacts. \
         Use HIGH or CRITICAL only with clear evidence of an exploitable issue.\n\n\
         Page content (truncated):\n{content}\n\n\
         Answer with one JSON object: {{\"findings\": [{{\"severity\": \"LOW|MEDIUM|HIGH|CRITICAL\", \"title\": \"...\", \
         \"evidence\": \"...\", \"justification\": \"...\", \"recommendation\": \"...\"}}]}}. \
         Return an empty list when nothing qualifies."
    )
}

pub struct LlmAnalysisProbe;

#[async_trait]
impl Probe for LlmAnalysisProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::LlmAnalysis
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        ctx.emit(EventLevel::Info, "Starting LLM logic & PII analysis...").await;
        let page = ctx.open_page().await?;
        probe::login(ctx, page.as_ref()).await;
        ctx.update_progress(10).await;

        let text = async {
            page.goto(&ctx.target, WaitPolicy::Load).await?;
            inner_text(page.as_ref(), "body").await
        }
        .await;
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "page close failed");
        }
        let text = text.context("extract page text")?;
        let content = truncate_chars(&text, MAX_CONTENT_CHARS);

        ctx.emit(EventLevel::Info, "Page content extracted. Sending for review...").await;
        ctx.update_progress(40).await;
        let request = CompletionRequest::json(review_prompt(&ctx.target, content)).with_system(SYSTEM);
        let raw = ctx.services.completion.complete(&request).await.context("completion request")?;
        let review: Review = decode_json(&raw).context("decode review")?;

        info!(run_id = %ctx.run_id, findings = review.findings.len(), "content review returned");
        ctx.emit(EventLevel::Info, format!("LLM analysis complete. Found {} high-signal issues.", review.findings.len())).await;
        ctx.update_progress(80).await;
        for item in review.findings {
            ctx.report_finding(item.into_draft()).await;
        }
        ctx.emit(EventLevel::Success, "LLM analysis finished.").await;
        Ok(())
    }
}
