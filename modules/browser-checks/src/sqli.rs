use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use browser::{BrowserPage, DriverError, Key, WaitPolicy};
use probe::{FindingDraft, Probe, ProbeContext};
use sentinel_core::{EventLevel, ProbeKind, Severity};
use tracing::debug;

use crate::{close, fuzzed_urls, open_authenticated, TEXT_INPUTS};

const PAYLOADS: [&str; 5] = ["'", "\"", "1' OR '1'='1", "1\" OR \"1\"=\"1", "') OR ('1'='1"];

const SQL_ERRORS: &[&str] = &[
    "sql syntax",
    "mysql_fetch",
    "ora-",
    "sqlite3.operationalerror",
    "postgresql query failed",
    "microsoft ole db provider for sql server",
    "unclosed quotation mark",
    "jdbc driver",
    "system.data.sqlclient.sqlexception",
    "dynamic sql error",
    "valid postgresql result",
    "pg_query",
    "db2 sql error",
];

const MAX_INPUTS: usize = 5;
const SETTLE: Duration = Duration::from_secs(2);

/// First database error signature found in `content`, if any.
pub fn sql_error_signature(content: &str) -> Option<&'static str> {
    let lower = content.to_lowercase();
    SQL_ERRORS.iter().copied().find(|sig| lower.contains(sig))
}

/// Error-based SQL injection probe over query parameters and text inputs.
pub struct SqliProbe;

impl SqliProbe {
    async fn scan(&self, ctx: &ProbeContext, page: &dyn BrowserPage) -> Result<()> {
        let params = fuzzed_urls(&ctx.target, PAYLOADS[0]);
        if !params.is_empty() {
            ctx.emit(EventLevel::Info, format!("Fuzzing {} URL parameters for SQL errors...", params.len())).await;
        }
        for (param, _) in &params {
            for payload in PAYLOADS {
                if ctx.is_cancelled().await {
                    return Ok(());
                }
                let Some((_, url)) = fuzzed_urls(&ctx.target, payload).into_iter().find(|(p, _)| p == param) else { continue };
                page.goto(&url, WaitPolicy::Load).await?;
                if let Some(sig) = sql_error_signature(&page.content().await?) {
                    let shot = ctx.capture_screenshot(page, &format!("SQLi Error in Param: {param}")).await;
                    ctx.report_finding(
                        FindingDraft::new(
                            Severity::Critical,
                            "SQL Injection Detected (Error-Based)",
                            format!("SQL error signature `{sig}` found in response after injecting `{payload}` into `{param}`.\nURL: {url}"),
                            "Use parameterized queries for all database interactions. Never concatenate user input into SQL strings.",
                        )
                        .with_screenshots(shot.into_iter().collect()),
                    )
                    .await;
                    ctx.emit(EventLevel::Success, "SQLi vulnerability confirmed.").await;
                    break;
                }
            }
        }
        ctx.update_progress(40).await;

        page.goto(&ctx.target, WaitPolicy::NetworkIdle).await?;
        let inputs = page.query_all(TEXT_INPUTS).await?.len().min(MAX_INPUTS);
        if inputs > 0 {
            ctx.emit(EventLevel::Info, format!("Testing {inputs} form inputs for SQLi...")).await;
        }
        for i in 0..inputs {
            for payload in PAYLOADS {
                if ctx.is_cancelled().await {
                    return Ok(());
                }
                match self.try_input(page, &ctx.target, i, payload).await {
                    Ok(Some(sig)) => {
                        let shot = ctx.capture_screenshot(page, &format!("SQLi Error: input #{i}")).await;
                        ctx.report_finding(
                            FindingDraft::new(
                                Severity::Critical,
                                "SQL Injection Detected in Form",
                                format!("SQL error signature `{sig}` found after injecting `{payload}` into form input #{i} on {}.", ctx.target),
                                "Ensure all backend queries use database abstractions that handle parameterization automatically.",
                            )
                            .with_screenshots(shot.into_iter().collect()),
                        )
                        .await;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => debug!(input = i, error = %e, "input injection skipped"),
                }
            }
            ctx.update_progress(40 + ((i + 1) * 50 / inputs) as u8).await;
        }
        ctx.emit(EventLevel::Success, "SQLi scan finished.").await;
        Ok(())
    }

    /// Reload, fill input `i` with `payload`, submit, and look for an error.
    async fn try_input(&self, page: &dyn BrowserPage, target: &str, i: usize, payload: &str) -> Result<Option<&'static str>, DriverError> {
        page.goto(target, WaitPolicy::DomContentLoaded).await?;
        let Some(input) = page.query_all(TEXT_INPUTS).await?.into_iter().nth(i) else { return Ok(None) };
        page.fill(&input, payload).await?;
        page.press(&input, Key::Enter).await?;
        page.wait_for_settle(SETTLE).await?;
        Ok(sql_error_signature(&page.content().await?))
    }
}

#[async_trait]
impl Probe for SqliProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Sqli
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        ctx.emit(EventLevel::Info, format!("Starting SQLi hunter on {}", ctx.target)).await;
        let page = open_authenticated(ctx).await?;
        let result = self.scan(ctx, page.as_ref()).await;
        close(page).await;
        result
    }
}
