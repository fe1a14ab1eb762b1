use anyhow::Result;
use async_trait::async_trait;
use browser::{BrowserPage, WaitPolicy};
use probe::{FindingDraft, Probe, ProbeContext};
use sentinel_core::{EventLevel, ProbeKind, Severity};

use crate::{close, open_authenticated};

const HAS_CSRF_TOKEN: &str = "return Array.from(arguments[0].querySelectorAll(\"input[type='hidden']\"))\
    .some(i => /csrf|token/i.test(i.name || ''));";

/// Visual capture of the landing page plus a CSRF-token heuristic on its forms.
pub struct ExposureProbe;

impl ExposureProbe {
    async fn scan(&self, ctx: &ProbeContext, page: &dyn BrowserPage) -> Result<()> {
        page.goto(&ctx.target, WaitPolicy::Load).await?;
        ctx.emit(EventLevel::Info, format!("Navigated to {}", ctx.target)).await;
        ctx.update_progress(30).await;
        let title = page.title().await.unwrap_or_default();
        ctx.emit(EventLevel::Info, format!("Page Title: {title}")).await;

        let shot = ctx.capture_screenshot(page, "Exposure Scan").await;
        ctx.update_progress(50).await;

        let forms = page.query_all("form").await?;
        if !forms.is_empty() {
            ctx.emit(EventLevel::Info, format!("Found {} forms. Analyzing for CSRF protection...", forms.len())).await;
        }
        for form in &forms {
            let protected = page.evaluate_on(form, HAS_CSRF_TOKEN).await?.as_bool().unwrap_or(true);
            if !protected {
                let draft = FindingDraft::new(
                    Severity::Low,
                    "Potential Missing CSRF Protection",
                    format!("Form at {} appears to lack a hidden CSRF token field.", ctx.target),
                    "Ensure all state-changing forms implement anti-CSRF tokens, or that header-based protection is enforced on the backend.",
                )
                .with_screenshots(shot.clone().into_iter().collect());
                ctx.report_finding(draft).await;
                // once per page
                break;
            }
        }
        ctx.update_progress(90).await;
        ctx.emit(EventLevel::Success, "Exposure scan completed.").await;
        Ok(())
    }
}

#[async_trait]
impl Probe for ExposureProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Exposure
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        ctx.emit(EventLevel::Info, format!("Starting Exposure Scan on {}", ctx.target)).await;
        let page = open_authenticated(ctx).await?;
        let result = self.scan(ctx, page.as_ref()).await;
        close(page).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use browser::fake::FakePage;
    use probe::run_probe;
    use sentinel_core::*;
    use serde_json::json;

    #[tokio::test]
    async fn unprotected_forms_report_once() {
        let page = FakePage::new("about:blank").title("Shop").elements("form", 3).script("csrf|token", json!(false));
        let (store, ctx) = context(ProbeKind::Exposure, "https://a.test", &page).await;
        assert_eq!(run_probe(&ExposureProbe, &ctx).await, SessionStatus::Completed);

        let findings = store.findings_for_run(ctx.run_id).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[0].screenshots.as_ref().map(Vec::len), Some(1));
        let events = store.events_for_run(ctx.run_id).await.unwrap();
        assert!(events.iter().any(|e| e.level == EventLevel::Screenshot));
        assert_eq!(page.log().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn protected_forms_are_quiet() {
        let page = FakePage::new("about:blank").elements("form", 1).script("csrf|token", json!(true));
        let (store, ctx) = context(ProbeKind::Exposure, "https://a.test", &page).await;
        run_probe(&ExposureProbe, &ctx).await;
        assert!(store.findings_for_run(ctx.run_id).await.unwrap().is_empty());
    }
}
