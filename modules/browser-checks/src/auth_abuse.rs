use anyhow::Result;
use async_trait::async_trait;
use browser::{BrowserPage, WaitPolicy};
use probe::{FindingDraft, Probe, ProbeContext};
use sentinel_core::{EventLevel, ProbeKind, Severity};

use crate::{close, open_authenticated};

/// Non-intrusive look for login surfaces; never submits credentials.
pub struct AuthAbuseProbe;

impl AuthAbuseProbe {
    async fn scan(&self, ctx: &ProbeContext, page: &dyn BrowserPage) -> Result<()> {
        page.goto(&ctx.target, WaitPolicy::Load).await?;
        ctx.emit(EventLevel::Info, format!("Scanning {} for login forms...", ctx.target)).await;
        ctx.update_progress(10).await;

        let password_inputs = page.query_all("input[type='password']").await?;
        if password_inputs.is_empty() {
            ctx.emit(EventLevel::Info, "No login forms detected. Skipping auth checks.").await;
            return Ok(());
        }
        ctx.update_progress(30).await;
        ctx.emit(EventLevel::Info, format!("Found login form with {} password fields.", password_inputs.len())).await;
        ctx.report_finding(FindingDraft::new(
            Severity::Info,
            "Login Form Detected",
            format!("Login form with password fields found at {}", ctx.target),
            "Ensure the login endpoint implements rate limiting, brute-force protection and multi-factor authentication.",
        ))
        .await;
        ctx.update_progress(80).await;
        ctx.emit(EventLevel::Success, "Auth abuse scan completed.").await;
        Ok(())
    }
}

#[async_trait]
impl Probe for AuthAbuseProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::AuthAbuse
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        ctx.emit(EventLevel::Info, "Starting Auth Abuse analysis.").await;
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

    #[tokio::test]
    async fn password_field_yields_info_finding() {
        let page = FakePage::new("about:blank").elements("input[type='password']", 1);
        let (store, ctx) = context(ProbeKind::AuthAbuse, "https://a.test/login", &page).await;
        assert_eq!(run_probe(&AuthAbuseProbe, &ctx).await, SessionStatus::Completed);
        let findings = store.findings_for_run(ctx.run_id).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "Login Form Detected");
        assert_eq!(findings[0].severity, Severity::Info);
    }

    #[tokio::test]
    async fn lost_browser_fails_the_session() {
        let page = FakePage::new("about:blank").fail_after(0);
        let (store, ctx) = context(ProbeKind::AuthAbuse, "https://a.test/login", &page).await;
        assert_eq!(run_probe(&AuthAbuseProbe, &ctx).await, SessionStatus::Failed);
        assert!(store.findings_for_run(ctx.run_id).await.unwrap().is_empty());
    }
}
