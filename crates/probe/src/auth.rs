//! Optional authentication pre-step for browser probes.

use std::time::Duration;

use anyhow::{anyhow, Context};
use browser::{BrowserPage, Key, WaitPolicy};
use sentinel_core::EventLevel;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Auth;
use crate::context::ProbeContext;

const USERNAME_SELECTOR: &str =
    "input[type=email], input[name*=user i], input[name*=login i], input[name*=email i], input[id*=user i], input[type=text]";
const PASSWORD_SELECTOR: &str = "input[type=password]";
const SETTLE: Duration = Duration::from_secs(5);

/// Authenticate the page when the run carries credentials or a token.
/// Returns whether a login was performed; failures become a WARNING event
/// and the probe carries on unauthenticated.
pub async fn login(ctx: &ProbeContext, page: &dyn BrowserPage) -> bool {
    let Some(auth) = ctx.config.auth() else {
        return false;
    };
    let attempt = match &auth {
        Auth::Credentials { username, password, login_url } => {
            let url = login_url.as_deref().unwrap_or(&ctx.target);
            credentials(page, url, username, password).await
        }
        Auth::Token(token) => inject_token(page, &ctx.target, token).await,
    };
    match attempt {
        Ok(()) => {
            info!(run_id = %ctx.run_id, probe = %ctx.kind, "authenticated before probing");
            ctx.emit(EventLevel::Info, "Authenticated session established").await;
            true
        }
        Err(e) => {
            warn!(run_id = %ctx.run_id, probe = %ctx.kind, error = %format!("{e:#}"), "login failed; continuing unauthenticated");
            ctx.emit(EventLevel::Warning, format!("Login failed, continuing unauthenticated: {e:#}")).await;
            false
        }
    }
}

async fn credentials(page: &dyn BrowserPage, url: &str, username: &str, password: &str) -> anyhow::Result<()> {
    page.goto(url, WaitPolicy::NetworkIdle).await.context("open login page")?;
    let pass = page
        .query_all(PASSWORD_SELECTOR)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no password field on {url}"))?;
    let user = page
        .query_all(USERNAME_SELECTOR)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no username field on {url}"))?;
    page.fill(&user, username).await.context("fill username")?;
    page.fill(&pass, password).await.context("fill password")?;
    page.press(&pass, Key::Enter).await.context("submit login form")?;
    page.wait_for_settle(SETTLE).await?;
    Ok(())
}

/// `name=value; other=x` is set as cookies, anything else is stored as a
/// bearer token in localStorage.
async fn inject_token(page: &dyn BrowserPage, target: &str, token: &str) -> anyhow::Result<()> {
    page.goto(target, WaitPolicy::DomContentLoaded).await.context("open target")?;
    let pairs = cookie_pairs(token);
    if pairs.is_empty() {
        let script = format!(
            "localStorage.setItem('token', {0}); localStorage.setItem('access_token', {0}); return true;",
            Value::String(token.to_string())
        );
        page.evaluate(&script).await.context("store token")?;
    } else {
        for (name, value) in pairs {
            page.add_cookie(name, value).await.with_context(|| format!("set cookie {name}"))?;
        }
    }
    page.goto(target, WaitPolicy::NetworkIdle).await.context("reload target")?;
    Ok(())
}

fn cookie_pairs(token: &str) -> Vec<(&str, &str)> {
    if !token.contains('=') {
        return Vec::new();
    }
    token
        .split(';')
        .filter_map(|kv| kv.trim().split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ProbeServices;
    use sentinel_core::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn cookie_strings_split_into_pairs() {
        assert_eq!(cookie_pairs("sid=abc; theme=dark"), vec![("sid", "abc"), ("theme", "dark")]);
        assert!(cookie_pairs("eyJhbGciOi").is_empty());
    }

    #[tokio::test]
    async fn failed_login_is_a_warning_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let run = store
            .insert_run(&NewRun { target_url: "https://a.test".into(), probes: vec![], configuration: Value::Null })
            .await
            .unwrap();
        let cfg = json!({"auth_type": "token", "token": "sid=1"});
        let ctx = ProbeContext::new(
            run.id,
            new_id(),
            ProbeKind::Xss,
            "https://a.test",
            &cfg,
            store.clone(),
            Arc::new(ProbeServices::offline(reqwest::Client::new())),
            CancellationToken::new(),
        );
        let page = browser_stub::DeadPage;
        assert!(!login(&ctx, &page).await);
        let events = store.events_for_run(run.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, EventLevel::Warning);
    }

    mod browser_stub {
        use async_trait::async_trait;
        use browser::*;
        use serde_json::Value;
        use std::time::Duration;

        pub struct DeadPage;

        fn gone<T>() -> Result<T, DriverError> {
            Err(DriverError::Session("closed".into()))
        }

        #[async_trait]
        impl BrowserPage for DeadPage {
            async fn goto(&self, _: &str, _: WaitPolicy) -> Result<(), DriverError> { gone() }
            async fn title(&self) -> Result<String, DriverError> { gone() }
            async fn current_url(&self) -> Result<String, DriverError> { gone() }
            async fn query_all(&self, _: &str) -> Result<Vec<ElementHandle>, DriverError> { gone() }
            async fn click(&self, _: &ElementHandle) -> Result<(), DriverError> { gone() }
            async fn fill(&self, _: &ElementHandle, _: &str) -> Result<(), DriverError> { gone() }
            async fn press(&self, _: &ElementHandle, _: Key) -> Result<(), DriverError> { gone() }
            async fn content(&self) -> Result<String, DriverError> { gone() }
            async fn screenshot(&self) -> Result<Vec<u8>, DriverError> { gone() }
            async fn evaluate(&self, _: &str) -> Result<Value, DriverError> { gone() }
            async fn evaluate_on(&self, _: &ElementHandle, _: &str) -> Result<Value, DriverError> { gone() }
            async fn add_cookie(&self, _: &str, _: &str) -> Result<(), DriverError> { gone() }
            async fn wait_for_settle(&self, _: Duration) -> Result<(), DriverError> { gone() }
            async fn drain_signals(&self) -> Vec<PageSignal> { Vec::new() }
            async fn close(&self) -> Result<(), DriverError> { Ok(()) }
        }
    }
}
