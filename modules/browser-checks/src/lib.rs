//! Browser-driven checks: CSRF exposure, login surfaces, error-based SQL
//! injection and reflected XSS.

use anyhow::Result;
use browser::BrowserPage;
use probe::ProbeContext;
use tracing::debug;
use url::Url;

mod auth_abuse;
mod exposure;
mod sqli;
mod xss;

pub use auth_abuse::AuthAbuseProbe;
pub use exposure::ExposureProbe;
pub use sqli::{sql_error_signature, SqliProbe};
pub use xss::{canary, XssProbe};

/// Free-text fields worth injecting into.
pub const TEXT_INPUTS: &str = "input[type='text'], input[type='search'], input:not([type]), textarea";

/// Open a page for the probe and run the login pre-step on it.
pub(crate) async fn open_authenticated(ctx: &ProbeContext) -> Result<Box<dyn BrowserPage>> {
    let page = ctx.open_page().await?;
    probe::login(ctx, page.as_ref()).await;
    Ok(page)
}

pub(crate) async fn close(page: Box<dyn BrowserPage>) {
    if let Err(e) = page.close().await {
        debug!(error = %e, "page close failed");
    }
}

/// One URL per query parameter of `target`, with that parameter's value
/// replaced by `payload`. Targets without a query yield nothing.
pub fn fuzzed_urls(target: &str, payload: &str) -> Vec<(String, String)> {
    let Ok(url) = Url::parse(target) else { return Vec::new() };
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let mut out: Vec<(String, String)> = Vec::new();
    for (name, _) in &pairs {
        if out.iter().any(|(n, _)| n == name) {
            continue;
        }
        let mut fuzzed = url.clone();
        fuzzed
            .query_pairs_mut()
            .clear()
            .extend_pairs(pairs.iter().map(|(k, v)| if k == name { (k.as_str(), payload) } else { (k.as_str(), v.as_str()) }));
        out.push((name.clone(), fuzzed.to_string()));
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use browser::fake::{FakeBrowser, FakePage};
    use probe::{ProbeContext, ProbeServices};
    use sentinel_core::*;
    use serde_json::Value;

    pub async fn context(kind: ProbeKind, target: &str, page: &FakePage) -> (Arc<MemoryStore>, ProbeContext) {
        let store = Arc::new(MemoryStore::new());
        let run = store
            .insert_run(&NewRun { target_url: target.into(), probes: vec![kind.as_str().into()], configuration: Value::Null })
            .await
            .unwrap();
        let sessions = store.insert_sessions(run.id, &[kind.as_str().to_string()]).await.unwrap();
        let mut services = ProbeServices::offline(reqwest::Client::new());
        services.browser = Arc::new(FakeBrowser { page: page.clone() });
        let ctx = ProbeContext::new(
            run.id,
            sessions[0].id,
            kind,
            target,
            &Value::Null,
            store.clone(),
            Arc::new(services),
            CancellationToken::new(),
        );
        (store, ctx)
    }
}
