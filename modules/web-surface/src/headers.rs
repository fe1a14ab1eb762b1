use anyhow::Result;
use async_trait::async_trait;
use probe::{FindingDraft, Probe, ProbeContext};
use reqwest::header::{HeaderMap, CONTENT_SECURITY_POLICY, SERVER, STRICT_TRANSPORT_SECURITY, X_FRAME_OPTIONS};
use sentinel_core::{EventLevel, ProbeKind, Severity};

use crate::fetch;

/// Checks the security headers and transport of the target's response.
pub struct HeadersProbe;

/// Findings for a response fetched from `url` with `headers`.
pub fn header_findings(url: &str, headers: &HeaderMap) -> Vec<FindingDraft> {
    let mut out = Vec::new();
    if url.starts_with("http://") {
        out.push(FindingDraft::new(
            Severity::Medium,
            "Unencrypted Transport",
            format!("{url} is served over plain HTTP."),
            "Serve the application over HTTPS and redirect HTTP requests to it.",
        ));
    }
    if !headers.contains_key(STRICT_TRANSPORT_SECURITY) {
        out.push(FindingDraft::new(
            Severity::Medium,
            "Missing HSTS Header",
            "Strict-Transport-Security header is missing.",
            "Enable HSTS to prevent downgrade attacks.",
        ));
    }
    let frame_ancestors = headers
        .get(CONTENT_SECURITY_POLICY)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |csp| csp.to_ascii_lowercase().contains("frame-ancestors"));
    if !headers.contains_key(X_FRAME_OPTIONS) && !frame_ancestors {
        out.push(FindingDraft::new(
            Severity::Low,
            "Clickjacking Protection Missing",
            "X-Frame-Options and CSP frame-ancestors missing.",
            "Set X-Frame-Options: DENY or SAMEORIGIN, or a CSP frame-ancestors directive.",
        ));
    }
    if let Some(server) = headers.get(SERVER).and_then(|v| v.to_str().ok()) {
        out.push(FindingDraft::new(
            Severity::Low,
            "Server Banner Disclosure",
            format!("Server header revealed: {server}"),
            "Suppress the Server header or strip version details from it.",
        ));
    }
    out
}

#[async_trait]
impl Probe for HeadersProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::HeadersTls
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        ctx.emit(EventLevel::Info, format!("Starting Headers & TLS analysis on {}", ctx.target)).await;
        ctx.update_progress(10).await;
        let page = fetch(&ctx.services.http, &ctx.target).await?;
        ctx.emit(EventLevel::Info, format!("Received {} headers (HTTP {}).", page.headers.len(), page.status)).await;
        ctx.update_progress(50).await;

        // the redirect target is what a browser ends up trusting
        let findings = header_findings(&page.final_url, &page.headers);
        let plain = ctx.target.starts_with("http://") && !page.final_url.starts_with("http://");
        if plain {
            ctx.report_finding(FindingDraft::new(
                Severity::Medium,
                "Unencrypted Entry Point",
                format!("{} answers over plain HTTP before redirecting to {}.", ctx.target, page.final_url),
                "Enable HSTS preloading so clients never make the first request in clear text.",
            ))
            .await;
        }
        for f in findings {
            ctx.report_finding(f).await;
        }
        ctx.update_progress(90).await;
        ctx.emit(EventLevel::Success, "Headers analysis completed.").await;
        Ok(())
    }
}
