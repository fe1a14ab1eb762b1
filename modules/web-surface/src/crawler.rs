use anyhow::{Context, Result};
use async_trait::async_trait;
use probe::{Probe, ProbeContext};
use regex::Regex;
use sentinel_core::{EventLevel, ProbeKind};
use serde_json::json;
use std::sync::OnceLock;
use tracing::info;
use url::Url;

use crate::fetch;

/// Upper bound on links reported per target.
pub const MAX_LINKS: usize = 25;

/// Maps the reachable surface of the target page for later phases.
pub struct CrawlerProbe;

fn href_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']+)["']"#).ok()).as_ref()
}

/// Links in `body` on the same origin as `base`, with fragment and query
/// removed, deduplicated in document order and capped at [`MAX_LINKS`].
pub fn same_origin_links(base: &Url, body: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let Some(re) = href_re() else { return out };
    for cap in re.captures_iter(body) {
        let Ok(mut link) = base.join(cap[1].trim()) else { continue };
        if !matches!(link.scheme(), "http" | "https") || link.origin() != base.origin() {
            continue;
        }
        link.set_fragment(None);
        link.set_query(None);
        let link = link.to_string();
        if !out.contains(&link) {
            out.push(link);
            if out.len() == MAX_LINKS {
                break;
            }
        }
    }
    out
}

#[async_trait]
impl Probe for CrawlerProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Crawler
    }

    async fn execute(&self, ctx: &ProbeContext) -> Result<()> {
        ctx.emit(EventLevel::Info, format!("Mapping surface of {}", ctx.target)).await;
        let base = Url::parse(&ctx.target).with_context(|| format!("invalid target {}", ctx.target))?;
        let page = fetch(&ctx.services.http, base.as_str()).await?;
        ctx.update_progress(40).await;

        let body = page.body.unwrap_or_default();
        let final_url = Url::parse(&page.final_url).unwrap_or(base);

        let urls = same_origin_links(&final_url, &body);
        info!(run_id = %ctx.run_id, links = urls.len(), status = page.status, "surface mapped");
        ctx.emit_event(
            EventLevel::Info,
            format!("Discovered {} same-origin URLs", urls.len()),
            Some(json!({ "urls": urls, "status": page.status })),
        )
        .await;
        ctx.emit(EventLevel::Success, "Surface mapping completed.").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_same_origin_links_only() {
        let base = Url::parse("https://shop.test/catalog/").unwrap();
        let body = r##"
            <a href="/login?next=/">Login</a>
            <a HREF='item/1#reviews'>Item</a>
            <a href="https://shop.test/login">dup</a>
            <a href="https://cdn.other.test/x.js">cdn</a>
            <a href="mailto:sales@shop.test">mail</a>
            <a href="http://shop.test/plain">downgrade</a>
        "##;
        assert_eq!(same_origin_links(&base, body), ["https://shop.test/login", "https://shop.test/catalog/item/1"]);
    }

    #[test]
    fn caps_link_count() {
        let base = Url::parse("https://a.test/").unwrap();
        let body: String = (0..40).map(|i| format!("<a href=\"/p{i}\">p</a>")).collect();
        let links = same_origin_links(&base, &body);
        assert_eq!(links.len(), MAX_LINKS);
        assert_eq!(links[0], "https://a.test/p0");
    }
}
