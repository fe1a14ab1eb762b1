//! HTTP-level probes: surface mapping and response header checks.

use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::Client;

mod crawler;
mod headers;

pub use crawler::{same_origin_links, CrawlerProbe, MAX_LINKS};
pub use headers::{header_findings, HeadersProbe};

/// Body larger than this is not kept for link extraction.
const MAX_BODY: usize = 512 * 1024;

#[derive(Debug, Clone)]
pub struct Page {
    pub final_url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

pub async fn fetch(client: &Client, url: &str) -> Result<Page> {
    let resp = client.get(url).send().await.with_context(|| format!("GET {url}"))?;
    let status = resp.status().as_u16();
    let final_url = resp.url().to_string();
    let headers = resp.headers().clone();
    let bytes = resp.bytes().await.context("read response body")?;
    let body = (bytes.len() <= MAX_BODY).then(|| String::from_utf8_lossy(&bytes).into_owned());
    Ok(Page { final_url, status, headers, body })
}
