//! Browser automation port used by the browser-driven probes, plus a
//! W3C WebDriver implementation of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

mod webdriver;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use webdriver::{WebDriverBrowser, WebDriverPage};

/// Elements a visitor can interact with; shared by observation and actions
/// so an index means the same element in both.
pub const INTERACTIVE_SELECTOR: &str = "a, button, input, textarea, form";

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("element error: {0}")]
    Element(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("browser session lost: {0}")]
    Session(String),
    #[error("driver transport error: {0}")]
    Transport(String),
}

impl DriverError {
    /// The page can no longer be driven; anything else is worth continuing past.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Session(_) | DriverError::Transport(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return once the document is interactive.
    DomContentLoaded,
    /// Wait for the load event.
    Load,
    /// Wait for the load event and no in-flight fetch/XHR.
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Tab,
    Escape,
}

impl Key {
    /// WebDriver key code point.
    pub fn code(&self) -> &'static str {
        match self {
            Key::Enter => "\u{E007}",
            Key::Tab => "\u{E004}",
            Key::Escape => "\u{E00C}",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageOptions {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub navigation_timeout: Duration,
}

impl Default for PageOptions {
    fn default() -> Self {
        PageOptions {
            headless: true,
            user_agent: Some("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) Sentinel/1.0".into()),
            viewport: (1280, 720),
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

/// Opaque reference to a live element. Stale once the page navigates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle(pub String);

/// Passive side effect observed on the page between actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageSignal {
    Console { level: String, text: String },
    PageError { message: String },
    Response { url: String, status: u16 },
    Dialog { dialog: String, message: String },
}

impl std::fmt::Display for PageSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageSignal::Console { level, text } => write!(f, "console.{level}: {text}"),
            PageSignal::PageError { message } => write!(f, "uncaught error: {message}"),
            PageSignal::Response { url, status } => write!(f, "HTTP {status} {url}"),
            PageSignal::Dialog { dialog, message } => write!(f, "{dialog} dialog: {message}"),
        }
    }
}

/// One browser tab. Scripts are WebDriver-style function bodies: they
/// `return` their result and see their arguments as `arguments[i]`.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str, wait: WaitPolicy) -> Result<(), DriverError>;
    async fn title(&self) -> Result<String, DriverError>;
    async fn current_url(&self) -> Result<String, DriverError>;
    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError>;
    async fn click(&self, el: &ElementHandle) -> Result<(), DriverError>;
    async fn fill(&self, el: &ElementHandle, text: &str) -> Result<(), DriverError>;
    async fn press(&self, el: &ElementHandle, key: Key) -> Result<(), DriverError>;
    /// Serialized DOM of the current document.
    async fn content(&self) -> Result<String, DriverError>;
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;
    async fn evaluate(&self, script: &str) -> Result<Value, DriverError>;
    /// Like `evaluate`, with `el` passed as `arguments[0]`.
    async fn evaluate_on(&self, el: &ElementHandle, script: &str) -> Result<Value, DriverError>;
    async fn add_cookie(&self, name: &str, value: &str) -> Result<(), DriverError>;
    /// Wait for in-flight loads and requests to finish, up to `timeout`.
    async fn wait_for_settle(&self, timeout: Duration) -> Result<(), DriverError>;
    /// Signals observed since the previous drain, oldest first.
    async fn drain_signals(&self) -> Vec<PageSignal>;
    async fn close(&self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_page(&self, opts: &PageOptions) -> Result<Box<dyn BrowserPage>, DriverError>;
}

/// `innerText` of the first element matching `selector`, or empty.
pub async fn inner_text(page: &dyn BrowserPage, selector: &str) -> Result<String, DriverError> {
    let script = format!(
        "const el = document.querySelector({}); return el ? el.innerText : '';",
        serde_json::to_string(selector).unwrap_or_else(|_| "'body'".into())
    );
    Ok(page.evaluate(&script).await?.as_str().unwrap_or_default().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_decode_from_hook_payloads() {
        let raw = serde_json::json!([
            {"kind": "console", "level": "error", "text": "boom"},
            {"kind": "response", "url": "https://a.test/api", "status": 500},
            {"kind": "dialog", "dialog": "alert", "message": "Sentxyz"}
        ]);
        let signals: Vec<PageSignal> = serde_json::from_value(raw).unwrap();
        assert_eq!(signals[1], PageSignal::Response { url: "https://a.test/api".into(), status: 500 });
        assert_eq!(signals[2].to_string(), "alert dialog: Sentxyz");
    }

    #[test]
    fn only_lost_sessions_are_fatal() {
        assert!(DriverError::Session("gone".into()).is_fatal());
        assert!(!DriverError::Element("stale".into()).is_fatal());
        assert!(!DriverError::Timeout("nav".into()).is_fatal());
    }
}
