//! W3C WebDriver client (chromedriver, geckodriver, selenium).

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::debug;

use crate::{BrowserDriver, BrowserPage, DriverError, ElementHandle, Key, PageOptions, PageSignal, WaitPolicy};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Records console output, uncaught errors, failing requests and dialogs
/// into `window.__sentinelSignals`; counts in-flight requests in
/// `window.__sentinelPending`.
const HOOK_SCRIPT: &str = r#"
if (!window.__sentinelHooked) {
  window.__sentinelHooked = true;
  window.__sentinelSignals = [];
  window.__sentinelPending = 0;
  const push = (s) => { if (window.__sentinelSignals.length < 200) window.__sentinelSignals.push(s); };
  ['error', 'warn'].forEach((level) => {
    const orig = console[level];
    console[level] = function (...a) {
      push({ kind: 'console', level: level, text: a.map(String).join(' ').slice(0, 500) });
      return orig.apply(console, a);
    };
  });
  window.addEventListener('error', (e) => push({ kind: 'page_error', message: String(e.message).slice(0, 500) }));
  ['alert', 'confirm', 'prompt'].forEach((dialog) => {
    window[dialog] = function (m) {
      push({ kind: 'dialog', dialog: dialog, message: String(m) });
      return dialog === 'confirm' ? false : null;
    };
  });
  if (window.fetch) {
    const orig = window.fetch;
    window.fetch = function (...a) {
      window.__sentinelPending++;
      return orig.apply(this, a)
        .then((r) => { if (r.status >= 400) push({ kind: 'response', url: r.url, status: r.status }); return r; })
        .finally(() => { window.__sentinelPending--; });
    };
  }
  const open = XMLHttpRequest.prototype.open, send = XMLHttpRequest.prototype.send;
  XMLHttpRequest.prototype.open = function (m, u) { this.__sentinelUrl = u; return open.apply(this, arguments); };
  XMLHttpRequest.prototype.send = function () {
    window.__sentinelPending++;
    this.addEventListener('loadend', () => {
      window.__sentinelPending--;
      if (this.status >= 400) push({ kind: 'response', url: String(this.__sentinelUrl), status: this.status });
    });
    return send.apply(this, arguments);
  };
}
return true;
"#;

const DRAIN_SCRIPT: &str = "const s = window.__sentinelSignals || []; window.__sentinelSignals = []; return s;";
const SETTLED_SCRIPT: &str = "return document.readyState === 'complete' && (window.__sentinelPending || 0) === 0;";
const LOADED_SCRIPT: &str = "return document.readyState === 'complete';";

/// Connects to a WebDriver endpoint such as `http://127.0.0.1:9515`.
#[derive(Debug, Clone)]
pub struct WebDriverBrowser {
    client: Client,
    endpoint: String,
}

impl WebDriverBrowser {
    pub fn new(endpoint: impl Into<String>, command_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(command_timeout).build()?;
        Ok(WebDriverBrowser { client, endpoint: endpoint.into().trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl BrowserDriver for WebDriverBrowser {
    async fn open_page(&self, opts: &PageOptions) -> Result<Box<dyn BrowserPage>, DriverError> {
        let mut args = vec![format!("--window-size={},{}", opts.viewport.0, opts.viewport.1)];
        if opts.headless {
            args.push("--headless=new".into());
            args.push("--no-sandbox".into());
            args.push("--disable-dev-shm-usage".into());
        }
        if let Some(ua) = &opts.user_agent {
            args.push(format!("--user-agent={ua}"));
        }
        let caps = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "eager",
                    "acceptInsecureCerts": true,
                    "unhandledPromptBehavior": "ignore",
                    "timeouts": { "pageLoad": opts.navigation_timeout.as_millis() as u64, "script": 30_000 },
                    "goog:chromeOptions": { "args": args }
                }
            }
        });
        let resp = send(&self.client, Method::POST, &format!("{}/session", self.endpoint), Some(caps)).await?;
        let session_id = resp
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Session("driver returned no session id".into()))?
            .to_string();
        debug!(%session_id, "webdriver session opened");
        Ok(Box::new(WebDriverPage {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.endpoint, session_id),
            pending: Mutex::new(Vec::new()),
        }))
    }
}

pub struct WebDriverPage {
    client: Client,
    base: String,
    /// Dialogs the browser raised natively before the hook could see them.
    pending: Mutex<Vec<PageSignal>>,
}

impl std::fmt::Debug for WebDriverPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDriverPage").field("base", &self.base).finish()
    }
}

fn map_reqwest(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Timeout(e.to_string())
    } else {
        DriverError::Transport(e.to_string())
    }
}

fn map_wire_error(code: &str, message: &str) -> DriverError {
    let msg = format!("{code}: {message}");
    match code {
        "no such element" | "stale element reference" | "element not interactable" | "element click intercepted"
        | "invalid element state" => DriverError::Element(msg),
        "timeout" | "script timeout" => DriverError::Timeout(msg),
        "javascript error" | "unexpected alert open" => DriverError::Script(msg),
        "invalid session id" | "no such window" | "session not created" => DriverError::Session(msg),
        _ => DriverError::Script(msg),
    }
}

async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value, DriverError> {
    let mut req = client.request(method, url);
    if let Some(b) = body {
        req = req.json(&b);
    }
    let resp = req.send().await.map_err(map_reqwest)?;
    let payload: Value = resp.json().await.map_err(map_reqwest)?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if let Some(code) = value.get("error").and_then(Value::as_str) {
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(map_wire_error(code, message));
    }
    Ok(value)
}

fn element_arg(el: &ElementHandle) -> Value {
    json!({ ELEMENT_KEY: el.0 })
}

impl WebDriverPage {
    async fn cmd(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DriverError> {
        let url = format!("{}{}", self.base, path);
        match send(&self.client, method.clone(), &url, body.clone()).await {
            Err(DriverError::Script(msg)) if msg.starts_with("unexpected alert open") => {
                self.dismiss_native_dialog().await;
                send(&self.client, method, &url, body).await
            }
            other => other,
        }
    }

    async fn dismiss_native_dialog(&self) {
        let text = send(&self.client, Method::GET, &format!("{}/alert/text", self.base), None).await;
        if let Ok(Value::String(message)) = text {
            self.pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(PageSignal::Dialog { dialog: "alert".into(), message });
            let _ = send(&self.client, Method::POST, &format!("{}/alert/dismiss", self.base), Some(json!({}))).await;
        }
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        self.cmd(Method::POST, "/execute/sync", Some(json!({ "script": script, "args": args }))).await
    }

    async fn install_hook(&self) {
        if let Err(e) = self.execute(HOOK_SCRIPT, vec![]).await {
            debug!(error = %e, "signal hook not installed");
        }
    }

    async fn poll_until(&self, script: &str, timeout: Duration) -> Result<(), DriverError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.execute(script, vec![]).await?.as_bool().unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::Timeout("page did not settle".into()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl BrowserPage for WebDriverPage {
    async fn goto(&self, url: &str, wait: WaitPolicy) -> Result<(), DriverError> {
        self.cmd(Method::POST, "/url", Some(json!({ "url": url }))).await?;
        self.dismiss_native_dialog().await;
        self.install_hook().await;
        match wait {
            WaitPolicy::DomContentLoaded => Ok(()),
            WaitPolicy::Load => self.poll_until(LOADED_SCRIPT, Duration::from_secs(10)).await,
            WaitPolicy::NetworkIdle => self.poll_until(SETTLED_SCRIPT, Duration::from_secs(10)).await,
        }
    }

    async fn title(&self) -> Result<String, DriverError> {
        Ok(self.cmd(Method::GET, "/title", None).await?.as_str().unwrap_or_default().to_string())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.cmd(Method::GET, "/url", None).await?.as_str().unwrap_or_default().to_string())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<ElementHandle>, DriverError> {
        let v = self.cmd(Method::POST, "/elements", Some(json!({ "using": "css selector", "value": selector }))).await?;
        Ok(v.as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                    .map(|id| ElementHandle(id.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn click(&self, el: &ElementHandle) -> Result<(), DriverError> {
        match self.cmd(Method::POST, &format!("/element/{}/click", el.0), Some(json!({}))).await {
            // overlays intercepting the pointer: click through script instead
            Err(DriverError::Element(_)) => self.execute("arguments[0].click(); return true;", vec![element_arg(el)]).await.map(|_| ()),
            other => other.map(|_| ()),
        }
    }

    async fn fill(&self, el: &ElementHandle, text: &str) -> Result<(), DriverError> {
        let _ = self.cmd(Method::POST, &format!("/element/{}/clear", el.0), Some(json!({}))).await;
        self.cmd(Method::POST, &format!("/element/{}/value", el.0), Some(json!({ "text": text }))).await?;
        Ok(())
    }

    async fn press(&self, el: &ElementHandle, key: Key) -> Result<(), DriverError> {
        self.cmd(Method::POST, &format!("/element/{}/value", el.0), Some(json!({ "text": key.code() }))).await?;
        self.dismiss_native_dialog().await;
        Ok(())
    }

    async fn content(&self) -> Result<String, DriverError> {
        Ok(self.cmd(Method::GET, "/source", None).await?.as_str().unwrap_or_default().to_string())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let v = self.cmd(Method::GET, "/screenshot", None).await?;
        let b64 = v.as_str().ok_or_else(|| DriverError::Script("screenshot payload missing".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| DriverError::Script(format!("screenshot decode: {e}")))
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        self.execute(script, vec![]).await
    }

    async fn evaluate_on(&self, el: &ElementHandle, script: &str) -> Result<Value, DriverError> {
        self.execute(script, vec![element_arg(el)]).await
    }

    async fn add_cookie(&self, name: &str, value: &str) -> Result<(), DriverError> {
        self.cmd(Method::POST, "/cookie", Some(json!({ "cookie": { "name": name, "value": value } }))).await?;
        Ok(())
    }

    async fn wait_for_settle(&self, timeout: Duration) -> Result<(), DriverError> {
        self.install_hook().await;
        self.poll_until(SETTLED_SCRIPT, timeout).await
    }

    async fn drain_signals(&self) -> Vec<PageSignal> {
        let mut out: Vec<PageSignal> = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()));
        match self.execute(DRAIN_SCRIPT, vec![]).await {
            Ok(v) => out.extend(serde_json::from_value::<Vec<PageSignal>>(v).unwrap_or_default()),
            Err(e) => debug!(error = %e, "signal drain failed"),
        }
        out
    }

    async fn close(&self) -> Result<(), DriverError> {
        send(&self.client, Method::DELETE, &self.base, None).await.map(|_| ())
    }
}
