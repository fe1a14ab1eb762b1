use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sentinel_core::ratelimiter::RateLimiter;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{CompletionError, CompletionRequest, CompletionService};

/// Pause before the single retry of a failed transport.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct OpenAiOptions {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    /// Requests per minute; 0 disables pacing.
    pub requests_per_minute: u32,
}

impl Default for OpenAiOptions {
    fn default() -> Self {
        OpenAiOptions {
            base_url: "https://api.openai.com/v1".into(),
            api_key: None,
            model: "gpt-4o".into(),
            timeout: Duration::from_secs(120),
            requests_per_minute: 0,
        }
    }
}

/// Chat-completions client for OpenAI and API-compatible gateways.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    opts: OpenAiOptions,
    limiter: Option<RateLimiter>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl OpenAiClient {
    /// Must be called inside a tokio runtime when pacing is enabled.
    pub fn new(opts: OpenAiOptions) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(opts.timeout).build()?;
        let limiter = (opts.requests_per_minute > 0).then(|| RateLimiter::per_minute(opts.requests_per_minute, 1));
        Ok(OpenAiClient { client, opts, limiter })
    }

    fn body(&self, req: &CompletionRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": req.prompt }));
        let mut body = json!({ "model": self.opts.model, "messages": messages });
        if req.json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    async fn attempt(&self, req: &CompletionRequest) -> Result<String, CompletionError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let url = format!("{}/chat/completions", self.opts.base_url.trim_end_matches('/'));
        let mut http = self.client.post(&url).json(&self.body(req));
        if let Some(key) = &self.opts.api_key {
            http = http.bearer_auth(key);
        }
        let resp = http.send().await.map_err(|e| CompletionError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status: status.as_u16(), body: body.chars().take(500).collect() });
        }
        let parsed: ChatResponse = resp.json().await.map_err(|e| CompletionError::Format(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(CompletionError::Empty)?;
        debug!(model = %self.opts.model, chars = content.len(), "completion received");
        Ok(content)
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    /// A transport failure is retried once; anything the service answered
    /// is returned as is.
    async fn complete(&self, req: &CompletionRequest) -> Result<String, CompletionError> {
        match self.attempt(req).await {
            Err(CompletionError::Transport(e)) => {
                warn!(error = %e, "completion transport failed; retrying once");
                tokio::time::sleep(RETRY_PAUSE).await;
                self.attempt(req).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CHAT_REPLY: &str = r#"{"choices": [{"message": {"content": "{\"tool\": \"finish\"}"}}]}"#;

    /// Drops the first `drop_first` connections unanswered, then replies
    /// with `status` and `body` to every later one.
    async fn gateway(drop_first: usize, status: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                if counter.fetch_add(1, Ordering::SeqCst) < drop_first {
                    drop(sock);
                    continue;
                }
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = sock.read(&mut chunk).await.unwrap_or(0);
                    buf.extend_from_slice(&chunk[..n]);
                    let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4) else {
                        if n == 0 { break } else { continue }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
                    let length = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0)))
                        .unwrap_or(0);
                    if buf.len() >= head_end + length || n == 0 {
                        break;
                    }
                }
                let reply = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(reply.as_bytes()).await;
            }
        });
        (format!("http://{addr}/v1"), seen)
    }

    fn client(base_url: String) -> OpenAiClient {
        OpenAiClient::new(OpenAiOptions { base_url, timeout: Duration::from_secs(5), ..OpenAiOptions::default() }).unwrap()
    }

    #[tokio::test]
    async fn transport_failure_is_retried_once() {
        let (base, seen) = gateway(1, "200 OK", CHAT_REPLY).await;
        let content = client(base).complete(&CompletionRequest::json("next?")).await.unwrap();
        assert_eq!(content, r#"{"tool": "finish"}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_transport_failure_is_returned() {
        let (base, seen) = gateway(2, "200 OK", CHAT_REPLY).await;
        let err = client(base).complete(&CompletionRequest::json("next?")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Transport(_)));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_status_is_not_retried() {
        let (base, seen) = gateway(0, "429 Too Many Requests", r#"{"error": "slow down"}"#).await;
        let err = client(base).complete(&CompletionRequest::json("next?")).await.unwrap_err();
        assert!(matches!(err, CompletionError::Status { status: 429, .. }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn json_requests_ask_for_json_object() {
        let client = OpenAiClient::new(OpenAiOptions::default()).unwrap();
        let body = client.body(&CompletionRequest::json("hi").with_system("auditor"));
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }
}
