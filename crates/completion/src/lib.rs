//! Completion service port and an OpenAI-compatible client for it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;

mod openai;

pub use openai::{OpenAiClient, OpenAiOptions};

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion transport error: {0}")]
    Transport(String),
    #[error("completion service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("completion service returned no content")]
    Empty,
    #[error("completion output is not the expected structure: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Ask the service to answer with a single JSON object.
    pub json: bool,
}

impl CompletionRequest {
    pub fn json(prompt: impl Into<String>) -> Self {
        CompletionRequest { system: None, prompt: prompt.into(), json: true }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Submit one prompt and return the raw text of the answer.
    async fn complete(&self, req: &CompletionRequest) -> Result<String, CompletionError>;
}

/// Drop markdown code fences and any prose around the outermost JSON object.
pub fn strip_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // language tag, if any, runs to the first newline
        s = rest.split_once('\n').map_or(rest, |(_, body)| body);
        s = s.trim_end().strip_suffix("```").unwrap_or(s).trim();
    }
    if !s.starts_with('{') {
        if let (Some(start), Some(end)) = (s.find('{'), s.rfind('}')) {
            if start < end {
                return &s[start..=end];
            }
        }
    }
    s
}

/// Decode a structured answer after stripping incidental formatting.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, CompletionError> {
    serde_json::from_str(strip_fences(raw)).map_err(|e| CompletionError::Format(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn strips_tagged_fence() {
        let raw = "```json\n{\"tool\": \"finish\"}\n```";
        assert_eq!(strip_fences(raw), "{\"tool\": \"finish\"}");
    }

    #[test]
    fn strips_surrounding_prose() {
        let raw = "Sure! Here you go: {\"a\": 1} hope that helps";
        assert_eq!(strip_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn plain_json_is_untouched() {
        assert_eq!(strip_fences("  {\"a\": {\"b\": 2}} "), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn truncated_json_is_a_format_error() {
        let err = decode_json::<Value>("{\"tool\": \"click\", \"args\": {").unwrap_err();
        assert!(matches!(err, CompletionError::Format(_)));
    }
}
