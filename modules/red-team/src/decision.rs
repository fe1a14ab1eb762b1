//! Structured decisions returned by the decision step.

use completion::{strip_fences, CompletionError};
use sentinel_core::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Service(#[from] CompletionError),
    #[error("malformed decision: {0}")]
    Malformed(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("tool `{tool}` is missing argument `{arg}`")]
    MissingArg { tool: &'static str, arg: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tool {
    Click { index: usize },
    Type { index: usize, text: String },
    Navigate { url: String },
    Report(ReportedFinding),
    Finish { reason: String },
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::Click { .. } => "click",
            Tool::Type { .. } => "type",
            Tool::Navigate { .. } => "navigate",
            Tool::Report(_) => "report",
            Tool::Finish { .. } => "finish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedFinding {
    #[serde(default = "default_severity", deserialize_with = "lossy_severity")]
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub evidence: String,
}

fn default_severity() -> Severity {
    Severity::Medium
}

fn lossy_severity<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Severity, D::Error> {
    let s = String::deserialize(d)?;
    Ok(Severity::parse_lossy(&s))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub thought: String,
    pub tool: Tool,
    /// Human-readable intent for the event log.
    pub description: Option<String>,
    /// Observation the model flagged alongside a non-report action.
    pub finding: Option<ReportedFinding>,
}

#[derive(Deserialize)]
struct Wire {
    #[serde(default)]
    thought: String,
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    finding: Option<ReportedFinding>,
}

fn arg_index(args: &Value, tool: &'static str) -> Result<usize, DecodeError> {
    ["element_index", "index"]
        .iter()
        .find_map(|k| args.get(*k))
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .map(|i| i as usize)
        .ok_or(DecodeError::MissingArg { tool, arg: "element_index" })
}

fn arg_str(args: &Value, tool: &'static str, arg: &'static str) -> Result<String, DecodeError> {
    args.get(arg).and_then(Value::as_str).map(str::to_string).ok_or(DecodeError::MissingArg { tool, arg })
}

impl Decision {
    /// Decode a completion answer, tolerating markdown fences and prose
    /// around the JSON object.
    pub fn decode(raw: &str) -> Result<Decision, DecodeError> {
        let wire: Wire = serde_json::from_str(strip_fences(raw)).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let args = &wire.args;
        let tool = match wire.tool.trim().to_ascii_lowercase().as_str() {
            "click" => Tool::Click { index: arg_index(args, "click")? },
            "type" => Tool::Type { index: arg_index(args, "type")?, text: arg_str(args, "type", "text")? },
            "navigate" => Tool::Navigate { url: arg_str(args, "navigate", "url")? },
            "finish" => Tool::Finish {
                reason: args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("done")
                    .to_string(),
            },
            "report" => {
                let finding = serde_json::from_value::<ReportedFinding>(args.clone())
                    .ok()
                    .or_else(|| wire.finding.clone())
                    .ok_or(DecodeError::MissingArg { tool: "report", arg: "title" })?;
                Tool::Report(finding)
            }
            other => return Err(DecodeError::UnknownTool(other.to_string())),
        };
        let finding = match tool {
            Tool::Report(_) => None,
            _ => wire.finding,
        };
        let description = args.get("description").and_then(Value::as_str).map(str::to_string);
        Ok(Decision { thought: wire.thought, tool, description, finding })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_click_decodes() {
        let d = Decision::decode("```json\n{\"thought\": \"try search\", \"tool\": \"click\", \"args\": {\"element_index\": 3}}\n```").unwrap();
        assert_eq!(d.tool, Tool::Click { index: 3 });
        assert_eq!(d.thought, "try search");
        assert_eq!(d.finding, None);
    }

    #[test]
    fn report_args_become_finding() {
        let d = Decision::decode(r#"{"tool": "report", "args": {"severity": "critical", "title": "SQL error", "evidence": "ORA-01756"}}"#).unwrap();
        assert_eq!(d.tool, Tool::Report(ReportedFinding { severity: Severity::Critical, title: "SQL error".into(), evidence: "ORA-01756".into() }));
    }

    #[test]
    fn side_finding_rides_along_with_action() {
        let d = Decision::decode(
            r#"{"tool": "navigate", "args": {"url": "/admin"}, "finding": {"severity": "low", "title": "Debug banner", "evidence": "x"}}"#,
        )
        .unwrap();
        assert_eq!(d.tool, Tool::Navigate { url: "/admin".into() });
        assert_eq!(d.finding.unwrap().severity, Severity::Low);
    }

    #[test]
    fn bad_shapes_are_errors() {
        assert!(matches!(Decision::decode("{\"tool\": \"click\", \"args\": {"), Err(DecodeError::Malformed(_))));
        assert!(matches!(Decision::decode("{\"tool\": \"hover\"}"), Err(DecodeError::UnknownTool(t)) if t == "hover"));
        assert!(matches!(Decision::decode("{\"tool\": \"type\", \"args\": {\"element_index\": 1}}"), Err(DecodeError::MissingArg { arg: "text", .. })));
    }
}
