//! Records persisted by the engine: runs, sessions, events and findings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type RunId = Uuid;
pub type SessionId = Uuid;
pub type EventId = Uuid;
pub type FindingId = Uuid;

/// Fresh creation-ordered identifier.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self { $($name::$variant => $wire),+ }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s { $($wire => Some($name::$variant),)+ _ => None }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Initializing,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

wire_enum!(RunStatus {
    Initializing => "INITIALIZING",
    Queued => "QUEUED",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

wire_enum!(SessionStatus {
    Queued => "QUEUED",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Success,
    Screenshot,
}

wire_enum!(EventLevel {
    Info => "INFO",
    Warning => "WARNING",
    Error => "ERROR",
    Success => "SUCCESS",
    Screenshot => "SCREENSHOT",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

wire_enum!(Severity {
    Info => "INFO",
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
    Critical => "CRITICAL",
});

impl Severity {
    /// Case-insensitive parse; anything unrecognised is `Info`.
    pub fn parse_lossy(s: &str) -> Severity {
        Severity::parse(&s.trim().to_ascii_uppercase()).unwrap_or(Severity::Info)
    }
}

/// Probe implementations known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Crawler,
    Exposure,
    HeadersTls,
    AuthAbuse,
    Sqli,
    Xss,
    LlmAnalysis,
    RedTeam,
}

wire_enum!(ProbeKind {
    Crawler => "crawler",
    Exposure => "exposure",
    HeadersTls => "headers_tls",
    AuthAbuse => "auth_abuse",
    Sqli => "sqli",
    Xss => "xss",
    LlmAnalysis => "llm_analysis",
    RedTeam => "red_team",
});

impl ProbeKind {
    /// Kind used for `custom` and for names no implementation claims.
    pub const DEFAULT: ProbeKind = ProbeKind::Exposure;

    pub const ALL: [ProbeKind; 8] = [
        ProbeKind::Crawler,
        ProbeKind::Exposure,
        ProbeKind::HeadersTls,
        ProbeKind::AuthAbuse,
        ProbeKind::Sqli,
        ProbeKind::Xss,
        ProbeKind::LlmAnalysis,
        ProbeKind::RedTeam,
    ];

    pub fn resolve(name: &str) -> ProbeKind {
        ProbeKind::parse(name.trim()).unwrap_or(ProbeKind::DEFAULT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub target_url: String,
    pub probes: Vec<String>,
    pub status: RunStatus,
    pub configuration: Value,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub target_url: String,
    pub probes: Vec<String>,
    pub configuration: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub run_id: RunId,
    pub probe_type: String,
    pub status: SessionStatus,
    pub progress: u8,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl Session {
    pub fn kind(&self) -> ProbeKind {
        ProbeKind::resolve(&self.probe_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub run_id: RunId,
    pub probe_type: String,
    pub level: EventLevel,
    pub message: String,
    pub data: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub run_id: RunId,
    pub probe_type: String,
    pub level: EventLevel,
    pub message: String,
    pub data: Option<Value>,
}

/// Visual evidence attached to a finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotRef {
    pub url: String,
    pub caption: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub run_id: RunId,
    pub probe_type: String,
    pub severity: Severity,
    pub title: String,
    pub evidence: String,
    pub recommendation: String,
    pub screenshots: Option<Vec<ScreenshotRef>>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFinding {
    pub run_id: RunId,
    pub probe_type: String,
    pub severity: Severity,
    pub title: String,
    pub evidence: String,
    pub recommendation: String,
    pub screenshots: Option<Vec<ScreenshotRef>>,
}

impl NewFinding {
    /// Fields a store may lack without the finding losing its meaning.
    pub const OPTIONAL_FIELDS: &'static [&'static str] = &["screenshots"];

    /// Copy with an optional field dropped, or `None` when `field` is required.
    pub fn without_field(&self, field: &str) -> Option<NewFinding> {
        match field {
            "screenshots" => Some(NewFinding { screenshots: None, ..self.clone() }),
            _ => None,
        }
    }
}
