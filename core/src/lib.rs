//! Core utilities and shared types for the sentinel engine.

pub mod cancel;
pub mod memory;
pub mod model;
pub mod ratelimiter;
pub mod store;

pub use cancel::CancellationToken;
pub use memory::MemoryStore;
pub use model::*;
pub use store::{RecordStore, StoreError};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Address of the web surface a run is pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target(pub String);

impl Target {
    /// Trimmed, non-empty target address.
    pub fn parse(s: &str) -> Option<Target> {
        let t = s.trim();
        if t.is_empty() { None } else { Some(Target(t.to_string())) }
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target(s.trim().to_string())
    }
}

/// Current wall-clock time as RFC 3339 (UTC).
pub fn now_rfc3339() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
