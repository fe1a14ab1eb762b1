//! Row <-> record mapping.

use rusqlite::Row;
use sentinel_core::*;
use uuid::Uuid;

pub const RUN_COLUMNS: &str = "id, target_url, probes_json, status, configuration_json, created_at, started_at, ended_at";
pub const SESSION_COLUMNS: &str = "id, run_id, probe_type, status, progress, created_at, updated_at";
pub const EVENT_COLUMNS: &str = "id, run_id, probe_type, level, message, data_json, created_at";
pub const FINDING_COLUMNS: &str = "id, run_id, probe_type, severity, title, evidence, recommendation, screenshots_json, created_at";

/// Map a rusqlite failure, recognising writes against columns this schema
/// does not have yet.
pub fn map_err(record: &'static str, e: rusqlite::Error) -> StoreError {
    let msg = e.to_string();
    if let Some(col) = msg.split("has no column named ").nth(1).and_then(|rest| rest.split_whitespace().next()) {
        let field = col.strip_suffix("_json").unwrap_or(col);
        return StoreError::UnknownField { record, field: field.to_string() };
    }
    StoreError::Backend(msg)
}

fn decode_err(record: &'static str, reason: impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(StoreError::Decode { record, reason: reason.to_string() }),
    )
}

fn uuid_col(row: &Row, idx: usize, record: &'static str) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| decode_err(record, e))
}

fn json_col<T: serde::de::DeserializeOwned>(raw: Option<String>, record: &'static str) -> rusqlite::Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s).map_err(|e| decode_err(record, e))).transpose()
}

pub fn run_from_row(row: &Row) -> rusqlite::Result<Run> {
    let status: String = row.get(3)?;
    Ok(Run {
        id: uuid_col(row, 0, "run")?,
        target_url: row.get(1)?,
        probes: json_col(row.get(2)?, "run")?.unwrap_or_default(),
        status: RunStatus::parse(&status).ok_or_else(|| decode_err("run", format!("status {status}")))?,
        configuration: json_col(row.get(4)?, "run")?.unwrap_or(serde_json::Value::Null),
        created_at: row.get(5)?,
        started_at: row.get(6)?,
        ended_at: row.get(7)?,
    })
}

pub fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let progress: i64 = row.get(4)?;
    Ok(Session {
        id: uuid_col(row, 0, "session")?,
        run_id: uuid_col(row, 1, "session")?,
        probe_type: row.get(2)?,
        status: SessionStatus::parse(&status).ok_or_else(|| decode_err("session", format!("status {status}")))?,
        progress: progress.clamp(0, 100) as u8,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn event_from_row(row: &Row) -> rusqlite::Result<Event> {
    let level: String = row.get(3)?;
    Ok(Event {
        id: uuid_col(row, 0, "event")?,
        run_id: uuid_col(row, 1, "event")?,
        probe_type: row.get(2)?,
        level: EventLevel::parse(&level).ok_or_else(|| decode_err("event", format!("level {level}")))?,
        message: row.get(4)?,
        data: json_col(row.get(5)?, "event")?,
        created_at: row.get(6)?,
    })
}

pub fn finding_from_row(row: &Row) -> rusqlite::Result<Finding> {
    let severity: String = row.get(3)?;
    Ok(Finding {
        id: uuid_col(row, 0, "finding")?,
        run_id: uuid_col(row, 1, "finding")?,
        probe_type: row.get(2)?,
        severity: Severity::parse(&severity).ok_or_else(|| decode_err("finding", format!("severity {severity}")))?,
        title: row.get(4)?,
        evidence: row.get(5)?,
        recommendation: row.get(6)?,
        screenshots: json_col(row.get(7)?, "finding")?,
        created_at: row.get(8)?,
    })
}
