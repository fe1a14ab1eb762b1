use crate::models::*;
use crate::Db;
use rusqlite::{params, OptionalExtension};
use sentinel_core::*;

impl Db {
    pub fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let cnt: i64 = self
            .conn
            .query_row("SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?", [name], |r| r.get(0))
            .map_err(|e| map_err("schema", e))?;
        Ok(cnt > 0)
    }

    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        let cnt: i64 = self
            .conn
            .query_row("SELECT COUNT(1) FROM pragma_table_info(?) WHERE name=?", [table, column], |r| r.get(0))
            .map_err(|e| map_err("schema", e))?;
        Ok(cnt > 0)
    }

    pub fn get_run(&self, id: RunId) -> Result<Option<Run>, StoreError> {
        self.conn
            .query_row(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id=?"), params![id.to_string()], run_from_row)
            .optional()
            .map_err(|e| map_err("runs", e))
    }

    pub fn get_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        self.conn
            .query_row(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id=?"), params![id.to_string()], session_from_row)
            .optional()
            .map_err(|e| map_err("sessions", e))
    }

    pub fn sessions_for_run(&self, run_id: RunId, status: Option<SessionStatus>) -> Result<Vec<Session>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE run_id=?1 AND (?2 IS NULL OR status=?2) ORDER BY rowid"
            ))
            .map_err(|e| map_err("sessions", e))?;
        let rows = stmt
            .query_map(params![run_id.to_string(), status.map(|s| s.as_str())], session_from_row)
            .map_err(|e| map_err("sessions", e))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| map_err("sessions", e))
    }

    pub fn events_for_run(&self, run_id: RunId) -> Result<Vec<Event>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE run_id=? ORDER BY rowid"))
            .map_err(|e| map_err("events", e))?;
        let rows = stmt.query_map(params![run_id.to_string()], event_from_row).map_err(|e| map_err("events", e))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| map_err("events", e))
    }

    pub fn findings_for_run(&self, run_id: RunId) -> Result<Vec<Finding>, StoreError> {
        // older schemas have no screenshots column; read it as NULL there
        let columns = if self.column_exists("findings", "screenshots_json")? {
            FINDING_COLUMNS.to_string()
        } else {
            FINDING_COLUMNS.replace("screenshots_json", "NULL AS screenshots_json")
        };
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {columns} FROM findings WHERE run_id=? ORDER BY rowid"))
            .map_err(|e| map_err("findings", e))?;
        let rows = stmt.query_map(params![run_id.to_string()], finding_from_row).map_err(|e| map_err("findings", e))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| map_err("findings", e))
    }
}
