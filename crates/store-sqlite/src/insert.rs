use crate::models::{map_err, run_from_row, RUN_COLUMNS};
use crate::Db;
use rusqlite::{params, OptionalExtension};
use sentinel_core::*;
use tracing::debug;

fn to_json<T: serde::Serialize>(record: &'static str, v: &T) -> Result<String, StoreError> {
    serde_json::to_string(v).map_err(|e| StoreError::Decode { record, reason: e.to_string() })
}

impl Db {
    pub fn insert_run(&self, run: &NewRun) -> Result<Run, StoreError> {
        let row = Run {
            id: new_id(),
            target_url: run.target_url.clone(),
            probes: run.probes.clone(),
            status: RunStatus::Initializing,
            configuration: run.configuration.clone(),
            created_at: now_rfc3339(),
            started_at: None,
            ended_at: None,
        };
        self.conn
            .execute(
                "INSERT INTO runs(id, target_url, probes_json, status, configuration_json, created_at) VALUES (?,?,?,?,?,?)",
                params![
                    row.id.to_string(),
                    row.target_url,
                    to_json("run", &row.probes)?,
                    row.status.as_str(),
                    to_json("run", &row.configuration)?,
                    row.created_at
                ],
            )
            .map_err(|e| map_err("runs", e))?;
        Ok(row)
    }

    pub fn set_run_status(&self, id: RunId, status: RunStatus) -> Result<(), StoreError> {
        let n = self
            .conn
            .execute("UPDATE runs SET status=? WHERE id=?", params![status.as_str(), id.to_string()])
            .map_err(|e| map_err("runs", e))?;
        if n == 0 {
            return Err(StoreError::NotFound { record: "run", id: id.to_string() });
        }
        Ok(())
    }

    /// Single-statement compare-and-set, so two workers sharing the file can
    /// never both move the same run out of QUEUED.
    pub fn claim_next_run(&self) -> Result<Option<Run>, StoreError> {
        let sql = format!(
            "UPDATE runs SET status='RUNNING', started_at=?1
             WHERE id = (SELECT id FROM runs WHERE status='QUEUED' ORDER BY rowid LIMIT 1) AND status='QUEUED'
             RETURNING {RUN_COLUMNS}"
        );
        let claimed = self
            .conn
            .query_row(&sql, params![now_rfc3339()], run_from_row)
            .optional()
            .map_err(|e| map_err("runs", e))?;
        if let Some(run) = &claimed {
            debug!(run_id = %run.id, "claimed queued run");
        }
        Ok(claimed)
    }

    pub fn finish_run(&self, id: RunId, status: RunStatus) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute(
                "UPDATE runs SET status=?, ended_at=? WHERE id=? AND status='RUNNING'",
                params![status.as_str(), now_rfc3339(), id.to_string()],
            )
            .map_err(|e| map_err("runs", e))?;
        if n == 0 && self.get_run(id)?.is_none() {
            return Err(StoreError::NotFound { record: "run", id: id.to_string() });
        }
        debug!(run_id = %id, %status, applied = n > 0, "finish run");
        Ok(n > 0)
    }

    pub fn cancel_run(&self, id: RunId) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(|e| map_err("runs", e))?;
        let now = now_rfc3339();
        let found: Option<String> = tx
            .query_row("SELECT status FROM runs WHERE id=?", params![id.to_string()], |r| r.get(0))
            .optional()
            .map_err(|e| map_err("runs", e))?;
        if found.is_none() {
            return Err(StoreError::NotFound { record: "run", id: id.to_string() });
        }
        tx.execute(
            "UPDATE runs SET status='CANCELLED', ended_at=? WHERE id=? AND status NOT IN ('COMPLETED','FAILED','CANCELLED')",
            params![now, id.to_string()],
        )
        .map_err(|e| map_err("runs", e))?;
        let sessions = tx
            .execute(
                "UPDATE sessions SET status='CANCELLED', updated_at=? WHERE run_id=? AND status IN ('QUEUED','RUNNING')",
                params![now, id.to_string()],
            )
            .map_err(|e| map_err("sessions", e))?;
        debug!(run_id = %id, sessions, "cancelled run");
        tx.commit().map_err(|e| map_err("runs", e))
    }

    pub fn insert_sessions(&self, run_id: RunId, probe_types: &[String]) -> Result<Vec<Session>, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(|e| map_err("sessions", e))?;
        let mut out = Vec::with_capacity(probe_types.len());
        for probe in probe_types {
            let s = Session {
                id: new_id(),
                run_id,
                probe_type: probe.clone(),
                status: SessionStatus::Queued,
                progress: 0,
                created_at: now_rfc3339(),
                updated_at: None,
            };
            tx.execute(
                "INSERT INTO sessions(id, run_id, probe_type, status, progress, created_at) VALUES (?,?,?,?,?,?)",
                params![s.id.to_string(), run_id.to_string(), s.probe_type, s.status.as_str(), 0i64, s.created_at],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                    StoreError::NotFound { record: "run", id: run_id.to_string() }
                }
                other => map_err("sessions", other),
            })?;
            out.push(s);
        }
        tx.commit().map_err(|e| map_err("sessions", e))?;
        Ok(out)
    }

    pub fn set_session_status(&self, id: SessionId, status: SessionStatus) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute(
                "UPDATE sessions SET status=?, updated_at=? WHERE id=? AND status != 'CANCELLED'",
                params![status.as_str(), now_rfc3339(), id.to_string()],
            )
            .map_err(|e| map_err("sessions", e))?;
        if n == 0 && self.get_session(id)?.is_none() {
            return Err(StoreError::NotFound { record: "session", id: id.to_string() });
        }
        Ok(n > 0)
    }

    pub fn set_session_progress(&self, id: SessionId, percent: u8) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE sessions SET progress=? WHERE id=?", params![percent.min(100) as i64, id.to_string()])
            .map_err(|e| map_err("sessions", e))?;
        Ok(())
    }

    pub fn append_event(&self, event: &NewEvent) -> Result<EventId, StoreError> {
        let id = new_id();
        let data = event.data.as_ref().map(|d| to_json("event", d)).transpose()?;
        self.conn
            .execute(
                "INSERT INTO events(id, run_id, probe_type, level, message, data_json, created_at) VALUES (?,?,?,?,?,?,?)",
                params![id.to_string(), event.run_id.to_string(), event.probe_type, event.level.as_str(), event.message, data, now_rfc3339()],
            )
            .map_err(|e| map_err("events", e))?;
        Ok(id)
    }

    /// Only names `screenshots_json` when the finding carries screenshots, so
    /// an older schema still accepts findings without them.
    pub fn append_finding(&self, f: &NewFinding) -> Result<FindingId, StoreError> {
        let id = new_id();
        let now = now_rfc3339();
        match &f.screenshots {
            Some(shots) => self.conn.execute(
                "INSERT INTO findings(id, run_id, probe_type, severity, title, evidence, recommendation, screenshots_json, created_at) VALUES (?,?,?,?,?,?,?,?,?)",
                params![id.to_string(), f.run_id.to_string(), f.probe_type, f.severity.as_str(), f.title, f.evidence, f.recommendation, to_json("finding", shots)?, now],
            ),
            None => self.conn.execute(
                "INSERT INTO findings(id, run_id, probe_type, severity, title, evidence, recommendation, created_at) VALUES (?,?,?,?,?,?,?,?)",
                params![id.to_string(), f.run_id.to_string(), f.probe_type, f.severity.as_str(), f.title, f.evidence, f.recommendation, now],
            ),
        }
        .map_err(|e| map_err("findings", e))?;
        Ok(id)
    }
}

