/// Ordered migrations; `PRAGMA user_version` records how many were applied.
pub const MIGRATIONS: &[&str] = &[MIG_0001_INIT, MIG_0002_FINDING_SCREENSHOTS];

pub const MIG_0001_INIT: &str = r#"
CREATE TABLE runs (
  id                  TEXT PRIMARY KEY,
  target_url          TEXT NOT NULL,
  probes_json         TEXT NOT NULL DEFAULT '[]',
  status              TEXT NOT NULL CHECK (status IN ('INITIALIZING','QUEUED','RUNNING','COMPLETED','FAILED','CANCELLED')),
  configuration_json  TEXT NOT NULL DEFAULT '{}',
  created_at          TEXT NOT NULL,
  started_at          TEXT,
  ended_at            TEXT
);

CREATE TABLE sessions (
  id              TEXT PRIMARY KEY,
  run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
  probe_type      TEXT NOT NULL,
  status          TEXT NOT NULL CHECK (status IN ('QUEUED','RUNNING','COMPLETED','FAILED','CANCELLED')),
  progress        INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
  created_at      TEXT NOT NULL,
  updated_at      TEXT
);

CREATE TABLE events (
  id              TEXT PRIMARY KEY,
  run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
  probe_type      TEXT NOT NULL,
  level           TEXT NOT NULL CHECK (level IN ('INFO','WARNING','ERROR','SUCCESS','SCREENSHOT')),
  message         TEXT NOT NULL,
  data_json       TEXT,
  created_at      TEXT NOT NULL
);

CREATE TABLE findings (
  id              TEXT PRIMARY KEY,
  run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
  probe_type      TEXT NOT NULL,
  severity        TEXT NOT NULL CHECK (severity IN ('INFO','LOW','MEDIUM','HIGH','CRITICAL')),
  title           TEXT NOT NULL,
  evidence        TEXT NOT NULL,
  recommendation  TEXT NOT NULL,
  created_at      TEXT NOT NULL
);

CREATE INDEX idx_runs_status ON runs(status);
CREATE INDEX idx_sessions_run ON sessions(run_id);
CREATE INDEX idx_events_run ON events(run_id);
CREATE INDEX idx_findings_run ON findings(run_id);
"#;

pub const MIG_0002_FINDING_SCREENSHOTS: &str = r#"
ALTER TABLE findings ADD COLUMN screenshots_json TEXT;
"#;
