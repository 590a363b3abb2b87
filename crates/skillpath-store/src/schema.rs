/// SQL DDL for the trace database. Stage inputs, outputs and usage metadata
/// are schema-less JSON documents in TEXT columns; the typed layer above the
/// store reconstructs and validates them.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'pending',
    question TEXT NOT NULL,
    input TEXT,
    output TEXT,
    metrics TEXT,
    error TEXT,
    total_duration_ms REAL,
    total_tokens INTEGER,
    total_cost REAL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stages (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id),
    stage_name TEXT NOT NULL,
    stage_order INTEGER NOT NULL,
    input TEXT NOT NULL,
    output_raw TEXT,
    output_metrics TEXT,
    llm TEXT,
    embedding TEXT,
    error TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_ms REAL
);

CREATE INDEX IF NOT EXISTS idx_stages_run ON stages(run_id);
CREATE INDEX IF NOT EXISTS idx_stages_run_order ON stages(run_id, stage_order);
CREATE INDEX IF NOT EXISTS idx_stages_run_name ON stages(run_id, stage_name);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
