use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skillpath_core::ids::RunId;
use skillpath_core::model::{RunMetrics, RunStatus, RunTotals, StageError};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored run row. One per end-to-end pipeline execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRow {
    pub id: RunId,
    pub status: RunStatus,
    pub question: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub metrics: Option<RunMetrics>,
    pub error: Option<StageError>,
    pub total_duration_ms: Option<f64>,
    pub total_tokens: Option<u64>,
    pub total_cost: Option<f64>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new pending run.
    #[instrument(skip(self, input), fields(question_len = question.len()))]
    pub fn create(
        &self,
        question: &str,
        input: Option<&serde_json::Value>,
    ) -> Result<RunRow, StoreError> {
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();
        let input_json = row_helpers::to_json_opt(input)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, status, question, input, started_at, created_at, updated_at)
                 VALUES (?1, 'pending', ?2, ?3, ?4, ?4, ?4)",
                rusqlite::params![id.as_str(), question, input_json, now],
            )?;

            Ok(RunRow {
                id: id.clone(),
                status: RunStatus::Pending,
                question: question.to_string(),
                input: input.cloned(),
                output: None,
                metrics: None,
                error: None,
                total_duration_ms: None,
                total_tokens: None,
                total_cost: None,
                started_at: now.clone(),
                completed_at: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Find a run by ID. A missing row is a normal outcome, not an error.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn find(&self, id: &RunId) -> Result<Option<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(SELECT_RUN)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_run(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List runs ordered by creation time (newest first).
    #[instrument(skip(self))]
    pub fn list_recent(&self, limit: u32) -> Result<Vec<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, question, input, output, metrics, error,
                        total_duration_ms, total_tokens, total_cost,
                        started_at, completed_at, created_at, updated_at
                 FROM runs ORDER BY created_at DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_run(row)?);
            }
            Ok(results)
        })
    }

    /// Mark a run completed with its final output, metrics bundle and the
    /// scalar rollups supplied by the orchestrator.
    #[instrument(skip(self, output, metrics), fields(run_id = %id))]
    pub fn complete(
        &self,
        id: &RunId,
        output: &serde_json::Value,
        metrics: &RunMetrics,
        totals: RunTotals,
    ) -> Result<(), StoreError> {
        let output_json = row_helpers::to_json(output)?;
        let metrics_json = row_helpers::to_json(metrics)?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE runs SET status = 'completed', output = ?1, metrics = ?2,
                        total_duration_ms = ?3, total_tokens = ?4, total_cost = ?5,
                        completed_at = ?6, updated_at = ?6
                 WHERE id = ?7 AND status = 'pending'",
                rusqlite::params![
                    output_json,
                    metrics_json,
                    totals.duration_ms,
                    totals.tokens as i64,
                    totals.cost,
                    now,
                    id.as_str(),
                ],
            )?;
            guard_transition(conn, id, changed)
        })
    }

    /// Mark a run as exited early (e.g. the question was out of scope).
    #[instrument(skip(self, output), fields(run_id = %id))]
    pub fn early_exit(
        &self,
        id: &RunId,
        output: Option<&serde_json::Value>,
        reason: &str,
    ) -> Result<(), StoreError> {
        let output_json = row_helpers::to_json_opt(output)?;
        let error = StageError::new("EARLY_EXIT", reason);
        let error_json = row_helpers::to_json(&error)?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE runs SET status = 'early_exit', output = ?1, error = ?2,
                        completed_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                rusqlite::params![output_json, error_json, now, id.as_str()],
            )?;
            guard_transition(conn, id, changed)
        })
    }

    /// Mark a run failed with a structured error.
    #[instrument(skip(self, error), fields(run_id = %id, code = %error.code))]
    pub fn fail(&self, id: &RunId, error: &StageError) -> Result<(), StoreError> {
        let error_json = row_helpers::to_json(error)?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE runs SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                rusqlite::params![error_json, now, id.as_str()],
            )?;
            guard_transition(conn, id, changed)
        })
    }

    /// Mark a run timed out (set by the orchestrator's watchdog).
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn timeout(&self, id: &RunId) -> Result<(), StoreError> {
        let error = StageError::new("TIMEOUT", "pipeline exceeded its time budget");
        let error_json = row_helpers::to_json(&error)?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE runs SET status = 'timeout', error = ?1, completed_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                rusqlite::params![error_json, now, id.as_str()],
            )?;
            guard_transition(conn, id, changed)
        })
    }
}

const SELECT_RUN: &str = "SELECT id, status, question, input, output, metrics, error,
        total_duration_ms, total_tokens, total_cost,
        started_at, completed_at, created_at, updated_at
 FROM runs WHERE id = ?1";

/// Status transitions are pending → terminal only. The UPDATE is guarded by
/// `status = 'pending'`; zero changed rows means the run is missing or
/// already terminal.
fn guard_transition(conn: &Connection, id: &RunId, changed: usize) -> Result<(), StoreError> {
    if changed > 0 {
        return Ok(());
    }
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM runs WHERE id = ?1",
            [id.as_str()],
            |row| row.get(0),
        )
        .ok();
    match current {
        Some(status) => Err(StoreError::Conflict(format!(
            "run {id} already terminal: {status}"
        ))),
        None => Err(StoreError::NotFound(format!("run {id}"))),
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<RunRow, StoreError> {
    let status_str: String = row_helpers::get(row, 1, "runs", "status")?;
    let input_raw: Option<String> = row_helpers::get_opt(row, 3, "runs", "input")?;
    let output_raw: Option<String> = row_helpers::get_opt(row, 4, "runs", "output")?;
    let metrics_raw: Option<String> = row_helpers::get_opt(row, 5, "runs", "metrics")?;
    let error_raw: Option<String> = row_helpers::get_opt(row, 6, "runs", "error")?;

    Ok(RunRow {
        id: RunId::from_raw(row_helpers::get::<String>(row, 0, "runs", "id")?),
        status: row_helpers::parse_enum(&status_str, "runs", "status")?,
        question: row_helpers::get(row, 2, "runs", "question")?,
        input: row_helpers::parse_json_opt(input_raw.as_deref(), "runs", "input")?,
        output: row_helpers::parse_json_opt(output_raw.as_deref(), "runs", "output")?,
        metrics: row_helpers::parse_json_opt(metrics_raw.as_deref(), "runs", "metrics")?,
        error: row_helpers::parse_json_opt(error_raw.as_deref(), "runs", "error")?,
        total_duration_ms: row_helpers::get_opt(row, 7, "runs", "total_duration_ms")?,
        total_tokens: row_helpers::get_opt::<i64>(row, 8, "runs", "total_tokens")?
            .map(|t| t as u64),
        total_cost: row_helpers::get_opt(row, 9, "runs", "total_cost")?,
        started_at: row_helpers::get(row, 10, "runs", "started_at")?,
        completed_at: row_helpers::get_opt(row, 11, "runs", "completed_at")?,
        created_at: row_helpers::get(row, 12, "runs", "created_at")?,
        updated_at: row_helpers::get(row, 13, "runs", "updated_at")?,
    })
}
