use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use skillpath_core::ids::{RunId, StageId};
use skillpath_core::model::{EmbeddingTrace, LlmTrace, StageError};
use skillpath_core::stage::StageName;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A stored stage row. The output, usage and error columns are schema-less
/// JSON documents; the trace reader reconstructs typed payloads from them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageRow {
    pub id: StageId,
    pub run_id: RunId,
    pub stage_name: StageName,
    pub stage_order: u8,
    pub input: serde_json::Value,
    pub output_raw: Option<serde_json::Value>,
    pub output_metrics: Option<serde_json::Value>,
    pub llm: Option<LlmTrace>,
    pub embedding: Option<EmbeddingTrace>,
    pub error: Option<StageError>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<f64>,
}

pub struct StageRepo {
    db: Database,
}

impl StageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a started stage row with its serialized input. The order is
    /// pre-assigned from the stage name.
    #[instrument(skip(self, input), fields(run_id = %run_id, stage = %stage_name))]
    pub fn create(
        &self,
        run_id: &RunId,
        stage_name: StageName,
        input: &serde_json::Value,
        started_at: &str,
    ) -> Result<StageRow, StoreError> {
        let id = StageId::new();
        let input_json = row_helpers::to_json(input)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO stages (id, run_id, stage_name, stage_order, input, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    run_id.as_str(),
                    stage_name.as_str(),
                    stage_name.order(),
                    input_json,
                    started_at,
                ],
            )?;

            Ok(StageRow {
                id: id.clone(),
                run_id: run_id.clone(),
                stage_name,
                stage_order: stage_name.order(),
                input: input.clone(),
                output_raw: None,
                output_metrics: None,
                llm: None,
                embedding: None,
                error: None,
                started_at: started_at.to_string(),
                completed_at: None,
                duration_ms: None,
            })
        })
    }

    /// Complete a stage row with its serialized output, optional usage
    /// metadata (LLM or embedding, never both) and measured duration.
    #[instrument(skip_all, fields(stage_id = %id))]
    pub fn complete(
        &self,
        id: &StageId,
        output_raw: &serde_json::Value,
        output_metrics: Option<&serde_json::Value>,
        llm: Option<&LlmTrace>,
        embedding: Option<&EmbeddingTrace>,
        duration_ms: f64,
    ) -> Result<(), StoreError> {
        let raw_json = row_helpers::to_json(output_raw)?;
        let metrics_json = row_helpers::to_json_opt(output_metrics)?;
        let llm_json = row_helpers::to_json_opt(llm)?;
        let embedding_json = row_helpers::to_json_opt(embedding)?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE stages SET output_raw = ?1, output_metrics = ?2, llm = ?3,
                        embedding = ?4, completed_at = ?5, duration_ms = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    raw_json,
                    metrics_json,
                    llm_json,
                    embedding_json,
                    now,
                    duration_ms,
                    id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("stage {id}")));
            }
            Ok(())
        })
    }

    /// Record a stage failure.
    #[instrument(skip(self, error), fields(stage_id = %id, code = %error.code))]
    pub fn fail(
        &self,
        id: &StageId,
        error: &StageError,
        duration_ms: f64,
    ) -> Result<(), StoreError> {
        let error_json = row_helpers::to_json(error)?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE stages SET error = ?1, completed_at = ?2, duration_ms = ?3 WHERE id = ?4",
                rusqlite::params![error_json, now, duration_ms, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("stage {id}")));
            }
            Ok(())
        })
    }

    /// List all stages of a run in storage order. Repeated executions of the
    /// same stage tie on order and fall back to start time.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub fn list_for_run(&self, run_id: &RunId) -> Result<Vec<StageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_STAGE} WHERE run_id = ?1 ORDER BY stage_order, started_at"
            ))?;
            let mut rows = stmt.query([run_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_stage(row)?);
            }
            Ok(results)
        })
    }

    /// Find the first execution of a named stage within a run.
    #[instrument(skip(self), fields(run_id = %run_id, stage = %stage_name))]
    pub fn find_by_name(
        &self,
        run_id: &RunId,
        stage_name: StageName,
    ) -> Result<Option<StageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_STAGE} WHERE run_id = ?1 AND stage_name = ?2 ORDER BY started_at LIMIT 1"
            ))?;
            let mut rows = stmt.query(rusqlite::params![run_id.as_str(), stage_name.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_stage(row)?)),
                None => Ok(None),
            }
        })
    }
}

const SELECT_STAGE: &str = "SELECT id, run_id, stage_name, stage_order, input, output_raw,
        output_metrics, llm, embedding, error, started_at, completed_at, duration_ms
 FROM stages";

fn row_to_stage(row: &rusqlite::Row<'_>) -> Result<StageRow, StoreError> {
    let name_str: String = row_helpers::get(row, 2, "stages", "stage_name")?;
    let input_raw: String = row_helpers::get(row, 4, "stages", "input")?;
    let output_raw: Option<String> = row_helpers::get_opt(row, 5, "stages", "output_raw")?;
    let metrics_raw: Option<String> = row_helpers::get_opt(row, 6, "stages", "output_metrics")?;
    let llm_raw: Option<String> = row_helpers::get_opt(row, 7, "stages", "llm")?;
    let embedding_raw: Option<String> = row_helpers::get_opt(row, 8, "stages", "embedding")?;
    let error_raw: Option<String> = row_helpers::get_opt(row, 9, "stages", "error")?;

    Ok(StageRow {
        id: StageId::from_raw(row_helpers::get::<String>(row, 0, "stages", "id")?),
        run_id: RunId::from_raw(row_helpers::get::<String>(row, 1, "stages", "run_id")?),
        stage_name: row_helpers::parse_enum(&name_str, "stages", "stage_name")?,
        stage_order: row_helpers::get::<i64>(row, 3, "stages", "stage_order")? as u8,
        input: row_helpers::parse_json(&input_raw, "stages", "input")?,
        output_raw: row_helpers::parse_json_opt(output_raw.as_deref(), "stages", "output_raw")?,
        output_metrics: row_helpers::parse_json_opt(
            metrics_raw.as_deref(),
            "stages",
            "output_metrics",
        )?,
        llm: row_helpers::parse_json_opt(llm_raw.as_deref(), "stages", "llm")?,
        embedding: row_helpers::parse_json_opt(embedding_raw.as_deref(), "stages", "embedding")?,
        error: row_helpers::parse_json_opt(error_raw.as_deref(), "stages", "error")?,
        started_at: row_helpers::get(row, 10, "stages", "started_at")?,
        completed_at: row_helpers::get_opt(row, 11, "stages", "completed_at")?,
        duration_ms: row_helpers::get_opt(row, 12, "stages", "duration_ms")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::RunRepo;
    use serde_json::json;
    use skillpath_core::model::TokenUsage;

    fn setup() -> (StageRepo, RunId) {
        let db = Database::in_memory().unwrap();
        let runs = RunRepo::new(db.clone());
        let run = runs.create("How do I learn SQL?", None).unwrap();
        (StageRepo::new(db), run.id)
    }

    fn sample_llm() -> LlmTrace {
        LlmTrace {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            prompt_version: "v3".into(),
            system_prompt_hash: "ab".repeat(32),
            user_prompt: "How do I learn SQL?".into(),
            schema_name: Some("classification".into()),
            token_usage: TokenUsage { input_tokens: 150, output_tokens: 75, total_tokens: 225 },
            cost: 0.0002,
            full_metadata: json!({"finish_reason": "stop"}),
            parameters: json!({"temperature": 0.0}),
        }
    }

    #[test]
    fn create_assigns_order_from_name() {
        let (repo, run_id) = setup();
        let now = Utc::now().to_rfc3339();
        let stage = repo
            .create(&run_id, StageName::CourseRetrieval, &json!({"skills": ["sql"]}), &now)
            .unwrap();
        assert!(stage.id.as_str().starts_with("stg_"));
        assert_eq!(stage.stage_order, 3);
        assert!(stage.output_raw.is_none());
    }

    #[test]
    fn complete_persists_output_and_llm_usage() {
        let (repo, run_id) = setup();
        let now = Utc::now().to_rfc3339();
        let stage = repo
            .create(&run_id, StageName::QuestionClassification, &json!({"q": "..."}), &now)
            .unwrap();

        repo.complete(
            &stage.id,
            &json!({"category": "course_recommendation", "confidence": 0.93}),
            Some(&json!({"prompt_chars": 512})),
            Some(&sample_llm()),
            None,
            412.5,
        )
        .unwrap();

        let fetched = repo.find_by_name(&run_id, StageName::QuestionClassification)
            .unwrap()
            .unwrap();
        assert_eq!(fetched.output_raw.unwrap()["category"], "course_recommendation");
        let llm = fetched.llm.unwrap();
        assert_eq!(llm.token_usage.total_tokens, 225);
        assert!(fetched.embedding.is_none());
        assert_eq!(fetched.duration_ms, Some(412.5));
        assert!(fetched.completed_at.is_some());
    }

    #[test]
    fn complete_missing_stage_is_not_found() {
        let (repo, _) = setup();
        let result = repo.complete(
            &StageId::from_raw("stg_missing"),
            &json!({}),
            None,
            None,
            None,
            1.0,
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn fail_records_error() {
        let (repo, run_id) = setup();
        let now = Utc::now().to_rfc3339();
        let stage = repo
            .create(&run_id, StageName::AnswerGeneration, &json!({}), &now)
            .unwrap();
        repo.fail(&stage.id, &StageError::new("LLM_ERROR", "rate limited"), 98.0)
            .unwrap();

        let fetched = repo.find_by_name(&run_id, StageName::AnswerGeneration)
            .unwrap()
            .unwrap();
        let error = fetched.error.unwrap();
        assert_eq!(error.code, "LLM_ERROR");
        assert!(fetched.output_raw.is_none());
    }

    #[test]
    fn list_for_run_is_in_storage_order() {
        let (repo, run_id) = setup();
        let now = Utc::now().to_rfc3339();
        // Insert out of order
        repo.create(&run_id, StageName::CourseRetrieval, &json!({}), &now).unwrap();
        repo.create(&run_id, StageName::QuestionClassification, &json!({}), &now).unwrap();
        repo.create(&run_id, StageName::SkillExtraction, &json!({}), &now).unwrap();

        let stages = repo.list_for_run(&run_id).unwrap();
        let orders: Vec<u8> = stages.iter().map(|s| s.stage_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn stage_name_may_recur_within_a_run() {
        let (repo, run_id) = setup();
        let first = "2026-08-31T10:00:00+00:00";
        let second = "2026-08-31T10:00:05+00:00";
        repo.create(&run_id, StageName::CourseRetrieval, &json!({"attempt": 1}), first)
            .unwrap();
        repo.create(&run_id, StageName::CourseRetrieval, &json!({"attempt": 2}), second)
            .unwrap();

        let stages = repo.list_for_run(&run_id).unwrap();
        assert_eq!(stages.len(), 2);
        assert!(stages.iter().all(|s| s.stage_order == 3));

        // find_by_name returns the earliest execution
        let found = repo.find_by_name(&run_id, StageName::CourseRetrieval).unwrap().unwrap();
        assert_eq!(found.input["attempt"], 1);
    }

    #[test]
    fn corrupt_stage_name_surfaces_as_corrupt_row() {
        let (repo, run_id) = setup();
        let now = Utc::now().to_rfc3339();
        let stage = repo
            .create(&run_id, StageName::SkillExtraction, &json!({}), &now)
            .unwrap();

        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE stages SET stage_name = 'NOT_A_STAGE' WHERE id = ?1",
                    [stage.id.as_str()],
                )?;
                Ok(())
            })
            .unwrap();

        let result = repo.list_for_run(&run_id);
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "stages", column: "stage_name", .. })
        ));
    }
}
