use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::instrument;

use skillpath_core::errors::TraceError;
use skillpath_core::ids::{RunId, StageId};
use skillpath_core::model::{
    EmbeddingTrace, LlmTrace, RunMetrics, RunTotals, SkillEmbeddingUsage, StageError, TokenUsage,
};
use skillpath_core::payload::{
    AnswerGenerationOutput, ClassificationOutput, CourseAggregationOutput,
    CourseRelevanceFilteringOutput, CourseRetrievalOutput, RelevanceFilteringOutput,
    SkillExtractionOutput,
};
use skillpath_core::stage::StageName;
use skillpath_store::runs::RunRepo;
use skillpath_store::stages::StageRepo;
use skillpath_store::Database;

use crate::error::RecorderError;
use crate::pricing;

/// Usage metadata for one LLM invocation, as supplied by the stage executor.
/// The raw system prompt is hashed before persistence and never stored.
#[derive(Clone, Debug)]
pub struct LlmUsageDescriptor {
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub schema_name: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Provider-reported cost; estimated from the pricing table when absent.
    pub cost: Option<f64>,
    pub metadata: serde_json::Value,
    pub parameters: serde_json::Value,
}

/// Usage for one embedded skill within a fan-out embedding batch.
#[derive(Clone, Debug)]
pub struct EmbeddingUsageRecord {
    pub skill: String,
    pub model: String,
    pub provider: String,
    pub dimension: u32,
    pub tokens: u64,
}

enum StageUsage {
    None,
    Llm(LlmUsageDescriptor),
    Embedding(Vec<EmbeddingUsageRecord>),
}

/// Caller-owned recording session for one run. Returned by
/// [`TraceWriter::start`] and threaded through every stage call, so one
/// writer instance per run is a type-level invariant: a stage cannot be
/// recorded before `start`, and no call is possible after a terminal
/// transition consumes the session.
///
/// Not for concurrent stage calls: the pipeline is strictly sequential.
pub struct RunSession {
    run_id: RunId,
    stage_starts: HashMap<StageName, (Instant, String)>,
}

impl RunSession {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Mark the start of a stage before handing control to its executor, so
    /// the recorded duration covers the stage's real work rather than only
    /// the recording call.
    pub fn begin_stage(&mut self, stage: StageName) {
        self.stage_starts
            .insert(stage, (Instant::now(), Utc::now().to_rfc3339()));
    }
}

/// Append-only recorder for pipeline runs. One recording call per stage plus
/// run-level start/complete/early-exit/fail.
pub struct TraceWriter {
    runs: RunRepo,
    stages: StageRepo,
}

impl TraceWriter {
    pub fn new(db: Database) -> Self {
        Self {
            runs: RunRepo::new(db.clone()),
            stages: StageRepo::new(db),
        }
    }

    /// Create a pending run and return the session that all subsequent
    /// recording calls are threaded through.
    #[instrument(skip(self, input))]
    pub fn start(
        &self,
        question: &str,
        input: Option<serde_json::Value>,
    ) -> Result<RunSession, RecorderError> {
        let run = self.runs.create(question, input.as_ref())?;
        Ok(RunSession {
            run_id: run.id,
            stage_starts: HashMap::new(),
        })
    }

    pub fn record_question_classification(
        &self,
        session: &mut RunSession,
        input: serde_json::Value,
        output: &ClassificationOutput,
        metrics: Option<serde_json::Value>,
        usage: Option<LlmUsageDescriptor>,
    ) -> Result<StageId, RecorderError> {
        self.record_stage(
            session,
            StageName::QuestionClassification,
            input,
            to_raw(output)?,
            metrics,
            usage.map_or(StageUsage::None, StageUsage::Llm),
        )
    }

    pub fn record_skill_extraction(
        &self,
        session: &mut RunSession,
        input: serde_json::Value,
        output: &SkillExtractionOutput,
        metrics: Option<serde_json::Value>,
        usage: Option<LlmUsageDescriptor>,
    ) -> Result<StageId, RecorderError> {
        self.record_stage(
            session,
            StageName::SkillExtraction,
            input,
            to_raw(output)?,
            metrics,
            usage.map_or(StageUsage::None, StageUsage::Llm),
        )
    }

    /// One logical fan-out execution (one embedding per extracted skill)
    /// persists as a single row carrying the per-skill usage list.
    pub fn record_course_retrieval(
        &self,
        session: &mut RunSession,
        input: serde_json::Value,
        output: &CourseRetrievalOutput,
        metrics: Option<serde_json::Value>,
        usage: Vec<EmbeddingUsageRecord>,
    ) -> Result<StageId, RecorderError> {
        self.record_stage(
            session,
            StageName::CourseRetrieval,
            input,
            to_raw(output)?,
            metrics,
            if usage.is_empty() {
                StageUsage::None
            } else {
                StageUsage::Embedding(usage)
            },
        )
    }

    pub fn record_relevance_filtering(
        &self,
        session: &mut RunSession,
        input: serde_json::Value,
        output: &RelevanceFilteringOutput,
        metrics: Option<serde_json::Value>,
        usage: Option<LlmUsageDescriptor>,
    ) -> Result<StageId, RecorderError> {
        self.record_stage(
            session,
            StageName::RelevanceFiltering,
            input,
            to_raw(output)?,
            metrics,
            usage.map_or(StageUsage::None, StageUsage::Llm),
        )
    }

    /// Purely algorithmic stage: never carries model usage.
    pub fn record_course_relevance_filtering(
        &self,
        session: &mut RunSession,
        input: serde_json::Value,
        output: &CourseRelevanceFilteringOutput,
        metrics: Option<serde_json::Value>,
    ) -> Result<StageId, RecorderError> {
        self.record_stage(
            session,
            StageName::CourseRelevanceFiltering,
            input,
            to_raw(output)?,
            metrics,
            StageUsage::None,
        )
    }

    /// Purely algorithmic stage: never carries model usage.
    pub fn record_course_aggregation(
        &self,
        session: &mut RunSession,
        input: serde_json::Value,
        output: &CourseAggregationOutput,
        metrics: Option<serde_json::Value>,
    ) -> Result<StageId, RecorderError> {
        self.record_stage(
            session,
            StageName::CourseAggregation,
            input,
            to_raw(output)?,
            metrics,
            StageUsage::None,
        )
    }

    pub fn record_answer_generation(
        &self,
        session: &mut RunSession,
        input: serde_json::Value,
        output: &AnswerGenerationOutput,
        metrics: Option<serde_json::Value>,
        usage: Option<LlmUsageDescriptor>,
    ) -> Result<StageId, RecorderError> {
        self.record_stage(
            session,
            StageName::AnswerGeneration,
            input,
            to_raw(output)?,
            metrics,
            usage.map_or(StageUsage::None, StageUsage::Llm),
        )
    }

    /// Persist a stage row for an executor that failed upstream. The run
    /// itself stays pending; the orchestrator decides whether to call
    /// [`TraceWriter::fail`].
    #[instrument(skip(self, session, input, error), fields(run_id = %session.run_id, stage = %stage))]
    pub fn record_failed_stage(
        &self,
        session: &mut RunSession,
        stage: StageName,
        input: serde_json::Value,
        error: StageError,
    ) -> Result<StageId, RecorderError> {
        let (started_instant, started_at) = session
            .stage_starts
            .remove(&stage)
            .unwrap_or_else(|| (Instant::now(), Utc::now().to_rfc3339()));

        let row = self.stages.create(&session.run_id, stage, &input, &started_at)?;
        let duration_ms = started_instant.elapsed().as_secs_f64() * 1000.0;
        self.stages.fail(&row.id, &error, duration_ms)?;
        Ok(row.id)
    }

    /// Transition the run to completed. Consumes the session: the terminal
    /// status can only be set once. The scalar rollups come from the
    /// orchestrator, never derived from the usage table here.
    #[instrument(skip(self, session, output, metrics), fields(run_id = %session.run_id))]
    pub fn complete(
        &self,
        session: RunSession,
        output: serde_json::Value,
        metrics: RunMetrics,
        totals: RunTotals,
    ) -> Result<(), RecorderError> {
        self.runs
            .complete(&session.run_id, &output, &metrics, totals)?;
        Ok(())
    }

    /// Transition the run to early-exit (e.g. the question was out of scope).
    #[instrument(skip(self, session, output), fields(run_id = %session.run_id))]
    pub fn early_exit(
        &self,
        session: RunSession,
        output: Option<serde_json::Value>,
        reason: &str,
    ) -> Result<(), RecorderError> {
        self.runs
            .early_exit(&session.run_id, output.as_ref(), reason)?;
        Ok(())
    }

    /// Transition the run to failed.
    #[instrument(skip(self, session, error), fields(run_id = %session.run_id, code = %error.code))]
    pub fn fail(&self, session: RunSession, error: StageError) -> Result<(), RecorderError> {
        self.runs.fail(&session.run_id, &error)?;
        Ok(())
    }

    fn record_stage(
        &self,
        session: &mut RunSession,
        stage: StageName,
        input: serde_json::Value,
        output_raw: serde_json::Value,
        output_metrics: Option<serde_json::Value>,
        usage: StageUsage,
    ) -> Result<StageId, RecorderError> {
        // Fall back to method entry when the caller never marked the start.
        let (started_instant, started_at) = session
            .stage_starts
            .remove(&stage)
            .unwrap_or_else(|| (Instant::now(), Utc::now().to_rfc3339()));

        let row = self.stages.create(&session.run_id, stage, &input, &started_at)?;

        let (llm, embedding) = match usage {
            StageUsage::None => (None, None),
            StageUsage::Llm(descriptor) => (Some(build_llm_trace(descriptor)), None),
            StageUsage::Embedding(records) => (None, build_embedding_trace(records)),
        };

        let duration_ms = started_instant.elapsed().as_secs_f64() * 1000.0;
        self.stages.complete(
            &row.id,
            &output_raw,
            output_metrics.as_ref(),
            llm.as_ref(),
            embedding.as_ref(),
            duration_ms,
        )?;
        Ok(row.id)
    }
}

fn to_raw<T: serde::Serialize>(output: &T) -> Result<serde_json::Value, RecorderError> {
    serde_json::to_value(output)
        .map_err(|e| RecorderError::Payload(TraceError::Serialization(e.to_string())))
}

fn build_llm_trace(descriptor: LlmUsageDescriptor) -> LlmTrace {
    let system_prompt_hash = format!("{:x}", Sha256::digest(descriptor.system_prompt.as_bytes()));
    let total_tokens = descriptor.input_tokens + descriptor.output_tokens;
    let cost = descriptor.cost.unwrap_or_else(|| {
        pricing::estimate_cost(
            &descriptor.model,
            descriptor.input_tokens,
            descriptor.output_tokens,
        )
    });

    LlmTrace {
        provider: descriptor.provider,
        model: descriptor.model,
        prompt_version: descriptor.prompt_version,
        system_prompt_hash,
        user_prompt: descriptor.user_prompt,
        schema_name: descriptor.schema_name,
        token_usage: TokenUsage {
            input_tokens: descriptor.input_tokens,
            output_tokens: descriptor.output_tokens,
            total_tokens,
        },
        cost,
        full_metadata: descriptor.metadata,
        parameters: descriptor.parameters,
    }
}

/// Model, provider and dimension come from the first record; tokens sum
/// across the batch.
fn build_embedding_trace(records: Vec<EmbeddingUsageRecord>) -> Option<EmbeddingTrace> {
    let first = records.first()?;
    let total_tokens = records.iter().map(|r| r.tokens).sum();

    Some(EmbeddingTrace {
        model: first.model.clone(),
        provider: first.provider.clone(),
        dimension: first.dimension,
        total_tokens,
        skills_count: records.len() as u32,
        by_skill: records
            .into_iter()
            .map(|r| SkillEmbeddingUsage { skill: r.skill, tokens: r.tokens })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skillpath_core::model::RunStatus;
    use skillpath_core::payload::{Course, SkillCourses};
    use skillpath_store::runs::RunRepo;
    use skillpath_store::stages::StageRepo;
    use skillpath_store::StoreError;

    fn writer() -> (TraceWriter, Database) {
        let db = Database::in_memory().unwrap();
        (TraceWriter::new(db.clone()), db)
    }

    fn llm_descriptor() -> LlmUsageDescriptor {
        LlmUsageDescriptor {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            prompt_version: "v3".into(),
            system_prompt: "You are a question classifier.".into(),
            user_prompt: "How do I learn SQL?".into(),
            schema_name: Some("classification".into()),
            input_tokens: 150,
            output_tokens: 75,
            cost: None,
            metadata: json!({"finish_reason": "stop"}),
            parameters: json!({"temperature": 0.0}),
        }
    }

    #[test]
    fn start_creates_pending_run() {
        let (writer, db) = writer();
        let session = writer.start("How do I learn SQL?", None).unwrap();

        let run = RunRepo::new(db).find(session.run_id()).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.question, "How do I learn SQL?");
    }

    #[test]
    fn llm_usage_is_shaped_and_system_prompt_hashed() {
        let (writer, db) = writer();
        let mut session = writer.start("How do I learn SQL?", None).unwrap();

        writer
            .record_question_classification(
                &mut session,
                json!({"question": "How do I learn SQL?"}),
                &ClassificationOutput {
                    category: "course_recommendation".into(),
                    confidence: 0.93,
                    reasoning: None,
                },
                None,
                Some(llm_descriptor()),
            )
            .unwrap();

        let stage = StageRepo::new(db)
            .find_by_name(session.run_id(), StageName::QuestionClassification)
            .unwrap()
            .unwrap();
        let llm = stage.llm.unwrap();
        assert_eq!(llm.token_usage.total_tokens, 225);
        assert!(llm.cost > 0.0);
        assert_eq!(llm.system_prompt_hash.len(), 64);
        assert_ne!(llm.system_prompt_hash, "You are a question classifier.");
        assert_eq!(llm.user_prompt, "How do I learn SQL?");
        assert!(stage.embedding.is_none());
        assert!(stage.duration_ms.is_some());
    }

    #[test]
    fn provider_reported_cost_wins_over_estimate() {
        let (writer, db) = writer();
        let mut session = writer.start("Q", None).unwrap();

        let mut descriptor = llm_descriptor();
        descriptor.cost = Some(0.42);
        writer
            .record_answer_generation(
                &mut session,
                json!({}),
                &AnswerGenerationOutput { answer: "Take SQL 101.".into(), recommended_course_ids: vec![] },
                None,
                Some(descriptor),
            )
            .unwrap();

        let stage = StageRepo::new(db)
            .find_by_name(session.run_id(), StageName::AnswerGeneration)
            .unwrap()
            .unwrap();
        assert_eq!(stage.llm.unwrap().cost, 0.42);
    }

    #[test]
    fn embedding_usage_sums_tokens_across_skills() {
        let (writer, db) = writer();
        let mut session = writer.start("Q", None).unwrap();

        let mut courses_by_skill = SkillCourses::new();
        courses_by_skill.insert(
            "python",
            vec![Course { id: "c1".into(), title: "Python Basics".into(), provider: None, score: Some(0.9) }],
        );
        courses_by_skill.insert(
            "sql",
            vec![Course { id: "c2".into(), title: "SQL Fundamentals".into(), provider: None, score: Some(0.8) }],
        );

        writer
            .record_course_retrieval(
                &mut session,
                json!({"skills": ["python", "sql"]}),
                &CourseRetrievalOutput { courses_by_skill, total_candidates: 2 },
                None,
                vec![
                    EmbeddingUsageRecord {
                        skill: "python".into(),
                        model: "text-embedding-3-small".into(),
                        provider: "openai".into(),
                        dimension: 1536,
                        tokens: 5,
                    },
                    EmbeddingUsageRecord {
                        skill: "sql".into(),
                        model: "text-embedding-3-small".into(),
                        provider: "openai".into(),
                        dimension: 1536,
                        tokens: 6,
                    },
                ],
            )
            .unwrap();

        let stage = StageRepo::new(db)
            .find_by_name(session.run_id(), StageName::CourseRetrieval)
            .unwrap()
            .unwrap();
        let embedding = stage.embedding.unwrap();
        assert_eq!(embedding.total_tokens, 11);
        assert_eq!(embedding.skills_count, 2);
        assert_eq!(embedding.dimension, 1536);
        assert_eq!(embedding.by_skill.len(), 2);
        assert!(stage.llm.is_none());
    }

    #[test]
    fn empty_embedding_batch_leaves_usage_absent() {
        let (writer, db) = writer();
        let mut session = writer.start("Q", None).unwrap();

        writer
            .record_course_retrieval(
                &mut session,
                json!({"skills": []}),
                &CourseRetrievalOutput { courses_by_skill: SkillCourses::new(), total_candidates: 0 },
                None,
                vec![],
            )
            .unwrap();

        let stage = StageRepo::new(db)
            .find_by_name(session.run_id(), StageName::CourseRetrieval)
            .unwrap()
            .unwrap();
        assert!(stage.embedding.is_none());
        assert!(stage.llm.is_none());
    }

    #[test]
    fn begin_stage_extends_measured_duration() {
        let (writer, db) = writer();
        let mut session = writer.start("Q", None).unwrap();

        session.begin_stage(StageName::CourseAggregation);
        std::thread::sleep(std::time::Duration::from_millis(15));
        writer
            .record_course_aggregation(
                &mut session,
                json!({}),
                &CourseAggregationOutput { selected_by_skill: SkillCourses::new(), total_selected: 0 },
                None,
            )
            .unwrap();

        let stage = StageRepo::new(db)
            .find_by_name(session.run_id(), StageName::CourseAggregation)
            .unwrap()
            .unwrap();
        assert!(stage.duration_ms.unwrap() >= 10.0);
    }

    #[test]
    fn failed_stage_row_keeps_run_pending() {
        let (writer, db) = writer();
        let mut session = writer.start("Q", None).unwrap();

        writer
            .record_failed_stage(
                &mut session,
                StageName::SkillExtraction,
                json!({"question": "Q"}),
                StageError::new("LLM_ERROR", "rate limited"),
            )
            .unwrap();

        let run = RunRepo::new(db.clone()).find(session.run_id()).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        let stage = StageRepo::new(db)
            .find_by_name(session.run_id(), StageName::SkillExtraction)
            .unwrap()
            .unwrap();
        assert_eq!(stage.error.unwrap().code, "LLM_ERROR");
    }

    #[test]
    fn complete_consumes_session_and_sets_supplied_totals() {
        let (writer, db) = writer();
        let session = writer.start("Q", None).unwrap();
        let run_id = session.run_id().clone();

        writer
            .complete(
                session,
                json!({"answer": "Take SQL 101."}),
                RunMetrics::default(),
                RunTotals { duration_ms: 900.0, tokens: 225, cost: 0.0002 },
            )
            .unwrap();

        let run = RunRepo::new(db).find(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_tokens, Some(225));
        assert_eq!(run.total_cost, Some(0.0002));
    }

    #[test]
    fn second_terminal_transition_is_a_conflict() {
        let (writer, db) = writer();
        let session = writer.start("Q", None).unwrap();
        let run_id = session.run_id().clone();
        writer.fail(session, StageError::new("UPSTREAM", "boom")).unwrap();

        // A second session for the same run cannot be constructed through the
        // API; simulate a stale duplicate via the repo to check the guard.
        let result = RunRepo::new(db).fail(&run_id, &StageError::new("UPSTREAM", "boom"));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }
}
