use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run. Transitions only from `Pending` to one of the
/// terminal states; terminal once set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Completed,
    EarlyExit,
    Failed,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::EarlyExit => write!(f, "early_exit"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "early_exit" => Ok(Self::EarlyExit),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One usage record from a single model invocation within a stage. The
/// category key in [`RunMetrics::usage`] tells LLM and embedding records
/// apart; the record itself carries only raw numbers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageUsageRecord {
    pub model: String,
    pub provider: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: u64,
    pub cost: Option<f64>,
}

/// Run-level metrics bundle persisted at completion. The detailed usage table
/// is the source the analytics engine recomputes rollups from; the writer
/// never derives run totals from it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Per-stage wall time in milliseconds, keyed by stage name.
    #[serde(default)]
    pub timings: BTreeMap<String, f64>,
    /// Per-stage usage records, keyed by category (stage-name string).
    #[serde(default)]
    pub usage: BTreeMap<String, Vec<StageUsageRecord>>,
    /// Simple counts (skills extracted, courses retrieved, ...).
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}

/// Scalar rollups supplied by the orchestrator at `complete`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RunTotals {
    pub duration_ms: f64,
    pub tokens: u64,
    pub cost: f64,
}

/// Token counts for one LLM invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// LLM usage metadata attached to a stage. The raw system prompt is never
/// persisted; only its sha256 hex digest and the verbatim user prompt are.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmTrace {
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    pub system_prompt_hash: String,
    pub user_prompt: String,
    pub schema_name: Option<String>,
    pub token_usage: TokenUsage,
    pub cost: f64,
    pub full_metadata: serde_json::Value,
    pub parameters: serde_json::Value,
}

/// Tokens spent embedding one skill's query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillEmbeddingUsage {
    pub skill: String,
    pub tokens: u64,
}

/// Embedding usage metadata attached to a stage; mutually exclusive with
/// [`LlmTrace`] per stage. One logical fan-out execution persists as a single
/// record carrying the per-skill breakdown.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingTrace {
    pub model: String,
    pub provider: String,
    pub dimension: u32,
    pub total_tokens: u64,
    pub by_skill: Vec<SkillEmbeddingUsage>,
    pub skills_count: u32,
}

/// Structured error persisted on a run or stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageError {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl StageError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_display_and_from_str_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Completed,
            RunStatus::EarlyExit,
            RunStatus::Failed,
            RunStatus::Timeout,
        ] {
            let parsed = RunStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn pending_is_the_only_non_terminal_status() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::EarlyExit.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(RunStatus::from_str("running").is_err());
    }

    #[test]
    fn run_metrics_defaults_on_missing_fields() {
        let metrics: RunMetrics = serde_json::from_str("{}").unwrap();
        assert!(metrics.timings.is_empty());
        assert!(metrics.usage.is_empty());
        assert!(metrics.counts.is_empty());
    }

    #[test]
    fn usage_record_serde_roundtrip() {
        let record = StageUsageRecord {
            model: "gpt-4o-mini".into(),
            provider: "openai".into(),
            input_tokens: Some(150),
            output_tokens: Some(75),
            total_tokens: 225,
            cost: Some(0.0005),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: StageUsageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total_tokens, 225);
        assert_eq!(parsed.input_tokens, Some(150));
    }

    #[test]
    fn stage_error_builder() {
        let err = StageError::new("TIMEOUT", "stage timed out")
            .with_details(serde_json::json!({"elapsed_ms": 30000}));
        assert_eq!(err.code, "TIMEOUT");
        assert!(err.details.is_some());
    }
}
