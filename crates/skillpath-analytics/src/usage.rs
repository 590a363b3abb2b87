//! Cost and token analytics over the persisted per-run usage records.
//!
//! Everything here reads the usage table inside `RunMetrics` (records keyed
//! by category), never the reconstructed business payloads. The scalar
//! rollups on the run row are the writer's view; the breakdowns computed
//! here are independent and may be compared against them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use skillpath_core::ids::RunId;
use skillpath_core::model::{RunMetrics, RunStatus};
use skillpath_store::runs::RunRepo;
use skillpath_store::Database;

use crate::error::AnalyticsError;
use crate::stats::{self, DistributionStats, HistogramBucket};

/// The one usage category produced by embedding calls. Every other category
/// in the usage table is an LLM stage.
pub const EMBEDDING_CATEGORY: &str = "course_retrieval";

/// Tokens and cost split by model family.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub llm_tokens: u64,
    pub llm_cost: f64,
    pub embedding_tokens: u64,
    pub embedding_cost: f64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl CostBreakdown {
    pub fn from_metrics(metrics: &RunMetrics) -> Self {
        let mut breakdown = Self::default();
        for (category, records) in &metrics.usage {
            let tokens: u64 = records.iter().map(|r| r.total_tokens).sum();
            let cost: f64 = records.iter().filter_map(|r| r.cost).sum();
            if category == EMBEDDING_CATEGORY {
                breakdown.embedding_tokens += tokens;
                breakdown.embedding_cost += cost;
            } else {
                breakdown.llm_tokens += tokens;
                breakdown.llm_cost += cost;
            }
        }
        breakdown.total_tokens = breakdown.llm_tokens + breakdown.embedding_tokens;
        breakdown.total_cost = breakdown.llm_cost + breakdown.embedding_cost;
        breakdown
    }

    fn absorb(&mut self, other: &CostBreakdown) {
        self.llm_tokens += other.llm_tokens;
        self.llm_cost += other.llm_cost;
        self.embedding_tokens += other.embedding_tokens;
        self.embedding_cost += other.embedding_cost;
        self.total_tokens += other.total_tokens;
        self.total_cost += other.total_cost;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub tokens: u64,
    pub cost: f64,
}

/// One run's usage at a glance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunUsageSummary {
    pub run_id: RunId,
    pub question: String,
    pub status: RunStatus,
    pub breakdown: CostBreakdown,
    /// Completion time, falling back to start time for non-terminal runs.
    pub timestamp: String,
}

/// Aggregate usage across a set of runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageReport {
    pub run_count: usize,
    pub breakdown: CostBreakdown,
    pub by_category: BTreeMap<String, CategoryTotals>,
    pub cost_stats: DistributionStats,
    pub cost_histogram: Vec<HistogramBucket>,
    pub p50_cost: f64,
    pub p95_cost: f64,
}

/// Usage analytics over the run store.
pub struct UsageAnalytics {
    runs: RunRepo,
}

impl UsageAnalytics {
    pub fn new(db: Database) -> Self {
        Self { runs: RunRepo::new(db) }
    }

    /// Usage summary for one run. `Ok(None)` when the run does not exist; a
    /// run without recorded metrics gets a zero breakdown.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn run_summary(&self, id: &RunId) -> Result<Option<RunUsageSummary>, AnalyticsError> {
        let Some(run) = self.runs.find(id)? else {
            return Ok(None);
        };
        let breakdown = run
            .metrics
            .as_ref()
            .map(CostBreakdown::from_metrics)
            .unwrap_or_default();
        let timestamp = run.completed_at.unwrap_or(run.started_at);
        Ok(Some(RunUsageSummary {
            run_id: run.id,
            question: run.question,
            status: run.status,
            breakdown,
            timestamp,
        }))
    }

    /// Aggregate report across several runs. Missing IDs are skipped; a
    /// request that resolves to no runs at all is an error.
    #[instrument(skip_all, fields(requested = ids.len()))]
    pub fn report(&self, ids: &[RunId]) -> Result<UsageReport, AnalyticsError> {
        let mut combined = CostBreakdown::default();
        let mut by_category: BTreeMap<String, CategoryTotals> = BTreeMap::new();
        let mut costs = Vec::new();
        let mut run_count = 0;

        for id in ids {
            let Some(run) = self.runs.find(id)? else {
                continue;
            };
            run_count += 1;

            let metrics = run.metrics.unwrap_or_default();
            let breakdown = CostBreakdown::from_metrics(&metrics);
            costs.push(breakdown.total_cost);
            combined.absorb(&breakdown);

            for (category, records) in &metrics.usage {
                let entry = by_category.entry(category.clone()).or_default();
                entry.tokens += records.iter().map(|r| r.total_tokens).sum::<u64>();
                entry.cost += records.iter().filter_map(|r| r.cost).sum::<f64>();
            }
        }

        if run_count == 0 {
            return Err(AnalyticsError::EmptyInput(
                "no runs found for usage report".into(),
            ));
        }

        let cost_stats = stats::compute_distribution_stats(&costs);
        let width = (cost_stats.max - cost_stats.min) / 10.0;
        let cost_histogram = stats::histogram(&costs, width);

        costs.sort_by(|a, b| a.total_cmp(b));
        let p50_cost = stats::percentile(&costs, 50.0);
        let p95_cost = stats::percentile(&costs, 95.0);

        Ok(UsageReport {
            run_count,
            breakdown: combined,
            by_category,
            cost_stats,
            cost_histogram,
            p50_cost,
            p95_cost,
        })
    }
}
