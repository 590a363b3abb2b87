use tracing::instrument;

use skillpath_core::errors::TraceError;
use skillpath_core::ids::RunId;
use skillpath_core::payload::{self, StageOutput};
use skillpath_core::stage::StageName;
use skillpath_store::runs::{RunRepo, RunRow};
use skillpath_store::stages::{StageRepo, StageRow};
use skillpath_store::Database;

use crate::error::RecorderError;

/// One stage of a run, with its payload reconstructed into the typed
/// registry shape. `output` is absent for stages that failed or never
/// completed; the raw row is kept alongside for callers that need the
/// untyped document or usage metadata.
pub struct StageTrace {
    pub row: StageRow,
    pub output: Option<StageOutput>,
}

impl StageTrace {
    fn from_row(row: StageRow) -> Result<Self, RecorderError> {
        let output = match &row.output_raw {
            Some(raw) => Some(payload::parse(row.stage_name, raw)?),
            None => None,
        };
        Ok(Self { row, output })
    }
}

/// A full run reconstruction: the run row plus all its stages in pipeline
/// order.
pub struct RunTrace {
    pub run: RunRow,
    pub stages: Vec<StageTrace>,
}

impl RunTrace {
    /// First execution of the named stage, if recorded.
    pub fn stage(&self, name: StageName) -> Option<&StageTrace> {
        self.stages.iter().find(|s| s.row.stage_name == name)
    }
}

/// Read-side of the trace store. Reconstructs persisted rows into typed
/// payloads; a missing run or stage is a normal outcome, a payload that no
/// longer matches its registered shape is an error.
pub struct TraceReader {
    runs: RunRepo,
    stages: StageRepo,
}

impl TraceReader {
    pub fn new(db: Database) -> Self {
        Self {
            runs: RunRepo::new(db.clone()),
            stages: StageRepo::new(db),
        }
    }

    /// Load a run with all its stages. `Ok(None)` when the run does not
    /// exist.
    #[instrument(skip(self), fields(run_id = %id))]
    pub fn get_run(&self, id: &RunId) -> Result<Option<RunTrace>, RecorderError> {
        let Some(run) = self.runs.find(id)? else {
            return Ok(None);
        };
        let stages = self
            .stages
            .list_for_run(id)?
            .into_iter()
            .map(StageTrace::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(RunTrace { run, stages }))
    }

    /// Load the first execution of one named stage within a run.
    #[instrument(skip(self), fields(run_id = %run_id, stage = %name))]
    pub fn get_stage(
        &self,
        run_id: &RunId,
        name: StageName,
    ) -> Result<Option<StageTrace>, RecorderError> {
        match self.stages.find_by_name(run_id, name)? {
            Some(row) => Ok(Some(StageTrace::from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Deserialize a stage's raw output document straight into a
    /// caller-chosen type, bypassing the registry. For ad-hoc analysis
    /// against historical shapes.
    #[instrument(skip(self), fields(run_id = %run_id, stage = %name))]
    pub fn get_stage_raw_output<T: serde::de::DeserializeOwned>(
        &self,
        run_id: &RunId,
        name: StageName,
    ) -> Result<Option<T>, RecorderError> {
        let Some(row) = self.stages.find_by_name(run_id, name)? else {
            return Ok(None);
        };
        let Some(raw) = row.output_raw else {
            return Ok(None);
        };
        let typed = serde_json::from_value(raw).map_err(|e| {
            RecorderError::Payload(TraceError::Validation {
                stage: name.as_str(),
                detail: e.to_string(),
            })
        })?;
        Ok(Some(typed))
    }

    /// Load several runs at once. Missing IDs are skipped, not errors, so
    /// batch analytics over a partially-pruned store keeps working.
    #[instrument(skip_all, fields(requested = ids.len()))]
    pub fn get_runs(&self, ids: &[RunId]) -> Result<Vec<RunTrace>, RecorderError> {
        let mut traces = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(trace) = self.get_run(id)? {
                traces.push(trace);
            }
        }
        Ok(traces)
    }
}
