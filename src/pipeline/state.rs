//! Per-run pipeline state

use crate::dataset::{DatasetDescriptor, SkippedDataset};
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Separating,
    Dispatching,
    AwaitingCompletion,
    Aggregating,
    Done,
    Aborted,
}

impl Stage {
    /// Terminal stages end the run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Aborted)
    }

    /// Stage that follows this one on success
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Separating => Some(Stage::Dispatching),
            Stage::Dispatching => Some(Stage::AwaitingCompletion),
            Stage::AwaitingCompletion => Some(Stage::Aggregating),
            Stage::Aggregating => Some(Stage::Done),
            Stage::Done | Stage::Aborted => None,
        }
    }

    /// Whether `to` is a legal transition from this stage
    pub fn can_advance_to(&self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Stage::Aborted || self.next() == Some(to)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Separating => "separating",
            Stage::Dispatching => "dispatching",
            Stage::AwaitingCompletion => "awaiting completion",
            Stage::Aggregating => "aggregating",
            Stage::Done => "done",
            Stage::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// State for one pipeline run
///
/// The run total is only ever changed through [`PipelineState::accept`], so
/// it always equals the sum of work units over the accepted datasets.
#[derive(Debug, Clone)]
pub struct PipelineState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    stage: Stage,
    separation_succeeded: bool,
    accepted: Vec<DatasetDescriptor>,
    skipped: Vec<SkippedDataset>,
    run_total: u64,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            stage: Stage::Separating,
            separation_succeeded: false,
            accepted: Vec::new(),
            skipped: Vec::new(),
            run_total: 0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn separation_succeeded(&self) -> bool {
        self.separation_succeeded
    }

    /// Nothing has happened in this state yet
    pub fn is_fresh(&self) -> bool {
        self.stage == Stage::Separating
            && self.accepted.is_empty()
            && self.skipped.is_empty()
            && self.run_total == 0
    }

    /// Datasets submitted for alignment, in listing order
    pub fn accepted(&self) -> &[DatasetDescriptor] {
        &self.accepted
    }

    /// Datasets excluded from the run
    pub fn skipped(&self) -> &[SkippedDataset] {
        &self.skipped
    }

    /// Total work units across accepted datasets
    pub fn run_total(&self) -> u64 {
        self.run_total
    }

    /// Move to `stage`; returns false (and stays put) on an illegal transition
    pub(crate) fn enter(&mut self, stage: Stage) -> bool {
        if !self.stage.can_advance_to(stage) {
            return false;
        }
        if self.stage == Stage::Separating && stage == Stage::Dispatching {
            self.separation_succeeded = true;
        }
        self.stage = stage;
        true
    }

    /// Record a successfully submitted dataset
    pub(crate) fn accept(&mut self, dataset: DatasetDescriptor) {
        self.run_total += dataset.work_units as u64;
        self.accepted.push(dataset);
    }

    /// Record a dataset that was not submitted
    pub(crate) fn skip(&mut self, dataset: SkippedDataset) {
        self.skipped.push(dataset);
    }

    /// Manifest paths of the accepted datasets, as handed to aggregation
    pub fn aggregation_inputs(&self) -> Vec<String> {
        self.accepted
            .iter()
            .map(|d| d.manifest_path.to_string_lossy().to_string())
            .collect()
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
