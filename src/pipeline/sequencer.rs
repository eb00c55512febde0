//! Stage sequencer
//!
//! Runs one pipeline pass in strict order:
//! `Separating -> Dispatching -> AwaitingCompletion -> Aggregating -> Done`.
//! Any stage failure moves the run to `Aborted` and nothing after it runs.
//! Aggregation runs even when no work was dispatched.
//!
//! Signals already waiting on the completion queue when dispatch starts
//! cannot belong to this run and are discarded first.

use crate::config::{BarrierConfig, PipelineConfig};
use crate::dataset::read_listing;
use crate::error::{BarrierError, PipelineError, Result};
use crate::pipeline::barrier::{BarrierOutcome, CompletionBarrier};
use crate::pipeline::dispatcher::dispatch;
use crate::pipeline::{PipelineEvent, PipelineState, Stage};
use crate::queue::{CompletionSource, WorkQueue};
use crate::stages::{Aggregator, Aligner, SeparationRequest, Separator};

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Unique id of this run
    pub run_id: Uuid,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Stage the run ended in
    pub final_stage: Stage,

    /// Datasets submitted for alignment
    pub datasets_accepted: usize,

    /// Datasets left out (missing or unreadable manifest)
    pub datasets_skipped: usize,

    /// Work units dispatched
    pub run_total: u64,

    /// Barrier statistics
    pub barrier: BarrierOutcome,

    /// File handed to aggregation
    pub aggregate_input: PathBuf,

    /// Wall time of the run
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.final_stage == Stage::Done
    }
}

/// One pipeline run over a set of stage implementations
pub struct Pipeline<'a> {
    request: SeparationRequest,
    aggregate_input: PathBuf,
    barrier: BarrierConfig,
    separator: &'a mut dyn Separator,
    aligner: &'a mut dyn Aligner,
    aggregator: &'a mut dyn Aggregator,
    completions: &'a mut dyn CompletionSource,
    requeue: Option<&'a mut dyn WorkQueue>,
    shutdown: Arc<AtomicBool>,
}

impl<'a> Pipeline<'a> {
    /// Create a pipeline
    ///
    /// `aggregate_input` is where the accepted manifest list is written
    /// before aggregation runs.
    pub fn new(
        request: SeparationRequest,
        aggregate_input: impl Into<PathBuf>,
        separator: &'a mut dyn Separator,
        aligner: &'a mut dyn Aligner,
        aggregator: &'a mut dyn Aggregator,
        completions: &'a mut dyn CompletionSource,
    ) -> Self {
        Self {
            request,
            aggregate_input: aggregate_input.into(),
            barrier: BarrierConfig::default(),
            separator,
            aligner,
            aggregator,
            completions,
            requeue: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a pipeline using the paths and barrier settings from `config`
    pub fn from_config(
        config: &PipelineConfig,
        separator: &'a mut dyn Separator,
        aligner: &'a mut dyn Aligner,
        aggregator: &'a mut dyn Aggregator,
        completions: &'a mut dyn CompletionSource,
    ) -> Self {
        Self::new(
            SeparationRequest::from_config(config),
            config.aggregate_input_path(),
            separator,
            aligner,
            aggregator,
            completions,
        )
        .barrier_config(config.barrier.clone())
    }

    /// Set barrier timing
    pub fn barrier_config(mut self, config: BarrierConfig) -> Self {
        self.barrier = config;
        self
    }

    /// Queue that stalled chunks are pushed back onto
    pub fn with_requeue(mut self, queue: &'a mut dyn WorkQueue) -> Self {
        self.requeue = Some(queue);
        self
    }

    /// Flag that interrupts the run when set
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run every stage
    ///
    /// `state` must be fresh; a used one is rejected untouched. On failure
    /// it is left in [`Stage::Aborted`] with everything recorded up to the
    /// failing stage.
    pub fn run(
        &mut self,
        state: &mut PipelineState,
        on_event: &mut dyn FnMut(&PipelineEvent),
    ) -> Result<RunReport> {
        if !state.is_fresh() {
            return Err(PipelineError::StateReused {
                stage: state.stage(),
            });
        }
        let started = Instant::now();

        info!(run_id = %state.run_id(), "Starting pipeline run");

        match self.run_stages(state, on_event) {
            Ok(barrier) => Ok(RunReport {
                run_id: state.run_id(),
                started_at: state.started_at(),
                final_stage: state.stage(),
                datasets_accepted: state.accepted().len(),
                datasets_skipped: state.skipped().len(),
                run_total: state.run_total(),
                barrier,
                aggregate_input: self.aggregate_input.clone(),
                duration: started.elapsed(),
            }),
            Err(e) => {
                let failed_in = state.stage();
                if state.enter(Stage::Aborted) {
                    on_event(&PipelineEvent::StageEntered(Stage::Aborted));
                }
                error!(stage = %failed_in, "Pipeline aborted: {}", e);
                Err(e)
            }
        }
    }

    fn run_stages(
        &mut self,
        state: &mut PipelineState,
        on_event: &mut dyn FnMut(&PipelineEvent),
    ) -> Result<BarrierOutcome> {
        on_event(&PipelineEvent::StageEntered(Stage::Separating));
        let listing_path = self
            .separator
            .separate(&self.request)
            .map_err(PipelineError::Separation)?;
        let entries = read_listing(&listing_path)?;
        info!(datasets = entries.len(), listing = %listing_path.display(), "Separation complete");

        self.check_shutdown()?;
        self.discard_stale_signals(on_event)?;
        advance(state, Stage::Dispatching, on_event);
        let summary = dispatch(&entries, &mut *self.aligner, state, on_event)?;
        info!(
            accepted = summary.accepted,
            skipped = summary.skipped,
            run_total = state.run_total(),
            "Dispatch complete"
        );

        self.check_shutdown()?;
        advance(state, Stage::AwaitingCompletion, on_event);
        let outcome = self.await_completion(state, on_event)?;

        self.check_shutdown()?;
        advance(state, Stage::Aggregating, on_event);
        let inputs = state.aggregation_inputs();
        write_aggregate_input(&self.aggregate_input, &inputs)?;
        info!(datasets = inputs.len(), input = %self.aggregate_input.display(), "Wrote aggregation input");
        self.aggregator
            .aggregate(&self.aggregate_input)
            .map_err(PipelineError::Aggregation)?;

        advance(state, Stage::Done, on_event);
        Ok(outcome)
    }

    fn await_completion(
        &mut self,
        state: &PipelineState,
        on_event: &mut dyn FnMut(&PipelineEvent),
    ) -> Result<BarrierOutcome> {
        let mut barrier = CompletionBarrier::new(&mut *self.completions, self.barrier.clone())
            .with_shutdown(Arc::clone(&self.shutdown));
        if let Some(queue) = self.requeue.as_mut() {
            barrier = barrier.with_requeue(&mut **queue);
        }

        let units = state.accepted().iter().flat_map(|d| d.units.iter());
        barrier
            .wait(state.run_total(), units, on_event)
            .map_err(|e| match e {
                BarrierError::Cancelled { .. } => PipelineError::Interrupted,
                other => PipelineError::Barrier(other),
            })
    }

    fn discard_stale_signals(&mut self, on_event: &mut dyn FnMut(&PipelineEvent)) -> Result<()> {
        let discarded = self.completions.discard_pending()?;
        if discarded > 0 {
            warn!(
                discarded,
                queue = %self.completions.name(),
                "Discarded completion signals left over from an earlier run"
            );
            on_event(&PipelineEvent::StaleSignalsDiscarded { count: discarded });
        }
        Ok(())
    }

    fn check_shutdown(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(PipelineError::Interrupted);
        }
        Ok(())
    }
}

fn advance(state: &mut PipelineState, stage: Stage, on_event: &mut dyn FnMut(&PipelineEvent)) {
    if state.enter(stage) {
        info!(stage = %stage, "Entering stage");
        on_event(&PipelineEvent::StageEntered(stage));
    }
}

/// Write the accepted manifest list, replacing any previous file
pub fn write_aggregate_input(path: &Path, manifests: &[String]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, manifests)?;
    writer.flush()?;
    Ok(())
}
