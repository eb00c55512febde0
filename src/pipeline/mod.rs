//! Pipeline coordination
//!
//! This module contains the coordinator proper:
//! - `dispatcher`: turns the separation listing into submitted datasets and
//!   the run total
//! - `barrier`: waits for exactly one completion signal per dispatched unit
//! - `sequencer`: runs separation, dispatch, barrier and aggregation in order
//! - `state`: the per-run state threaded through all of the above

mod barrier;
mod dispatcher;
mod sequencer;
mod state;

pub use barrier::{BarrierOutcome, CompletionBarrier};
pub use dispatcher::{dispatch, DispatchSummary};
pub use sequencer::{Pipeline, RunReport};
pub use state::{PipelineState, Stage};

/// Progress notifications emitted during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The run moved to a new stage
    StageEntered(Stage),

    /// Signals from an earlier run were removed from the completion queue
    StaleSignalsDiscarded { count: u64 },

    /// A dataset was submitted for alignment
    DatasetAccepted {
        name: String,
        work_units: usize,
        run_total: u64,
    },

    /// A dataset was left out of the run
    DatasetSkipped { name: String, reason: String },

    /// The barrier is about to wait for `expected` signals
    AwaitingSignals { expected: u64 },

    /// A completion signal was counted
    SignalReceived {
        received: u64,
        expected: u64,
        payload: String,
    },

    /// A completion signal for an already finished unit was dropped
    DuplicateSignal { payload: String },

    /// A completion signal naming a chunk this run never dispatched was dropped
    ForeignSignal { payload: String },

    /// Outstanding units were pushed onto the work queue again
    Requeued { units: usize, attempt: u32 },

    /// Every expected signal arrived
    BarrierReleased { received: u64 },
}
