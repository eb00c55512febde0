//! viralign - Alignment Pipeline Coordinator
//!
//! Drives the viralign batch pipeline from a single process: separate a
//! multiplexed FASTQ pair into per-sample datasets, hand every chunk to the
//! alignment worker pool over Redis, wait until each chunk has reported
//! back, then run gene counting over everything that was aligned.
//!
//! # Features
//!
//! - **Exact Completion Barrier**: Counts the chunks it dispatched and
//!   releases only after the same number of completion signals, in any
//!   order, from any worker.
//!
//! - **Bounded Waiting**: The barrier polls, so Ctrl+C, a per-chunk stall
//!   timeout and an overall deadline all end the wait with a distinct error.
//!
//! - **Requeue**: Chunks that never report back can be pushed onto the work
//!   queue again; late duplicate signals are not double-counted.
//!
//! - **Pluggable Stages**: Separation, submission and aggregation sit behind
//!   small traits, so the whole coordinator runs against in-process fakes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Stage Sequencer                           │
//! │                                                                   │
//! │  Separating ──► Dispatching ──► AwaitingCompletion ──► Aggregating│
//! │      │              │                   │                   │     │
//! └──────┼──────────────┼───────────────────┼───────────────────┼─────┘
//!        ▼              ▼                   ▲                   ▼
//!   ┌──────────┐   ┌──────────┐      ┌─────────────┐   ┌────────────────┐
//!   │samplesep │   │viralign- │      │ <queue>     │   │viralign-       │
//!   │          │   │push      │      │ _return     │   │genecount       │
//!   └────┬─────┘   └────┬─────┘      └──────▲──────┘   └────────────────┘
//!        │              │ RPUSH             │ RPUSH
//!        ▼              ▼                   │
//!  samplesep_      ┌──────────┐      ┌─────────────┐
//!  datasets.csv    │ <queue>  │ ───► │  Alignment  │
//!  + metadata.json │          │BLPOP │  workers    │
//!                  └──────────┘      └─────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Full run against a local Redis
//! viralign barcodes.fastq reads.fastq -g genes.gtf
//!
//! # Separate queue per run, give up on a chunk after 10 minutes
//! viralign barcodes.fastq reads.fastq -g genes.gtf -q queue:run42 --unit-timeout 600
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod stages;

pub use config::{BarrierConfig, CliArgs, PipelineConfig, RedisAddr};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineEvent, PipelineState, RunReport, Stage};
