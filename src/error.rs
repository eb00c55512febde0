//! Error types for viralign
//!
//! This module defines the error hierarchy for the pipeline coordinator:
//! - Stage errors from the external separation, push and gene-count tools
//! - Manifest and listing errors from the separation output
//! - Queue errors (Redis or in-memory)
//! - Barrier errors (stalls, deadlines, cancellation)
//! - Configuration errors
//!
//! Manifest errors are dataset-recoverable: the dispatcher logs them and
//! skips the dataset. Everything else propagates to the caller and ends the
//! run in the `Aborted` stage.

use crate::pipeline::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The state handed to a run was already used by another run
    #[error("Pipeline state is not fresh (stage '{stage}'); every run needs a new state")]
    StateReused { stage: Stage },

    /// Sample separation failed, nothing was dispatched
    #[error("Separation failed: {0}")]
    Separation(#[source] StageError),

    /// The separation listing could not be read or parsed
    #[error("Separation listing error: {0}")]
    Listing(#[from] ListingError),

    /// A dataset could not be submitted to the worker pool
    #[error("Dispatch failed: {0}")]
    Dispatch(#[source] StageError),

    /// The completion barrier did not release
    #[error("Completion barrier failed: {0}")]
    Barrier(#[from] BarrierError),

    /// Gene counting failed
    #[error("Aggregation failed: {0}")]
    Aggregation(#[source] StageError),

    /// Queue errors outside a specific stage (e.g. clearing the completion queue)
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// I/O errors (aggregation input file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Errors from an external pipeline stage (process or queue backed)
#[derive(Error, Debug)]
pub enum StageError {
    /// The tool process could not be started
    #[error("Failed to run '{tool}': {reason}")]
    Spawn { tool: String, reason: String },

    /// The tool ran but reported failure
    #[error("'{tool}' exited with {}", describe_exit(.code))]
    ExitStatus { tool: String, code: Option<i32> },

    /// The tool succeeded but did not produce its declared output
    #[error("'{tool}' did not produce expected output '{path}'")]
    MissingOutput { tool: String, path: PathBuf },

    /// Output left by an earlier run could not be removed
    #[error("Failed to remove stale output '{path}': {reason}")]
    StaleOutput { path: PathBuf, reason: String },

    /// Queue-backed stage failed to push
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {}", c),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Errors reading a dataset manifest (`metadata.json`)
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Manifest file does not exist
    #[error("Manifest not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Manifest exists but could not be read
    #[error("Failed to read manifest '{path}': {reason}")]
    Read { path: PathBuf, reason: String },

    /// Manifest is not valid JSON
    #[error("Malformed manifest '{path}': {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Manifest has no `records` array
    #[error("Manifest '{path}' has no 'records' array")]
    MissingRecords { path: PathBuf },
}

/// Errors parsing the separation listing (`samplesep_datasets.csv`)
#[derive(Error, Debug)]
pub enum ListingError {
    /// Listing file could not be read
    #[error("Failed to read listing '{path}': {reason}")]
    Read { path: PathBuf, reason: String },

    /// A row is not `Name,Path`
    #[error("Invalid listing row {line}: '{content}' (expected 'Name,Path')")]
    BadRow { line: usize, content: String },
}

/// Queue errors (Redis or in-memory)
#[derive(Error, Debug)]
pub enum QueueError {
    /// Redis connection failed
    #[error("Failed to connect to Redis at '{url}': {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Redis operation failed
    #[error("Redis operation failed: {0}")]
    OperationFailed(String),

    /// Payload could not be encoded
    #[error("Failed to serialize queue payload: {0}")]
    Serialization(String),

    /// In-memory channel has no remaining producers
    #[error("Queue '{name}' disconnected")]
    Disconnected { name: String },
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::OperationFailed(err.to_string())
    }
}

/// Errors from the completion barrier
#[derive(Error, Debug)]
pub enum BarrierError {
    /// No completion signal arrived within the unit timeout and no requeues remain
    #[error(
        "Stalled after {received}/{expected} completion signals: nothing arrived for {:.0}s (requeued {requeues} times)",
        .waited.as_secs_f64()
    )]
    Stalled {
        received: u64,
        expected: u64,
        waited: Duration,
        requeues: u32,
    },

    /// The overall barrier deadline elapsed
    #[error(
        "Deadline of {:.0}s exceeded with {received}/{expected} completion signals",
        .max_wait.as_secs_f64()
    )]
    DeadlineExceeded {
        received: u64,
        expected: u64,
        max_wait: Duration,
    },

    /// Shutdown was requested while waiting
    #[error("Cancelled after {received}/{expected} completion signals")]
    Cancelled { received: u64, expected: u64 },

    /// The completion source failed
    #[error("Completion source failed: {0}")]
    Source(#[from] QueueError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid Redis address
    #[error("Invalid Redis address '{0}': expected <host>:<port>")]
    InvalidRedisAddr(String),

    /// Invalid chunk size
    #[error("Invalid chunk size {0}: must be greater than zero")]
    InvalidChunkSize(usize),

    /// Queue name is empty
    #[error("Queue name must not be empty")]
    EmptyQueueName,

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    /// Invalid duration setting
    #[error("Invalid duration for '{name}': {reason}")]
    InvalidDuration { name: String, reason: String },

    /// Input file missing
    #[error("Input file '{path}' does not exist")]
    MissingInput { path: PathBuf },
}

/// Result type alias for PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Result type alias for stage invocations
pub type StageResult<T> = std::result::Result<T, StageError>;
