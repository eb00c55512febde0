//! External pipeline stages
//!
//! The coordinator does not know how samples are separated, aligned or
//! counted. It talks to each stage through a narrow capability trait whose
//! contract is "inputs in, success or failure out, plus declared side
//! effects". The production implementations run the external tools as
//! processes; tests substitute in-process fakes.

mod process;
mod queue_aligner;

pub use process::{GeneCounter, PushToolAligner, SampleSeparator};
pub use queue_aligner::QueueAligner;

use crate::config::PipelineConfig;
use crate::dataset::DatasetDescriptor;
use crate::error::StageResult;
use std::path::{Path, PathBuf};

/// Inputs for the separation stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparationRequest {
    /// Barcodes FASTQ
    pub barcodes: PathBuf,
    /// Reads FASTQ
    pub reads: PathBuf,
    /// Sample barcode definitions
    pub barcode_config: PathBuf,
    /// Records per chunk
    pub chunk_size: usize,
    /// Output directory, trailing '/'
    pub output_dir: String,
}

impl SeparationRequest {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            barcodes: config.barcodes.clone(),
            reads: config.reads.clone(),
            barcode_config: config.barcode_config.clone(),
            chunk_size: config.chunk_size,
            output_dir: config.output_dir.clone(),
        }
    }
}

/// Splits the multiplexed input into per-sample chunked datasets
pub trait Separator {
    /// Run separation and return the path of the dataset listing it wrote
    fn separate(&mut self, request: &SeparationRequest) -> StageResult<PathBuf>;
}

/// Hands datasets to the alignment worker pool
pub trait Aligner {
    /// Make the dataset's work visible to the workers
    ///
    /// Success means every chunk of the dataset has been queued; the workers
    /// will answer with one completion signal per chunk.
    fn submit(&mut self, dataset: &DatasetDescriptor) -> StageResult<()>;
}

/// Final stage over all aligned datasets
pub trait Aggregator {
    /// Run aggregation over the dataset list stored at `input`
    fn aggregate(&mut self, input: &Path) -> StageResult<()>;
}
