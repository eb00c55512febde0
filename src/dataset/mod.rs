//! Dataset module for separated sample outputs
//!
//! A dataset is one sample's worth of chunked input written by the
//! separation stage. Its manifest enumerates the chunks, which are the
//! indivisible units of alignment work.

mod listing;
mod manifest;

pub use listing::{parse_listing, read_listing, ListingEntry};
pub use manifest::{count_work_units, Manifest, ManifestRecord, WorkUnit};

use std::path::PathBuf;

/// A dataset accepted for alignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    /// Sample name from the listing
    pub name: String,

    /// Dataset path prefix (trailing '/')
    pub path: String,

    /// Location of the dataset manifest
    pub manifest_path: PathBuf,

    /// Number of chunks
    pub work_units: usize,

    /// Chunk entries, one per manifest record
    pub units: Vec<WorkUnit>,
}

impl DatasetDescriptor {
    /// Create a descriptor from a loaded manifest
    pub fn from_manifest(entry: &ListingEntry, manifest_path: PathBuf, manifest: &Manifest) -> Self {
        let units = manifest.work_units(&manifest_path);
        Self {
            name: entry.name.clone(),
            path: crate::config::with_trailing_slash(&entry.path),
            work_units: count_work_units(manifest),
            manifest_path,
            units,
        }
    }
}

/// A dataset excluded from the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDataset {
    /// Sample name from the listing
    pub name: String,

    /// Manifest that could not be used
    pub manifest_path: PathBuf,

    /// Why it was skipped
    pub reason: String,
}
