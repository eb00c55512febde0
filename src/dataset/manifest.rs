//! Dataset manifest (`metadata.json`) parsing
//!
//! The separation tool writes one manifest per sample. Its `records` array
//! enumerates the chunks; [`count_work_units`] turns a loaded manifest into
//! the dataset's contribution to the run total.

use crate::config::manifest_base;
use crate::error::ManifestError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One chunk entry of a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestRecord {
    /// Chunk object name, relative to the manifest directory
    pub path: Option<String>,

    /// First record ordinal in the chunk
    pub first: Option<u64>,

    /// One past the last record ordinal
    pub last: Option<u64>,
}

/// A parsed dataset manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Dataset name
    pub name: Option<String>,

    /// Storage pool when chunks live in an object store
    pub pool: Option<String>,

    /// One entry per chunk
    pub records: Vec<ManifestRecord>,
}

/// A single chunk of alignment work, as the workers read it off the queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Full chunk object name
    pub obj_name: String,

    /// Storage pool, empty for filesystem datasets
    pub pool: String,
}

impl WorkUnit {
    /// Serialize to the queue payload format
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Manifest {
    /// Load a manifest file
    ///
    /// Only the `records` array itself is required. Record entries are read
    /// leniently: fields that are missing or of the wrong type are left
    /// empty, so every entry of the array becomes one record.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let value = read_json(path)?;

        let records = match value.get("records") {
            Some(serde_json::Value::Array(records)) => records
                .iter()
                .map(|r| ManifestRecord {
                    path: r.get("path").and_then(|v| v.as_str()).map(String::from),
                    first: r.get("first").and_then(|v| v.as_u64()),
                    last: r.get("last").and_then(|v| v.as_u64()),
                })
                .collect(),
            _ => {
                return Err(ManifestError::MissingRecords {
                    path: path.to_path_buf(),
                })
            }
        };

        Ok(Self {
            name: value.get("name").and_then(|v| v.as_str()).map(String::from),
            pool: value.get("pool").and_then(|v| v.as_str()).map(String::from),
            records,
        })
    }

    /// Work units for every record, named relative to the manifest's directory
    ///
    /// Records without a `path` get a positional name so the unit list always
    /// has exactly one entry per record.
    pub fn work_units(&self, manifest_path: &Path) -> Vec<WorkUnit> {
        let base = manifest_base(manifest_path);
        let pool = self.pool.clone().unwrap_or_default();

        self.records
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                let name = match &record.path {
                    Some(p) => p.clone(),
                    None => format!("chunk_{}", idx),
                };
                WorkUnit {
                    obj_name: format!("{}{}", base, name),
                    pool: pool.clone(),
                }
            })
            .collect()
    }
}

/// Number of work units (chunks) a manifest enumerates
///
/// This is the only count the run total is built from. Record contents are
/// not validated.
pub fn count_work_units(manifest: &Manifest) -> usize {
    manifest.records.len()
}

fn read_json(path: &Path) -> Result<serde_json::Value, ManifestError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ManifestError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ManifestError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        }
    })?;

    serde_json::from_str(&contents).map_err(|e| ManifestError::Malformed {
        path: PathBuf::from(path),
        reason: e.to_string(),
    })
}
