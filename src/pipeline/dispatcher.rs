//! Dataset dispatch
//!
//! Walks the separation listing in order, counts each dataset's chunks and
//! submits it. A dataset only joins the run total once its submission has
//! succeeded, so the total always matches what the workers were given.

use crate::config::manifest_path;
use crate::dataset::{DatasetDescriptor, ListingEntry, Manifest, SkippedDataset};
use crate::error::{ManifestError, PipelineError, Result};
use crate::pipeline::{PipelineEvent, PipelineState};
use crate::stages::Aligner;
use tracing::{debug, info, warn};

/// Counts from one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub accepted: usize,
    pub skipped: usize,
    pub work_units: u64,
}

/// Submit every dataset in `entries` that has a usable manifest
///
/// Datasets with a missing or unreadable manifest are recorded as skipped
/// and contribute nothing. A failed submission stops the pass.
pub fn dispatch(
    entries: &[ListingEntry],
    aligner: &mut dyn Aligner,
    state: &mut PipelineState,
    on_event: &mut dyn FnMut(&PipelineEvent),
) -> Result<DispatchSummary> {
    let mut summary = DispatchSummary::default();

    for entry in entries {
        let manifest_path = manifest_path(&entry.path);
        debug!(dataset = %entry.name, manifest = %manifest_path.display(), "Resolving manifest");

        let manifest = match Manifest::load(&manifest_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                let reason = skip_reason(&e);
                warn!(dataset = %entry.name, manifest = %manifest_path.display(), "Skipping dataset: {}", reason);

                on_event(&PipelineEvent::DatasetSkipped {
                    name: entry.name.clone(),
                    reason: reason.clone(),
                });
                state.skip(SkippedDataset {
                    name: entry.name.clone(),
                    manifest_path,
                    reason,
                });
                summary.skipped += 1;
                continue;
            }
        };

        let dataset = DatasetDescriptor::from_manifest(entry, manifest_path, &manifest);
        aligner.submit(&dataset).map_err(PipelineError::Dispatch)?;

        let name = dataset.name.clone();
        let work_units = dataset.work_units;
        state.accept(dataset);
        summary.accepted += 1;
        summary.work_units += work_units as u64;

        info!(dataset = %name, units = work_units, run_total = state.run_total(), "Dataset dispatched");
        on_event(&PipelineEvent::DatasetAccepted {
            name,
            work_units,
            run_total: state.run_total(),
        });
    }

    Ok(summary)
}

fn skip_reason(err: &ManifestError) -> String {
    match err {
        ManifestError::NotFound { .. } => "missing manifest".to_string(),
        other => other.to_string(),
    }
}
