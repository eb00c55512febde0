//! Direct submission onto the work queue
//!
//! Does what `viralign-push` does without the extra process: one `RPUSH` per
//! manifest record carrying `{"obj_name": ..., "pool": ...}`.

use crate::dataset::DatasetDescriptor;
use crate::error::{QueueError, StageResult};
use crate::queue::WorkQueue;
use crate::stages::Aligner;
use tracing::{debug, info};

/// Aligner that pushes work units straight onto a [`WorkQueue`]
pub struct QueueAligner<Q: WorkQueue> {
    queue: Q,
    pushed: u64,
}

impl<Q: WorkQueue> QueueAligner<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue, pushed: 0 }
    }

    /// Work units pushed so far
    pub fn pushed(&self) -> u64 {
        self.pushed
    }

    /// Underlying queue
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn into_inner(self) -> Q {
        self.queue
    }
}

impl<Q: WorkQueue> Aligner for QueueAligner<Q> {
    fn submit(&mut self, dataset: &DatasetDescriptor) -> StageResult<()> {
        for unit in &dataset.units {
            let payload = unit
                .to_json()
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            self.queue.push(&payload)?;
            self.pushed += 1;
            debug!(obj_name = %unit.obj_name, queue = %self.queue.name(), "Pushed work unit");
        }

        info!(
            dataset = %dataset.name,
            units = dataset.units.len(),
            queue = %self.queue.name(),
            "Queued dataset"
        );
        Ok(())
    }
}
