//! Completion barrier
//!
//! Blocks until exactly `expected` completion signals have been popped from
//! the completion queue. Signals arrive in any order from any worker; only
//! their arrival counts. The wait is a bounded poll so that cancellation and
//! the timeouts are checked between pops:
//! - `unit_timeout`: longest gap without a new signal before the barrier
//!   requeues outstanding chunks or gives up
//! - `max_wait`: overall deadline
//! - shutdown flag: set by the Ctrl+C handler
//!
//! Payloads naming a dispatched chunk are used to track which chunks are
//! still outstanding. A further signal for a chunk that already reported is
//! dropped, as is a chunk name this run never dispatched (a late signal from
//! an earlier run). A payload that names no chunk at all is counted, but from
//! then on the barrier can no longer tell what is outstanding and will not
//! requeue.

use crate::config::BarrierConfig;
use crate::dataset::WorkUnit;
use crate::error::{BarrierError, QueueError};
use crate::pipeline::PipelineEvent;
use crate::queue::{CompletionSource, WorkQueue};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shortest pop we issue, so a nearly expired deadline still polls once
const MIN_POLL: Duration = Duration::from_millis(1);

/// Result of a released barrier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierOutcome {
    /// Signals the barrier waited for
    pub expected: u64,
    /// Signals counted (equals `expected` on release)
    pub received: u64,
    /// Repeat signals for finished chunks, dropped
    pub duplicates: u64,
    /// Signals naming chunks outside this run, dropped
    pub foreign: u64,
    /// Work units pushed again
    pub requeued: u64,
    /// Requeue rounds performed
    pub requeue_rounds: u32,
    /// Time spent waiting
    pub elapsed: Duration,
}

/// How a popped payload was accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    Retired,
    Duplicate,
    Foreign,
    Opaque,
}

struct Outstanding {
    unit: WorkUnit,
    remaining: usize,
}

/// Tracks which dispatched chunks have not reported yet
struct UnitTracker {
    outstanding: HashMap<String, Outstanding>,
    retired: HashSet<String>,
    attributable: bool,
}

impl UnitTracker {
    fn new<'u>(units: impl IntoIterator<Item = &'u WorkUnit>) -> Self {
        let mut outstanding: HashMap<String, Outstanding> = HashMap::new();
        for unit in units {
            outstanding
                .entry(unit.obj_name.clone())
                .and_modify(|o| o.remaining += 1)
                .or_insert_with(|| Outstanding {
                    unit: unit.clone(),
                    remaining: 1,
                });
        }
        Self {
            outstanding,
            retired: HashSet::new(),
            attributable: true,
        }
    }

    fn record(&mut self, payload: &str) -> Arrival {
        let name = chunk_name(payload);
        let key = name.clone().unwrap_or_else(|| payload.trim().to_string());

        if let Some(entry) = self.outstanding.get_mut(&key) {
            entry.remaining -= 1;
            if entry.remaining == 0 {
                self.outstanding.remove(&key);
                self.retired.insert(key);
            }
            return Arrival::Retired;
        }

        if self.retired.contains(&key) {
            return Arrival::Duplicate;
        }
        if name.is_some() {
            return Arrival::Foreign;
        }

        self.attributable = false;
        Arrival::Opaque
    }

    /// Outstanding units in name order, one entry per missing signal
    fn outstanding_units(&self) -> Vec<&WorkUnit> {
        let mut units: Vec<&Outstanding> = self.outstanding.values().collect();
        units.sort_by(|a, b| a.unit.obj_name.cmp(&b.unit.obj_name));
        units
            .into_iter()
            .flat_map(|o| std::iter::repeat(&o.unit).take(o.remaining))
            .collect()
    }
}

/// Chunk name carried by a completion payload
///
/// Workers answer with the bare object name; a pushed work unit echoed back
/// is accepted too. Empty text, text with whitespace or control characters,
/// undecodable bytes and any other JSON carry no name.
fn chunk_name(payload: &str) -> Option<String> {
    let trimmed = payload.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        return value.get("obj_name")?.as_str().map(String::from);
    }

    let is_name = !trimmed.is_empty()
        && !trimmed
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == char::REPLACEMENT_CHARACTER);
    is_name.then(|| trimmed.to_string())
}

/// Waits for the completion signals of one run
pub struct CompletionBarrier<'a> {
    source: &'a mut dyn CompletionSource,
    requeue: Option<&'a mut dyn WorkQueue>,
    config: BarrierConfig,
    shutdown: Arc<AtomicBool>,
}

impl<'a> CompletionBarrier<'a> {
    pub fn new(source: &'a mut dyn CompletionSource, config: BarrierConfig) -> Self {
        Self {
            source,
            requeue: None,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue that outstanding units are pushed back onto after a unit timeout
    pub fn with_requeue(mut self, queue: &'a mut dyn WorkQueue) -> Self {
        self.requeue = Some(queue);
        self
    }

    /// Flag that cancels the wait when set
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Block until `expected` signals have been counted
    ///
    /// `units` are the dispatched chunks; they are only used for requeueing
    /// and duplicate detection. With `expected == 0` the source is never
    /// touched.
    pub fn wait<'u>(
        &mut self,
        expected: u64,
        units: impl IntoIterator<Item = &'u WorkUnit>,
        on_event: &mut dyn FnMut(&PipelineEvent),
    ) -> Result<BarrierOutcome, BarrierError> {
        let started = Instant::now();
        let mut outcome = BarrierOutcome {
            expected,
            ..Default::default()
        };

        if expected == 0 {
            info!("No work units dispatched, nothing to wait for");
            return Ok(outcome);
        }

        let mut tracker = UnitTracker::new(units);
        let mut last_signal = started;

        info!(expected, queue = %self.source.name(), "Waiting for completion signals");
        on_event(&PipelineEvent::AwaitingSignals { expected });

        while outcome.received < expected {
            if self.shutdown.load(Ordering::Relaxed) {
                warn!(received = outcome.received, expected, "Barrier cancelled");
                return Err(BarrierError::Cancelled {
                    received: outcome.received,
                    expected,
                });
            }

            let now = Instant::now();

            if let Some(max_wait) = self.config.max_wait {
                if now.duration_since(started) >= max_wait {
                    return Err(BarrierError::DeadlineExceeded {
                        received: outcome.received,
                        expected,
                        max_wait,
                    });
                }
            }

            if let Some(unit_timeout) = self.config.unit_timeout {
                let idle = now.duration_since(last_signal);
                if idle >= unit_timeout {
                    match self.requeue_outstanding(&tracker, outcome.requeue_rounds)? {
                        Some(units) => {
                            outcome.requeue_rounds += 1;
                            outcome.requeued += units as u64;
                            last_signal = now;
                            on_event(&PipelineEvent::Requeued {
                                units,
                                attempt: outcome.requeue_rounds,
                            });
                            continue;
                        }
                        None => {
                            return Err(BarrierError::Stalled {
                                received: outcome.received,
                                expected,
                                waited: idle,
                                requeues: outcome.requeue_rounds,
                            });
                        }
                    }
                }
            }

            let timeout = self.poll_timeout(now, started, last_signal);
            let Some(signal) = self.source.pop(timeout)? else {
                continue;
            };

            match tracker.record(&signal.payload) {
                Arrival::Duplicate => {
                    outcome.duplicates += 1;
                    debug!(payload = %signal.payload, "Dropping duplicate completion signal");
                    on_event(&PipelineEvent::DuplicateSignal {
                        payload: signal.payload,
                    });
                }
                Arrival::Foreign => {
                    outcome.foreign += 1;
                    warn!(payload = %signal.payload, "Dropping completion signal for a chunk this run did not dispatch");
                    on_event(&PipelineEvent::ForeignSignal {
                        payload: signal.payload,
                    });
                }
                Arrival::Retired | Arrival::Opaque => {
                    outcome.received += 1;
                    last_signal = Instant::now();
                    info!(
                        received = outcome.received,
                        expected,
                        payload = %signal.payload,
                        "Chunk aligned"
                    );
                    on_event(&PipelineEvent::SignalReceived {
                        received: outcome.received,
                        expected,
                        payload: signal.payload,
                    });
                }
            }
        }

        outcome.elapsed = started.elapsed();
        info!(
            received = outcome.received,
            duplicates = outcome.duplicates,
            foreign = outcome.foreign,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "All chunks aligned"
        );
        on_event(&PipelineEvent::BarrierReleased {
            received: outcome.received,
        });

        Ok(outcome)
    }

    /// Push outstanding units again; `None` when a requeue is not possible
    fn requeue_outstanding(
        &mut self,
        tracker: &UnitTracker,
        rounds: u32,
    ) -> Result<Option<usize>, BarrierError> {
        if rounds >= self.config.max_requeues || !tracker.attributable {
            return Ok(None);
        }
        let Some(queue) = self.requeue.as_mut() else {
            return Ok(None);
        };

        let units = tracker.outstanding_units();
        if units.is_empty() {
            return Ok(None);
        }

        for unit in &units {
            let payload = unit
                .to_json()
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            queue.push(&payload)?;
        }

        warn!(
            units = units.len(),
            attempt = rounds + 1,
            queue = %queue.name(),
            "No completion signal within unit timeout, requeued outstanding chunks"
        );
        Ok(Some(units.len()))
    }

    /// Next pop timeout, clamped to whichever deadline comes first
    fn poll_timeout(&self, now: Instant, started: Instant, last_signal: Instant) -> Duration {
        let mut timeout = self.config.poll_interval;

        if let Some(unit_timeout) = self.config.unit_timeout {
            let left = unit_timeout.saturating_sub(now.duration_since(last_signal));
            timeout = timeout.min(left);
        }
        if let Some(max_wait) = self.config.max_wait {
            let left = max_wait.saturating_sub(now.duration_since(started));
            timeout = timeout.min(left);
        }

        timeout.max(MIN_POLL)
    }
}
