//! Integration tests for viralign
//!
//! The external tools and the worker pool are replaced by in-process fakes;
//! completion signals travel over the in-memory queue. No Redis server is
//! needed.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use viralign::config::BarrierConfig;
use viralign::dataset::{count_work_units, read_listing, DatasetDescriptor, Manifest, WorkUnit};
use viralign::error::{BarrierError, QueueResult, StageError, StageResult};
use viralign::pipeline::{Pipeline, PipelineEvent, PipelineState, Stage};
use viralign::queue::{CompletionSource, MemoryQueue, MemorySender, WorkQueue};
use viralign::stages::{Aggregator, Aligner, SeparationRequest, Separator};
use viralign::PipelineError;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Separation output laid out the way samplesep writes it
struct Workspace {
    dir: TempDir,
    rows: Vec<(String, PathBuf)>,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempdir().unwrap(),
            rows: Vec::new(),
        }
    }

    /// Add a dataset; `None` leaves its manifest out
    fn dataset(mut self, name: &str, records: Option<usize>) -> Self {
        let path = self.dir.path().join("viralign_out").join(name);
        fs::create_dir_all(&path).unwrap();

        if let Some(n) = records {
            let records: Vec<String> = (0..n)
                .map(|i| {
                    format!(
                        r#"{{"path":"{name}_{first}","first":{first},"last":{last}}}"#,
                        first = i * 100,
                        last = (i + 1) * 100
                    )
                })
                .collect();
            fs::write(
                path.join("metadata.json"),
                format!(
                    r#"{{"name":"{}","columns":["base","qual","meta"],"records":[{}]}}"#,
                    name,
                    records.join(",")
                ),
            )
            .unwrap();
        }

        self.rows.push((name.to_string(), path));
        self
    }

    fn listing_path(&self) -> PathBuf {
        self.dir.path().join("samplesep_datasets.csv")
    }

    fn aggregate_input(&self) -> PathBuf {
        self.dir.path().join("aligned_datasets.json")
    }

    fn write_listing(&self) {
        let mut listing = String::from("Name,Path\n");
        for (name, path) in &self.rows {
            listing.push_str(&format!("{},{}/\n", name, path.display()));
        }
        fs::write(self.listing_path(), listing).unwrap();
    }

    fn manifest(&self, name: &str) -> String {
        let (_, path) = self.rows.iter().find(|(n, _)| n == name).unwrap();
        format!("{}/metadata.json", path.display())
    }

    fn aggregated(&self) -> Vec<String> {
        serde_json::from_str(&fs::read_to_string(self.aggregate_input()).unwrap()).unwrap()
    }
}

fn request() -> SeparationRequest {
    SeparationRequest {
        barcodes: "barcodes.fastq".into(),
        reads: "reads.fastq".into(),
        barcode_config: "lib_example_barcode.txt".into(),
        chunk_size: 100,
        output_dir: "viralign_out/".into(),
    }
}

fn test_barrier() -> BarrierConfig {
    BarrierConfig {
        poll_interval: Duration::from_millis(10),
        unit_timeout: Some(Duration::from_millis(300)),
        max_wait: Some(Duration::from_secs(10)),
        max_requeues: 0,
    }
}

/// Separator that "writes" the listing by having it prepared up front
struct FakeSeparator {
    listing: PathBuf,
    fail: bool,
    calls: usize,
}

impl FakeSeparator {
    fn new(workspace: &Workspace) -> Self {
        workspace.write_listing();
        Self {
            listing: workspace.listing_path(),
            fail: false,
            calls: 0,
        }
    }

    fn failing() -> Self {
        Self {
            listing: PathBuf::from("samplesep_datasets.csv"),
            fail: true,
            calls: 0,
        }
    }
}

impl Separator for FakeSeparator {
    fn separate(&mut self, _request: &SeparationRequest) -> StageResult<PathBuf> {
        self.calls += 1;
        if self.fail {
            return Err(StageError::ExitStatus {
                tool: "samplesep".into(),
                code: Some(1),
            });
        }
        Ok(self.listing.clone())
    }
}

/// Worker pool that finishes every chunk the moment it is submitted
struct InstantWorkers {
    completions: MemorySender,
    submitted: Vec<String>,
    /// Chunks per dataset that never report back
    withhold: usize,
}

impl InstantWorkers {
    fn new(completions: &MemoryQueue) -> Self {
        Self {
            completions: completions.sender(),
            submitted: Vec::new(),
            withhold: 0,
        }
    }
}

impl Aligner for InstantWorkers {
    fn submit(&mut self, dataset: &DatasetDescriptor) -> StageResult<()> {
        self.submitted.push(dataset.name.clone());
        let finished = dataset.units.len().saturating_sub(self.withhold);
        for unit in &dataset.units[..finished] {
            self.completions.send(unit.obj_name.clone());
        }
        Ok(())
    }
}

/// Worker pool where each dataset is processed on its own thread, in
/// reverse chunk order
struct ThreadedWorkers {
    completions: MemorySender,
    handles: Vec<JoinHandle<()>>,
}

impl Aligner for ThreadedWorkers {
    fn submit(&mut self, dataset: &DatasetDescriptor) -> StageResult<()> {
        let sender = self.completions.clone();
        let names: Vec<String> = dataset.units.iter().map(|u| u.obj_name.clone()).collect();
        self.handles.push(thread::spawn(move || {
            for name in names.into_iter().rev() {
                thread::sleep(Duration::from_millis(5));
                sender.send(name);
            }
        }));
        Ok(())
    }
}

/// Work queue whose workers answer each requeued chunk twice (the requeued
/// copy plus the original straggler)
struct StragglerWorkers {
    completions: MemorySender,
    requeued: Vec<String>,
}

impl WorkQueue for StragglerWorkers {
    fn name(&self) -> &str {
        "queue:viralign"
    }

    fn push(&mut self, payload: &str) -> QueueResult<()> {
        let unit: WorkUnit = serde_json::from_str(payload).unwrap();
        self.completions.send(unit.obj_name.clone());
        self.completions.send(unit.obj_name.clone());
        self.requeued.push(unit.obj_name);
        Ok(())
    }
}

#[derive(Default)]
struct FakeAggregator {
    inputs: Vec<Vec<String>>,
    fail: bool,
}

impl Aggregator for FakeAggregator {
    fn aggregate(&mut self, input: &Path) -> StageResult<()> {
        let list: Vec<String> = serde_json::from_str(&fs::read_to_string(input).unwrap()).unwrap();
        self.inputs.push(list);
        if self.fail {
            return Err(StageError::ExitStatus {
                tool: "viralign-genecount".into(),
                code: Some(3),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_two_datasets_wait_for_all_chunks() {
    let ws = Workspace::new().dataset("S1", Some(3)).dataset("S2", Some(5));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    let mut aggregator = FakeAggregator::default();

    let mut signals = 0;
    let mut state = PipelineState::new();
    let report = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |e: &PipelineEvent| {
        if matches!(e, PipelineEvent::SignalReceived { .. }) {
            signals += 1;
        }
    })
    .unwrap();

    assert_eq!(report.run_total, 8);
    assert_eq!(report.barrier.received, 8);
    assert_eq!(report.final_stage, Stage::Done);
    assert_eq!(signals, 8);
    assert_eq!(aligner.submitted, vec!["S1", "S2"]);
    assert_eq!(completions.popped(), 8);
    assert!(completions.is_empty());
    assert_eq!(
        aggregator.inputs,
        vec![vec![ws.manifest("S1"), ws.manifest("S2")]]
    );
}

#[test]
fn test_missing_manifest_is_skipped() {
    let ws = Workspace::new().dataset("S1", Some(2)).dataset("S2", None);

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    let mut aggregator = FakeAggregator::default();

    let mut state = PipelineState::new();
    let report = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap();

    assert_eq!(report.run_total, 2);
    assert_eq!(report.datasets_accepted, 1);
    assert_eq!(report.datasets_skipped, 1);
    assert_eq!(aligner.submitted, vec!["S1"]);
    assert_eq!(state.skipped()[0].name, "S2");
    assert_eq!(ws.aggregated(), vec![ws.manifest("S1")]);
}

#[test]
fn test_separation_failure_skips_everything() {
    let mut completions = MemoryQueue::new("queue:viralign_return");
    WorkQueue::push(&mut completions, "stale").unwrap();

    let dir = tempdir().unwrap();
    let mut separator = FakeSeparator::failing();
    let mut aligner = InstantWorkers::new(&completions);
    let mut aggregator = FakeAggregator::default();

    let mut state = PipelineState::new();
    let err = Pipeline::new(
        request(),
        dir.path().join("aligned_datasets.json"),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap_err();

    assert!(matches!(err, PipelineError::Separation(_)));
    assert_eq!(separator.calls, 1);
    assert_eq!(state.stage(), Stage::Aborted);
    assert!(aligner.submitted.is_empty());
    assert!(aggregator.inputs.is_empty());
    assert_eq!(completions.len(), 1);
    assert!(!dir.path().join("aligned_datasets.json").exists());
}

#[test]
fn test_all_manifests_missing_still_aggregates() {
    let ws = Workspace::new().dataset("S1", None).dataset("S2", None);

    let mut completions = MemoryQueue::new("queue:viralign_return");
    WorkQueue::push(&mut completions, "stale").unwrap();
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    let mut aggregator = FakeAggregator::default();

    let mut state = PipelineState::new();
    let report = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap();

    assert_eq!(report.run_total, 0);
    assert!(report.succeeded());
    assert!(aligner.submitted.is_empty());
    assert_eq!(aggregator.inputs, vec![Vec::<String>::new()]);
    // The barrier never touched the completion queue
    assert_eq!(completions.len(), 1);
}

#[test]
fn test_aggregation_failure_aborts() {
    let ws = Workspace::new().dataset("S1", Some(1));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    let mut aggregator = FakeAggregator {
        fail: true,
        ..Default::default()
    };

    let mut state = PipelineState::new();
    let err = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap_err();

    assert!(matches!(err, PipelineError::Aggregation(_)));
    assert_eq!(state.stage(), Stage::Aborted);
    assert_eq!(aggregator.inputs.len(), 1);
}

// ---------------------------------------------------------------------------
// Barrier behaviour through the full pipeline
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_workers_out_of_order() {
    let ws = Workspace::new()
        .dataset("S1", Some(4))
        .dataset("S2", Some(6))
        .dataset("S3", Some(2));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = ThreadedWorkers {
        completions: completions.sender(),
        handles: Vec::new(),
    };
    let mut aggregator = FakeAggregator::default();

    let mut payloads = Vec::new();
    let mut state = PipelineState::new();
    let report = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |e: &PipelineEvent| {
        if let PipelineEvent::SignalReceived { payload, .. } = e {
            payloads.push(payload.clone());
        }
    })
    .unwrap();

    for handle in aligner.handles {
        handle.join().unwrap();
    }

    assert_eq!(report.barrier.received, 12);
    let unique: HashSet<&String> = payloads.iter().collect();
    assert_eq!(unique.len(), 12);
    assert_eq!(aggregator.inputs.len(), 1);
}

#[test]
fn test_missing_signal_never_releases() {
    let ws = Workspace::new().dataset("S1", Some(3)).dataset("S2", Some(2));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    aligner.withhold = 1;
    let mut aggregator = FakeAggregator::default();

    let mut released = false;
    let mut state = PipelineState::new();
    let err = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |e: &PipelineEvent| {
        if matches!(e, PipelineEvent::BarrierReleased { .. }) {
            released = true;
        }
    })
    .unwrap_err();

    match err {
        PipelineError::Barrier(BarrierError::Stalled {
            received, expected, ..
        }) => {
            assert_eq!(received, 3);
            assert_eq!(expected, 5);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!released);
    assert_eq!(state.stage(), Stage::Aborted);
    assert!(aggregator.inputs.is_empty());
}

#[test]
fn test_requeue_recovers_lost_chunks() {
    let ws = Workspace::new().dataset("S1", Some(3)).dataset("S2", Some(2));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    aligner.withhold = 1;
    let mut workers = StragglerWorkers {
        completions: completions.sender(),
        requeued: Vec::new(),
    };
    let mut aggregator = FakeAggregator::default();

    let config = BarrierConfig {
        unit_timeout: Some(Duration::from_millis(100)),
        max_requeues: 1,
        ..test_barrier()
    };

    let mut state = PipelineState::new();
    let report = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(config)
    .with_requeue(&mut workers)
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap();

    assert_eq!(workers.requeued.len(), 2);
    assert!(workers.requeued.iter().any(|n| n.ends_with("S1_200")));
    assert!(workers.requeued.iter().any(|n| n.ends_with("S2_100")));
    assert_eq!(report.barrier.received, 5);
    assert_eq!(report.barrier.requeue_rounds, 1);
    assert!(report.barrier.duplicates >= 1);
    assert!(report.succeeded());
}

#[test]
fn test_leftover_signal_does_not_complete_a_chunk() {
    let ws = Workspace::new().dataset("S1", Some(2));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    completions.sender().send("chunk finished");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    aligner.withhold = 1;
    let mut aggregator = FakeAggregator::default();

    let mut state = PipelineState::new();
    let err = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap_err();

    match err {
        PipelineError::Barrier(BarrierError::Stalled {
            received, expected, ..
        }) => {
            assert_eq!(received, 1);
            assert_eq!(expected, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(aggregator.inputs.is_empty());
}

#[test]
fn test_second_run_after_requeue_waits_for_its_own_chunks() {
    let first_ws = Workspace::new().dataset("S1", Some(3)).dataset("S2", Some(2));
    let second_ws = Workspace::new().dataset("S3", Some(1));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut aggregator = FakeAggregator::default();

    // First run requeues two chunks; the workers answer each twice
    let mut separator = FakeSeparator::new(&first_ws);
    let mut aligner = InstantWorkers::new(&completions);
    aligner.withhold = 1;
    let mut workers = StragglerWorkers {
        completions: completions.sender(),
        requeued: Vec::new(),
    };
    let mut state = PipelineState::new();
    let first = Pipeline::new(
        request(),
        first_ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(BarrierConfig {
        unit_timeout: Some(Duration::from_millis(100)),
        max_requeues: 1,
        ..test_barrier()
    })
    .with_requeue(&mut workers)
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap();
    assert!(first.succeeded());
    assert!(!completions.is_empty());

    // Second run on the same queue; its only chunk never finishes
    let mut separator = FakeSeparator::new(&second_ws);
    let mut aligner = InstantWorkers::new(&completions);
    aligner.withhold = 1;
    let mut discarded = 0;
    let mut released = false;
    let mut state = PipelineState::new();
    let err = Pipeline::new(
        request(),
        second_ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(test_barrier())
    .run(&mut state, &mut |e: &PipelineEvent| match e {
        PipelineEvent::StaleSignalsDiscarded { count } => discarded += count,
        PipelineEvent::BarrierReleased { .. } => released = true,
        _ => {}
    })
    .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Barrier(BarrierError::Stalled { received: 0, expected: 1, .. })
    ));
    assert!(discarded > 0);
    assert!(!released);
    assert_eq!(aggregator.inputs.len(), 1);
}

#[test]
fn test_interrupt_while_waiting() {
    let ws = Workspace::new().dataset("S1", Some(2));

    let mut completions = MemoryQueue::new("queue:viralign_return");
    let mut separator = FakeSeparator::new(&ws);
    let mut aligner = InstantWorkers::new(&completions);
    aligner.withhold = 2;
    let mut aggregator = FakeAggregator::default();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::SeqCst);
    });

    let mut state = PipelineState::new();
    let err = Pipeline::new(
        request(),
        ws.aggregate_input(),
        &mut separator,
        &mut aligner,
        &mut aggregator,
        &mut completions,
    )
    .barrier_config(BarrierConfig {
        poll_interval: Duration::from_millis(10),
        ..BarrierConfig::unbounded()
    })
    .with_shutdown(shutdown)
    .run(&mut state, &mut |_: &PipelineEvent| {})
    .unwrap_err();

    interrupter.join().unwrap();

    assert!(matches!(err, PipelineError::Interrupted));
    assert_eq!(state.stage(), Stage::Aborted);
    assert_eq!(state.run_total(), 2);
    assert!(aggregator.inputs.is_empty());
}

// ---------------------------------------------------------------------------
// Separation output parsing
// ---------------------------------------------------------------------------

#[test]
fn test_counter_matches_record_count() {
    let ws = Workspace::new()
        .dataset("A", Some(0))
        .dataset("B", Some(1))
        .dataset("C", Some(42));

    let count = |name: &str| count_work_units(&Manifest::load(Path::new(&ws.manifest(name))).unwrap());
    assert_eq!(count("A"), 0);
    assert_eq!(count("B"), 1);
    assert_eq!(count("C"), 42);
}

#[test]
fn test_listing_round_trip_from_workspace() {
    let ws = Workspace::new().dataset("S1", Some(1)).dataset("S2", None);
    ws.write_listing();

    let entries = read_listing(&ws.listing_path()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "S1");
    assert!(entries[1].path.ends_with("S2/"));
}

#[test]
fn test_memory_queue_as_completion_source() {
    let mut queue = MemoryQueue::new("queue:viralign_return");
    let sender = queue.sender();
    assert!(sender.send("chunk"));

    let signal = CompletionSource::pop(&mut queue, Duration::from_millis(50))
        .unwrap()
        .unwrap();
    assert_eq!(signal.payload, "chunk");
    assert_eq!(signal.queue, "queue:viralign_return");
}
