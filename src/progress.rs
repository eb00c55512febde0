//! Progress reporting for a pipeline run
//!
//! A spinner while separation and dispatch run, switching to a bar counting
//! completion signals while the barrier waits.

use crate::config::PipelineConfig;
use crate::pipeline::{PipelineEvent, RunReport, Stage};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter fed from pipeline events
pub struct ProgressReporter {
    /// Progress bar
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the display for one pipeline event
    pub fn handle(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StageEntered(stage) => self.set_status(stage_message(*stage)),
            PipelineEvent::StaleSignalsDiscarded { count } => {
                self.bar.println(format!(
                    "  {} {} leftover completion signals",
                    style("discarded").yellow(),
                    format_number(*count)
                ));
            }
            PipelineEvent::DatasetAccepted {
                name,
                work_units,
                run_total,
            } => {
                self.bar.set_message(format!(
                    "Dispatched {} ({} chunks, {} total)",
                    name,
                    format_number(*work_units as u64),
                    format_number(*run_total)
                ));
            }
            PipelineEvent::DatasetSkipped { name, reason } => {
                self.bar
                    .println(format!("  {} {}: {}", style("skipped").yellow(), name, reason));
            }
            PipelineEvent::AwaitingSignals { expected } => self.start_counting(*expected),
            PipelineEvent::SignalReceived { received, .. } => {
                self.bar.set_position(*received);
            }
            PipelineEvent::DuplicateSignal { .. } | PipelineEvent::ForeignSignal { .. } => {}
            PipelineEvent::Requeued { units, attempt } => {
                self.bar.println(format!(
                    "  {} {} stalled chunks (attempt {})",
                    style("requeued").yellow(),
                    format_number(*units as u64),
                    attempt
                ));
            }
            PipelineEvent::BarrierReleased { .. } => {
                self.bar.println(format!("  {}", style("All chunks aligned").green()));
            }
        }
    }

    fn start_counting(&self, expected: u64) {
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks {msg}",
                )
                .expect("Invalid progress template")
                .progress_chars("=> "),
        );
        self.bar.set_length(expected);
        self.bar.set_position(0);
        self.bar.set_message("");
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Separating => "Separating samples...",
        Stage::Dispatching => "Dispatching datasets...",
        Stage::AwaitingCompletion => "Waiting for alignment...",
        Stage::Aggregating => "Counting genes...",
        Stage::Done => "Done",
        Stage::Aborted => "Aborted",
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a summary of the run
pub fn print_summary(report: &RunReport) {
    let barrier = &report.barrier;

    println!();
    println!("{}", style("Pipeline Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Run:").bold(), report.run_id);
    println!(
        "  {} {}",
        style("Started:").bold(),
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "  {} {}",
        style("Datasets:").bold(),
        format_number(report.datasets_accepted as u64)
    );
    if report.datasets_skipped > 0 {
        println!(
            "  {} {}",
            style("Skipped:").yellow().bold(),
            format_number(report.datasets_skipped as u64)
        );
    }
    println!(
        "  {} {}/{}",
        style("Chunks:").bold(),
        format_number(barrier.received),
        format_number(report.run_total)
    );
    if barrier.requeue_rounds > 0 {
        println!(
            "  {} {} chunks in {} rounds ({} duplicate signals)",
            style("Requeued:").yellow().bold(),
            format_number(barrier.requeued),
            barrier.requeue_rounds,
            format_number(barrier.duplicates)
        );
    }
    if barrier.foreign > 0 {
        println!(
            "  {} {} signals for chunks outside this run",
            style("Ignored:").yellow().bold(),
            format_number(barrier.foreign)
        );
    }
    println!(
        "  {} {:.1}s (alignment {:.1}s)",
        style("Duration:").bold(),
        report.duration.as_secs_f64(),
        barrier.elapsed.as_secs_f64()
    );
    println!(
        "  {} {}",
        style("Gene counts from:").bold(),
        report.aggregate_input.display()
    );
    println!();
}

/// Print a header at the start of the run
pub fn print_header(config: &PipelineConfig) {
    println!();
    println!(
        "{} {}",
        style("viralign").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {} + {}",
        style("Input:").bold(),
        config.barcodes.display(),
        config.reads.display()
    );
    println!("  {} {}", style("Output:").bold(), config.output_dir);
    println!(
        "  {} {} ({})",
        style("Queue:").bold(),
        config.queue_name,
        config.redis_addr
    );
    println!("  {} {}", style("GTF:").bold(), config.gtf_file.display());
    println!();
}
