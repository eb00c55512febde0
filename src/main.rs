//! viralign - alignment pipeline coordinator
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use viralign::config::{CliArgs, PipelineConfig};
use viralign::pipeline::{Pipeline, PipelineEvent, PipelineState};
use viralign::progress::{print_header, print_summary, ProgressReporter};
use viralign::queue::{RedisQueue, RedisQueueConfig};
use viralign::stages::{Aligner, GeneCounter, PushToolAligner, QueueAligner, SampleSeparator};
use viralign::PipelineError;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit status after a second Ctrl+C
const FORCED_EXIT_CODE: i32 = 130;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = PipelineConfig::from_args(args).context("Invalid configuration")?;

    if config.show_progress {
        print_header(&config);
    }

    // Setup signal handler for graceful shutdown
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        if shutdown_flag.swap(true, Ordering::SeqCst) {
            eprintln!("\nForced exit");
            std::process::exit(FORCED_EXIT_CODE);
        }
        eprintln!("\nInterrupt received, stopping after the current step (Ctrl+C again to force)...");
    })
    .context("Failed to set signal handler")?;

    // Connect to Redis before doing any work; leftover signals on the
    // completion queue are cleared by the pipeline before dispatch
    let queue_config = RedisQueueConfig::new(&config.redis_addr, &config.queue_name);
    let mut completions = RedisQueue::connect(queue_config.clone())
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_addr))?;

    let mut requeue = if config.barrier.max_requeues > 0 {
        Some(RedisQueue::connect(queue_config.clone()).context("Failed to open requeue connection")?)
    } else {
        None
    };

    let mut separator = SampleSeparator::new(&config.tools.samplesep);
    let mut aggregator = GeneCounter::new(&config.tools.genecount, &config.gtf_file)
        .threads(config.threads)
        .ceph_conf(config.ceph_conf.clone());
    let mut aligner: Box<dyn Aligner> = if config.direct_push {
        info!("Pushing chunk entries directly to {}", config.queue_name);
        let queue = RedisQueue::connect(queue_config).context("Failed to open push connection")?;
        Box::new(QueueAligner::new(queue))
    } else {
        Box::new(PushToolAligner::new(
            &config.tools.push,
            config.redis_addr.clone(),
            &config.queue_name,
        ))
    };

    let mut pipeline = Pipeline::from_config(
        &config,
        &mut separator,
        aligner.as_mut(),
        &mut aggregator,
        &mut completions,
    )
    .with_shutdown(Arc::clone(&shutdown));
    if let Some(queue) = requeue.as_mut() {
        pipeline = pipeline.with_requeue(queue);
    }

    // Create progress reporter
    let progress = if config.show_progress {
        Some(ProgressReporter::new())
    } else {
        None
    };

    let mut on_event = |event: &PipelineEvent| {
        if let Some(ref p) = progress {
            p.handle(event);
        }
    };

    // Run the pipeline
    let mut state = PipelineState::new();
    let result = pipeline.run(&mut state, &mut on_event);

    // Finish progress
    if let Some(ref p) = progress {
        match &result {
            Ok(_) => p.finish("Pipeline completed"),
            Err(PipelineError::Interrupted) => p.finish("Pipeline interrupted"),
            Err(_) => p.finish("Pipeline aborted"),
        }
    }

    let report = match result {
        Ok(report) => report,
        Err(PipelineError::Interrupted) => {
            info!(
                stage = %state.stage(),
                accepted = state.accepted().len(),
                "Run was interrupted; dispatched work is left on the queue"
            );
            return Err(PipelineError::Interrupted.into());
        }
        Err(e) => return Err(e).context("Pipeline failed"),
    };

    // Print summary
    print_summary(&report);

    if !state.skipped().is_empty() {
        info!(skipped = state.skipped().len(), "Some datasets were skipped");
    }

    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("viralign=debug,warn")
    } else {
        EnvFilter::new("viralign=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
