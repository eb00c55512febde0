//! Configuration types for viralign
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Redis address parsing
//! - Well-known file names shared with the external tools

use crate::error::ConfigError;
use clap::Parser;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Listing written by the separation tool into the working directory
pub const DATASET_LISTING_FILE: &str = "samplesep_datasets.csv";

/// Manifest file name under each separated dataset path
pub const MANIFEST_FILE: &str = "metadata.json";

/// Aggregation input written into the working directory
pub const AGGREGATE_INPUT_FILE: &str = "aligned_datasets.json";

/// Suffix appended to the work queue name to get the completion queue
pub const COMPLETION_QUEUE_SUFFIX: &str = "_return";

/// Default work queue name
pub const DEFAULT_QUEUE_NAME: &str = "queue:viralign";

/// Default chunk size for separated datasets
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Default location of the samplesep binary
pub const DEFAULT_SAMPLESEP_BIN: &str = "./bazel-bin/samplesep/samplesep";

/// Default location of the viralign-push binary
pub const DEFAULT_PUSH_BIN: &str = "./bazel-bin/viralign_push/viralign-push";

/// Default location of the viralign-genecount binary
pub const DEFAULT_GENECOUNT_BIN: &str = "./bazel-bin/viralign_genecount/viralign-genecount";

/// Coordinator for the viralign alignment pipeline
#[derive(Parser, Debug, Clone)]
#[command(
    name = "viralign",
    version,
    about = "Run the viralign pipeline: separate samples, align chunks on the worker pool, count genes",
    long_about = "Runs the viralign pipeline end to end.\n\n\
                  1. samplesep splits the multiplexed FASTQ pair into per-sample chunked datasets\n\
                  2. every dataset is pushed to the Redis work queue for the viralign-core workers\n\
                  3. the coordinator waits for one completion signal per chunk on <queue>_return\n\
                  4. viralign-genecount counts reads per gene over all aligned datasets\n\n\
                  Assumes the Redis server and viralign-core workers are already running.",
    after_help = "EXAMPLES:\n    \
        viralign barcodes.fastq reads.fastq -g genes.gtf\n    \
        viralign barcodes.fastq reads.fastq -g genes.gtf -r redis:6379 -q queue:run42\n    \
        viralign barcodes.fastq reads.fastq -g genes.gtf --unit-timeout 600 --max-requeues 2"
)]
pub struct CliArgs {
    /// The input multiplexed FASTQ dataset barcodes
    #[arg(value_name = "BARCODES")]
    pub barcodes: PathBuf,

    /// The input multiplexed FASTQ dataset reads
    #[arg(value_name = "READS")]
    pub reads: PathBuf,

    /// Barcode file defining sample barcodes
    #[arg(
        short = 'b',
        long,
        default_value = "lib_example_barcode.txt",
        value_name = "FILE"
    )]
    pub barcode_config: PathBuf,

    /// Output dataset chunk size
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHUNK_SIZE, value_name = "NUM")]
    pub chunk_size: usize,

    /// Ceph config file, indicates to use Ceph for IO
    #[arg(short = 'C', long, value_name = "FILE")]
    pub ceph_conf: Option<PathBuf>,

    /// Redis server address for sending work and receiving results
    #[arg(
        short = 'r',
        long,
        env = "VIRALIGN_REDIS_ADDR",
        default_value = "localhost:6379",
        value_name = "HOST:PORT"
    )]
    pub redis_addr: String,

    /// Redis queue name to send work on (results come back on <name>_return)
    #[arg(short = 'q', long, default_value = DEFAULT_QUEUE_NAME, value_name = "NAME")]
    pub queue_name: String,

    /// GTF file defining the genes to map reads to
    #[arg(short = 'g', long, value_name = "FILE")]
    pub gtf_file: Option<PathBuf>,

    /// Output directory, will contain the separated samples
    #[arg(short = 'o', long, default_value = "viralign_out", value_name = "DIR")]
    pub output_dir: String,

    /// Path to the samplesep binary
    #[arg(long, default_value = DEFAULT_SAMPLESEP_BIN, value_name = "PATH")]
    pub samplesep_bin: PathBuf,

    /// Path to the viralign-push binary
    #[arg(long, default_value = DEFAULT_PUSH_BIN, value_name = "PATH")]
    pub push_bin: PathBuf,

    /// Path to the viralign-genecount binary
    #[arg(long, default_value = DEFAULT_GENECOUNT_BIN, value_name = "PATH")]
    pub genecount_bin: PathBuf,

    /// Push chunk entries to Redis directly instead of running viralign-push
    #[arg(long)]
    pub direct_push: bool,

    /// Threads for viralign-genecount I/O
    #[arg(short = 't', long, default_value_t = num_cpus::get(), value_name = "NUM")]
    pub threads: usize,

    /// Seconds to wait for the next completion signal before requeueing or failing (0 = forever)
    #[arg(long, default_value = "1800", value_name = "SECS")]
    pub unit_timeout: u64,

    /// Overall seconds to wait for all completion signals (0 = unlimited)
    #[arg(long, default_value = "0", value_name = "SECS")]
    pub max_wait: u64,

    /// Times outstanding chunks may be requeued after a unit timeout
    #[arg(long, default_value = "1", value_name = "NUM")]
    pub max_requeues: u32,

    /// Milliseconds per blocking pop before checking for shutdown
    #[arg(long, default_value = "1000", value_name = "MS")]
    pub poll_interval: u64,

    /// Suppress the progress display
    #[arg(long)]
    pub no_progress: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Redis server address in `host:port` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisAddr {
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl RedisAddr {
    /// Parse a `host:port` string
    pub fn parse(addr: &str) -> Result<Self, ConfigError> {
        let addr = addr.trim();
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidRedisAddr(addr.to_string()))?;

        if host.is_empty() {
            return Err(ConfigError::InvalidRedisAddr(addr.to_string()));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidRedisAddr(addr.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Connection URL for the redis client
    pub fn to_url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for RedisAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Locations of the external tools
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub samplesep: PathBuf,
    pub push: PathBuf,
    pub genecount: PathBuf,
}

/// Completion barrier timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierConfig {
    /// Longest single blocking pop; shutdown is checked between pops
    pub poll_interval: Duration,

    /// Longest gap between two completion signals (None = wait forever)
    pub unit_timeout: Option<Duration>,

    /// Longest total wait (None = unlimited)
    pub max_wait: Option<Duration>,

    /// How many times outstanding chunks may be pushed again
    pub max_requeues: u32,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            unit_timeout: Some(Duration::from_secs(30 * 60)),
            max_wait: None,
            max_requeues: 1,
        }
    }
}

impl BarrierConfig {
    /// Wait forever for every signal, no requeues
    pub fn unbounded() -> Self {
        Self {
            unit_timeout: None,
            max_wait: None,
            max_requeues: 0,
            ..Default::default()
        }
    }
}

/// Validated runtime configuration for one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Barcodes FASTQ
    pub barcodes: PathBuf,

    /// Reads FASTQ
    pub reads: PathBuf,

    /// Sample barcode definitions
    pub barcode_config: PathBuf,

    /// Records per output chunk
    pub chunk_size: usize,

    /// Optional storage backend config passed to gene counting
    pub ceph_conf: Option<PathBuf>,

    /// Redis server
    pub redis_addr: RedisAddr,

    /// Work queue name
    pub queue_name: String,

    /// Gene annotation file
    pub gtf_file: PathBuf,

    /// Separation output directory, always ends with '/'
    pub output_dir: String,

    /// External tool locations
    pub tools: ToolPaths,

    /// Push chunks directly instead of via viralign-push
    pub direct_push: bool,

    /// Gene counting I/O threads
    pub threads: usize,

    /// Barrier timing
    pub barrier: BarrierConfig,

    /// Show progress
    pub show_progress: bool,
}

impl PipelineConfig {
    /// Create validated configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let redis_addr = RedisAddr::parse(&args.redis_addr)?;

        if args.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(args.chunk_size));
        }

        if args.queue_name.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }

        let gtf_file = args
            .gtf_file
            .ok_or_else(|| ConfigError::MissingRequired("--gtf-file".into()))?;

        for input in [&args.barcodes, &args.reads] {
            if !input.exists() {
                return Err(ConfigError::MissingInput {
                    path: input.clone(),
                });
            }
        }

        if args.poll_interval == 0 {
            return Err(ConfigError::InvalidDuration {
                name: "poll-interval".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let barrier = BarrierConfig {
            poll_interval: Duration::from_millis(args.poll_interval),
            unit_timeout: non_zero_secs(args.unit_timeout),
            max_wait: non_zero_secs(args.max_wait),
            max_requeues: args.max_requeues,
        };

        Ok(Self {
            barcodes: args.barcodes,
            reads: args.reads,
            barcode_config: args.barcode_config,
            chunk_size: args.chunk_size,
            ceph_conf: args.ceph_conf,
            redis_addr,
            queue_name: args.queue_name.trim().to_string(),
            gtf_file,
            output_dir: with_trailing_slash(&args.output_dir),
            tools: ToolPaths {
                samplesep: args.samplesep_bin,
                push: args.push_bin,
                genecount: args.genecount_bin,
            },
            direct_push: args.direct_push,
            threads: args.threads.max(1),
            barrier,
            show_progress: !args.no_progress,
        })
    }

    /// Path of the aggregation input file, in the working directory
    pub fn aggregate_input_path(&self) -> PathBuf {
        PathBuf::from(AGGREGATE_INPUT_FILE)
    }
}

/// Completion queue name for a work queue
pub fn completion_queue_name(queue_name: &str) -> String {
    format!("{}{}", queue_name, COMPLETION_QUEUE_SUFFIX)
}

/// Append a '/' unless the string already ends with one
pub fn with_trailing_slash(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Manifest location for a dataset path prefix
pub fn manifest_path(dataset_path: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", with_trailing_slash(dataset_path), MANIFEST_FILE))
}

/// Directory part of a manifest path, with trailing '/'
pub fn manifest_base(manifest: &Path) -> String {
    let s = manifest.to_string_lossy();
    match s.rfind('/') {
        Some(idx) => s[..=idx].to_string(),
        None => String::new(),
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
