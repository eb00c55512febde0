//! Process-backed stage implementations
//!
//! Each stage is a single-shot invocation of an external binary. Only the
//! exit status and the declared output files are part of the contract.

use crate::config::{RedisAddr, DATASET_LISTING_FILE};
use crate::dataset::DatasetDescriptor;
use crate::error::{StageError, StageResult};
use crate::stages::{Aggregator, Aligner, SeparationRequest, Separator};

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Run a tool to completion and map its exit status
///
/// With `cwd` set the tool runs in that directory instead of ours.
fn run_tool(tool: &Path, args: &[OsString], cwd: Option<&Path>) -> StageResult<()> {
    let tool_name = tool_name(tool);

    debug!(tool = %tool.display(), args = ?args, cwd = ?cwd, "Running tool");

    let mut command = Command::new(tool);
    command.args(args);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let status = command
        .status()
        .map_err(|e| StageError::Spawn {
            tool: tool_name.clone(),
            reason: e.to_string(),
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(StageError::ExitStatus {
            tool: tool_name,
            code: status.code(),
        })
    }
}

fn tool_name(tool: &Path) -> String {
    tool.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| tool.display().to_string())
}

/// Runs `samplesep`
///
/// samplesep writes its dataset listing into its working directory and can
/// exit 0 without writing anything, so a listing left by an earlier run is
/// removed before the tool starts.
pub struct SampleSeparator {
    binary: PathBuf,
    work_dir: Option<PathBuf>,
}

impl SampleSeparator {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: None,
        }
    }

    /// Run samplesep in `dir` instead of the current directory
    ///
    /// Relative input paths in the request are then resolved against `dir`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Where samplesep writes its dataset listing
    pub fn listing_path(&self) -> PathBuf {
        match &self.work_dir {
            Some(dir) => dir.join(DATASET_LISTING_FILE),
            None => PathBuf::from(DATASET_LISTING_FILE),
        }
    }

    fn remove_stale_listing(&self, listing: &Path) -> StageResult<()> {
        match fs::remove_file(listing) {
            Ok(()) => {
                debug!(listing = %listing.display(), "Removed listing from an earlier run");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StageError::StaleOutput {
                path: listing.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn args(request: &SeparationRequest) -> Vec<OsString> {
        vec![
            "-o".into(),
            request.output_dir.clone().into(),
            "-b".into(),
            request.barcode_config.clone().into(),
            "-c".into(),
            request.chunk_size.to_string().into(),
            request.barcodes.clone().into(),
            request.reads.clone().into(),
        ]
    }
}

impl Separator for SampleSeparator {
    fn separate(&mut self, request: &SeparationRequest) -> StageResult<PathBuf> {
        let args = Self::args(request);
        info!(
            barcodes = %request.barcodes.display(),
            reads = %request.reads.display(),
            output_dir = %request.output_dir,
            "Running samplesep"
        );

        let listing = self.listing_path();
        self.remove_stale_listing(&listing)?;

        run_tool(&self.binary, &args, self.work_dir.as_deref())?;

        if !listing.exists() {
            return Err(StageError::MissingOutput {
                tool: tool_name(&self.binary),
                path: listing,
            });
        }

        Ok(listing)
    }
}

/// Submits datasets by running `viralign-push` once per manifest
pub struct PushToolAligner {
    binary: PathBuf,
    redis_addr: RedisAddr,
    queue_name: String,
}

impl PushToolAligner {
    pub fn new(binary: impl Into<PathBuf>, redis_addr: RedisAddr, queue_name: &str) -> Self {
        Self {
            binary: binary.into(),
            redis_addr,
            queue_name: queue_name.to_string(),
        }
    }

    fn args(&self, dataset: &DatasetDescriptor) -> Vec<OsString> {
        vec![
            "-r".into(),
            self.redis_addr.to_string().into(),
            "-q".into(),
            self.queue_name.clone().into(),
            dataset.manifest_path.clone().into(),
        ]
    }
}

impl Aligner for PushToolAligner {
    fn submit(&mut self, dataset: &DatasetDescriptor) -> StageResult<()> {
        info!(
            manifest = %dataset.manifest_path.display(),
            queue = %self.queue_name,
            "Pushing dataset to alignment"
        );
        run_tool(&self.binary, &self.args(dataset), None)
    }
}

/// Runs `viralign-genecount`
pub struct GeneCounter {
    binary: PathBuf,
    gtf_file: PathBuf,
    threads: usize,
    ceph_conf: Option<PathBuf>,
}

impl GeneCounter {
    pub fn new(binary: impl Into<PathBuf>, gtf_file: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            gtf_file: gtf_file.into(),
            threads: 4,
            ceph_conf: None,
        }
    }

    /// Set I/O thread count
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Read aligned chunks from Ceph instead of the filesystem
    pub fn ceph_conf(mut self, conf: Option<PathBuf>) -> Self {
        self.ceph_conf = conf;
        self
    }

    fn args(&self, input: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-g".into(),
            self.gtf_file.clone().into(),
            "-t".into(),
            self.threads.to_string().into(),
        ];
        if let Some(conf) = &self.ceph_conf {
            args.push("-c".into());
            args.push(conf.clone().into());
        }
        args.push(input.as_os_str().to_os_string());
        args
    }
}

impl Aggregator for GeneCounter {
    fn aggregate(&mut self, input: &Path) -> StageResult<()> {
        info!(
            input = %input.display(),
            gtf = %self.gtf_file.display(),
            "Running gene counting"
        );
        run_tool(&self.binary, &self.args(input), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ListingEntry, Manifest};

    fn as_strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn test_samplesep_args() {
        let request = SeparationRequest {
            barcodes: "barcodes.fastq".into(),
            reads: "reads.fastq".into(),
            barcode_config: "lib_example_barcode.txt".into(),
            chunk_size: 50000,
            output_dir: "viralign_out/".into(),
        };
        assert_eq!(
            as_strings(&SampleSeparator::args(&request)),
            vec![
                "-o",
                "viralign_out/",
                "-b",
                "lib_example_barcode.txt",
                "-c",
                "50000",
                "barcodes.fastq",
                "reads.fastq"
            ]
        );
    }

    #[test]
    fn test_push_args() {
        let aligner = PushToolAligner::new(
            "viralign-push",
            RedisAddr::parse("localhost:6379").unwrap(),
            "queue:viralign",
        );
        let entry = ListingEntry {
            name: "S1".into(),
            path: "out/S1/".into(),
        };
        let manifest = Manifest {
            name: None,
            pool: None,
            records: Vec::new(),
        };
        let dataset =
            DatasetDescriptor::from_manifest(&entry, "out/S1/metadata.json".into(), &manifest);

        assert_eq!(
            as_strings(&aligner.args(&dataset)),
            vec!["-r", "localhost:6379", "-q", "queue:viralign", "out/S1/metadata.json"]
        );
    }

    #[test]
    fn test_genecount_args() {
        let counter = GeneCounter::new("viralign-genecount", "genes.gtf").threads(8);
        assert_eq!(
            as_strings(&counter.args(Path::new("aligned_datasets.json"))),
            vec!["-g", "genes.gtf", "-t", "8", "aligned_datasets.json"]
        );

        let counter = counter.ceph_conf(Some("ceph.json".into()));
        assert_eq!(
            as_strings(&counter.args(Path::new("aligned_datasets.json"))),
            vec!["-g", "genes.gtf", "-t", "8", "-c", "ceph.json", "aligned_datasets.json"]
        );
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let err = run_tool(Path::new("/nonexistent/viralign-tool"), &[], None).unwrap_err();
        match err {
            StageError::Spawn { tool, .. } => assert_eq!(tool, "viralign-tool"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_mapping() {
        assert!(run_tool(Path::new("true"), &[], None).is_ok());
        assert!(matches!(
            run_tool(Path::new("false"), &[], None),
            Err(StageError::ExitStatus { code: Some(1), .. })
        ));
    }

    fn separation_request() -> SeparationRequest {
        SeparationRequest {
            barcodes: "b".into(),
            reads: "r".into(),
            barcode_config: "c".into(),
            chunk_size: 1,
            output_dir: "o/".into(),
        }
    }

    /// Shell script standing in for samplesep
    #[cfg(unix)]
    fn fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("samplesep.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_listing_defaults_to_current_dir() {
        let separator = SampleSeparator::new("samplesep");
        assert_eq!(separator.listing_path(), PathBuf::from("samplesep_datasets.csv"));

        let separator = separator.in_dir("/data/run1");
        assert_eq!(
            separator.listing_path(),
            PathBuf::from("/data/run1/samplesep_datasets.csv")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_separator_requires_listing() {
        let dir = tempfile::tempdir().unwrap();
        let mut separator = SampleSeparator::new("true").in_dir(dir.path());

        assert!(matches!(
            separator.separate(&separation_request()),
            Err(StageError::MissingOutput { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_separator_ignores_earlier_listing() {
        let dir = tempfile::tempdir().unwrap();
        let listing = dir.path().join("samplesep_datasets.csv");
        fs::write(&listing, "Name,Path\nOLD,/old/run/OLD/\n").unwrap();

        // Reports an input error but still exits 0
        let tool = fake_tool(dir.path(), "echo 'failed to map input file' >&2\nexit 0");
        let mut separator = SampleSeparator::new(tool).in_dir(dir.path());

        let err = separator.separate(&separation_request()).unwrap_err();
        assert!(matches!(err, StageError::MissingOutput { .. }));
        assert!(!listing.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_separator_reads_listing_from_tool_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).unwrap();

        let tool = fake_tool(dir.path(), "printf 'Name,Path\\n' > samplesep_datasets.csv");
        let mut separator = SampleSeparator::new(tool).in_dir(&work);

        let listing = separator.separate(&separation_request()).unwrap();
        assert_eq!(listing, work.join("samplesep_datasets.csv"));
        assert_eq!(fs::read_to_string(&listing).unwrap(), "Name,Path\n");
    }
}
