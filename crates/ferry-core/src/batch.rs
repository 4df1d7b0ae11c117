//! Batch driver: enumerate candidate files and run each through the scheduler.
//!
//! Files are processed smallest first, ties broken by path. The default is one
//! file at a time; with the `parallel` feature and a parallelism above one,
//! distinct files run on a rayon pool while each file's phases stay sequential.

use crate::scheduler::{FileOutcome, FileReport, PipelineScheduler, SchedulerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Return code of a batch aborted because a worker ignored cancellation.
pub const STUCK_WORKER_EXIT_CODE: i32 = -999;

/// What to do when a worker keeps running after cancellation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StuckWorkerPolicy {
    /// Stop the batch.
    #[default]
    Abort,
    /// Record the file and carry on.
    Continue,
}

/// Batch-wide policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Abort on the first file that does not succeed.
    pub strict: bool,
    /// Maximum files in flight. Only honoured with the `parallel` feature.
    pub parallelism: Option<usize>,
    pub on_stuck_worker: StuckWorkerPolicy,
}

impl BatchOptions {
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_parallelism(mut self, jobs: usize) -> Self {
        self.parallelism = Some(jobs);
        self
    }

    pub fn with_stuck_worker_policy(mut self, policy: StuckWorkerPolicy) -> Self {
        self.on_stuck_worker = policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("source path {0} is neither a file nor a directory")]
    InvalidSource(PathBuf),

    #[error("failed to enumerate {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("strict mode abort on {file} ({outcome}): {reason}")]
    Strict {
        file: String,
        outcome: FileOutcome,
        reason: String,
        summary: BatchSummary,
    },

    #[error("worker for {file} ignored cancellation, aborting batch")]
    StuckWorker { file: String, summary: BatchSummary },
}

impl BatchError {
    /// What was processed before the batch stopped, if anything.
    pub fn summary(&self) -> Option<&BatchSummary> {
        match self {
            BatchError::Strict { summary, .. } | BatchError::StuckWorker { summary, .. } => {
                Some(summary)
            }
            _ => None,
        }
    }
}

/// Reports of every processed file, in processing order.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub reports: Vec<FileReport>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.reports.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(FileOutcome::is_success)
    }

    pub fn failed(&self) -> usize {
        self.count(FileOutcome::is_failure)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| o == FileOutcome::Skipped)
    }

    /// Files whose worker ignored cancellation.
    pub fn stuck(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| r.non_cooperative)
            .map(|r| r.file_name.as_str())
            .collect()
    }

    fn count(&self, pred: impl Fn(FileOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(r.outcome)).count()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} files succeeded",
            self.succeeded(),
            self.total()
        )?;
        if self.skipped() > 0 {
            write!(f, " ({} skipped)", self.skipped())?;
        }
        Ok(())
    }
}

/// Collect the files under `source` whose names end with one of `extensions`.
///
/// A regular file is returned as is. Directories are walked recursively.
/// The result is sorted by size, then by path.
pub fn collect_files(source: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, BatchError> {
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }
    if !source.is_dir() {
        return Err(BatchError::InvalidSource(source.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| BatchError::Walk {
            path: source.to_path_buf(),
            source: e,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
            files.push((size, entry.into_path()));
        }
    }
    files.sort();
    tracing::debug!(source = %source.display(), count = files.len(), ?extensions, "collected files");
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

/// Runs a set of files through one scheduler under a [`BatchOptions`] policy.
#[derive(Debug, Clone)]
pub struct BatchDriver {
    scheduler: Arc<PipelineScheduler>,
    options: BatchOptions,
}

/// Why a report stops the batch, captured from the offending report.
enum Abort {
    Stuck {
        file: String,
    },
    Strict {
        file: String,
        outcome: FileOutcome,
        reason: String,
    },
}

impl Abort {
    fn into_error(self, summary: BatchSummary) -> BatchError {
        match self {
            Abort::Stuck { file } => {
                tracing::error!(file = %file, "timeout with misbehaving worker, aborting batch");
                BatchError::StuckWorker { file, summary }
            }
            Abort::Strict {
                file,
                outcome,
                reason,
            } => {
                tracing::error!(file = %file, %outcome, %reason, "strict mode, aborting batch");
                BatchError::Strict {
                    file,
                    outcome,
                    reason,
                    summary,
                }
            }
        }
    }
}

impl BatchDriver {
    pub fn new(scheduler: Arc<PipelineScheduler>, options: BatchOptions) -> Self {
        Self { scheduler, options }
    }

    pub fn scheduler(&self) -> &PipelineScheduler {
        &self.scheduler
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Enumerate `source` with the plan's extensions and process everything.
    pub fn run(&self, source: &Path, output_dir: &Path) -> Result<BatchSummary, BatchError> {
        let files = collect_files(source, &self.scheduler.plan().source_extensions())?;
        self.run_files(&files, output_dir, |_| {})
    }

    /// Process `files` in order, calling `on_file` after each one.
    pub fn run_files<F>(
        &self,
        files: &[PathBuf],
        output_dir: &Path,
        on_file: F,
    ) -> Result<BatchSummary, BatchError>
    where
        F: Fn(&FileReport) + Sync,
    {
        tracing::info!(
            files = files.len(),
            strict = self.options.strict,
            policy = ?self.options.on_stuck_worker,
            "starting batch"
        );

        #[cfg(feature = "parallel")]
        if self.options.parallelism.is_some_and(|n| n > 1) {
            return self.run_parallel(files, output_dir, &on_file);
        }

        let mut summary = BatchSummary::default();
        for path in files {
            let report = self.scheduler.process_file(path, output_dir)?;
            on_file(&report);
            let abort = self.judge(&report);
            summary.reports.push(report);
            if let Some(abort) = abort {
                return Err(abort.into_error(summary));
            }
        }

        tracing::info!(%summary, "batch finished");
        Ok(summary)
    }

    #[cfg(feature = "parallel")]
    fn run_parallel<F>(
        &self,
        files: &[PathBuf],
        output_dir: &Path,
        on_file: &F,
    ) -> Result<BatchSummary, BatchError>
    where
        F: Fn(&FileReport) + Sync,
    {
        use rayon::prelude::*;
        use std::sync::atomic::{AtomicBool, Ordering};

        let stop = AtomicBool::new(false);
        let process = |path: &PathBuf| -> Option<Result<FileReport, SchedulerError>> {
            if stop.load(Ordering::Acquire) {
                return None;
            }
            let result = self.scheduler.process_file(path, output_dir);
            match &result {
                Ok(report) => {
                    on_file(report);
                    if self.judge(report).is_some() {
                        stop.store(true, Ordering::Release);
                    }
                }
                Err(_) => stop.store(true, Ordering::Release),
            }
            Some(result)
        };

        // Same fallback as an unset limit when the pool cannot be built.
        let pool = self.options.parallelism.and_then(|jobs| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(jobs)
                .thread_name(|i| format!("ferry-file-{i}"))
                .build()
                .ok()
        });
        let results: Vec<Option<Result<FileReport, SchedulerError>>> = match pool {
            Some(pool) => pool.install(|| files.par_iter().map(process).collect()),
            None => files.par_iter().map(process).collect(),
        };

        let mut summary = BatchSummary::default();
        let mut abort = None;
        for result in results.into_iter().flatten() {
            let report = result?;
            // The first offending file in enumeration order names the abort.
            if abort.is_none() {
                abort = self.judge(&report);
            }
            summary.reports.push(report);
        }

        if let Some(abort) = abort {
            return Err(abort.into_error(summary));
        }

        tracing::info!(%summary, "batch finished");
        Ok(summary)
    }

    fn judge(&self, report: &FileReport) -> Option<Abort> {
        if report.non_cooperative && self.options.on_stuck_worker == StuckWorkerPolicy::Abort {
            Some(Abort::Stuck {
                file: report.file_name.clone(),
            })
        } else if self.options.strict && report.outcome.is_failure() {
            Some(Abort::Strict {
                file: report.file_name.clone(),
                outcome: report.outcome,
                reason: report
                    .error
                    .clone()
                    .unwrap_or_else(|| report.outcome.to_string()),
            })
        } else {
            None
        }
    }
}
