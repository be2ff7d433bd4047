//! Feeding per-run observations into the store.
//!
//! Extraction (reading a tracefile or running an external tool per data
//! file) is the expensive, parallel part. Workers pull data files from a
//! shared queue and never touch the store; the calling thread receives
//! their results and performs every merge itself.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CollectError, MergeErrors};
use crate::json::from_json_slice;
use crate::model::FileCoverage;
use crate::store::CoverageStore;

/// Turns one raw coverage data file into file observations.
pub trait Extractor: Sync {
    fn extract(&self, data_file: &Path) -> Result<Vec<FileCoverage>>;
}

/// Reads JSON tracefiles written by [`crate::json::to_json_string`] or gcovr.
pub struct JsonTracefileExtractor {
    config: Config,
}

impl JsonTracefileExtractor {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Extractor for JsonTracefileExtractor {
    fn extract(&self, data_file: &Path) -> Result<Vec<FileCoverage>> {
        let content = std::fs::read(data_file)
            .with_context(|| format!("Failed to read {}", data_file.display()))?;
        let files = from_json_slice(&content, &data_file.display().to_string(), &self.config)
            .with_context(|| format!("Failed to decode {}", data_file.display()))?;
        Ok(files)
    }
}

/// Runs an external program once per data file and decodes its standard
/// output as a JSON tracefile. Every `{}` argument is replaced with the
/// data file path; without one the path is appended.
pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    config: Config,
}

impl CommandExtractor {
    pub fn new<I, S>(program: impl Into<String>, args: I, config: &Config) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            config: config.clone(),
        }
    }

    fn command_for(&self, data_file: &Path) -> Command {
        let path = data_file.display().to_string();
        let mut cmd = Command::new(&self.program);
        if self.args.iter().any(|a| a.contains("{}")) {
            cmd.args(self.args.iter().map(|a| a.replace("{}", &path)));
        } else {
            cmd.args(&self.args).arg(&path);
        }
        cmd
    }
}

impl Extractor for CommandExtractor {
    fn extract(&self, data_file: &Path) -> Result<Vec<FileCoverage>> {
        debug!(program = %self.program, file = %data_file.display(), "running extractor");
        let output = self
            .command_for(data_file)
            .output()
            .with_context(|| format!("Failed to run {}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {} for {}: {}",
                self.program,
                output.status,
                data_file.display(),
                stderr.trim()
            );
        }
        let files = from_json_slice(&output.stdout, &data_file.display().to_string(), &self.config)
            .with_context(|| format!("Failed to decode output of {}", self.program))?;
        Ok(files)
    }
}

/// Read one tracefile and merge it into `store` on the current thread.
pub fn ingest_tracefile(store: &mut CoverageStore, path: &Path, config: &Config) -> Result<()> {
    let files = JsonTracefileExtractor::new(config).extract(path)?;
    debug!(file = %path.display(), files = files.len(), "merging tracefile");
    store
        .merge_all(files)
        .with_context(|| format!("Failed to merge {}", path.display()))?;
    Ok(())
}

/// Extract every data file on `config.jobs` workers and merge the results
/// into a new store.
///
/// The first extraction failure stops workers from picking up new files;
/// files already being extracted finish, then the failure is returned.
/// Merge failures do not stop anything and are returned together.
pub fn collect<E>(
    data_files: &[PathBuf],
    extractor: &E,
    config: &Config,
) -> std::result::Result<CoverageStore, CollectError>
where
    E: Extractor + ?Sized,
{
    let jobs = config.effective_jobs().clamp(1, data_files.len().max(1));
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<&Path>();
    for path in data_files {
        if job_tx.send(path.as_path()).is_err() {
            break;
        }
    }
    drop(job_tx);

    let (result_tx, result_rx) = crossbeam_channel::unbounded::<(&Path, Result<Vec<FileCoverage>>)>();
    let cancelled = AtomicBool::new(false);
    let mut store = CoverageStore::new(config.merge_options());
    let mut merge_errors = MergeErrors::default();
    let mut extraction_error = None;

    info!(files = data_files.len(), jobs, "collecting coverage");
    std::thread::scope(|scope| {
        for worker in 0..jobs {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let cancelled = &cancelled;
            scope.spawn(move || {
                debug!(worker, "worker started");
                for path in job_rx {
                    if cancelled.load(Ordering::Relaxed) {
                        debug!(worker, "worker cancelled");
                        break;
                    }
                    let result = extractor.extract(path);
                    if result.is_err() {
                        cancelled.store(true, Ordering::Relaxed);
                    }
                    if result_tx.send((path, result)).is_err() {
                        break;
                    }
                }
                debug!(worker, "worker finished");
            });
        }
        drop(result_tx);

        for (path, result) in result_rx {
            match result {
                Ok(files) => {
                    if extraction_error.is_some() {
                        continue;
                    }
                    debug!(file = %path.display(), files = files.len(), "merging");
                    if let Err(errs) = store.merge_all(files) {
                        merge_errors.0.extend(errs.0);
                    }
                }
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "extraction failed");
                    if extraction_error.is_none() {
                        extraction_error =
                            Some(err.context(format!("while processing {}", path.display())));
                    }
                }
            }
        }
    });

    if let Some(err) = extraction_error {
        return Err(CollectError::Extraction(err));
    }
    merge_errors.into_result()?;
    info!(files = store.len(), "collected coverage");
    Ok(store)
}
