//! Job definition discovery under `.stepwise/jobs/<dir>/job.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::graph::validate_job;
use crate::job::JobDefinition;

const JOB_FILE: &str = "job.toml";

/// A job file that failed to parse or validate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidJob {
    /// Job name when the file parsed, otherwise the directory name.
    pub name: String,
    pub path: PathBuf,
    pub issues: Vec<String>,
}

/// Result of one scan: valid jobs plus the ones that were rejected.
#[derive(Debug, Clone, Default)]
pub struct JobScan {
    pub jobs: Vec<JobDefinition>,
    pub invalid: Vec<InvalidJob>,
}

/// Where job definitions come from.
///
/// Implementations re-read their backing store on every call so edits show up
/// without restarting a server.
pub trait JobSource: Send + Sync {
    fn scan(&self) -> Result<JobScan>;
}

/// Reads `<jobs_dir>/*/job.toml`.
#[derive(Debug, Clone)]
pub struct DirJobSource {
    jobs_dir: PathBuf,
}

impl DirJobSource {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }
}

impl JobSource for DirJobSource {
    #[instrument(skip_all, fields(jobs_dir = %self.jobs_dir.display()))]
    fn scan(&self) -> Result<JobScan> {
        let mut scan = JobScan::default();
        if !self.jobs_dir.exists() {
            debug!("jobs directory missing");
            return Ok(scan);
        }

        let mut dirs = fs::read_dir(&self.jobs_dir)
            .with_context(|| format!("read {}", self.jobs_dir.display()))?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("list {}", self.jobs_dir.display()))?;
        dirs.sort();

        for dir in dirs {
            let path = dir.join(JOB_FILE);
            if !path.is_file() {
                continue;
            }
            match load_job(&path) {
                Ok(job) => {
                    let issues = validate_job(&job);
                    if issues.is_empty() {
                        scan.jobs.push(job);
                    } else {
                        warn!(job = %job.name, issues = issues.len(), "job failed validation");
                        scan.invalid.push(InvalidJob {
                            name: job.name,
                            path,
                            issues,
                        });
                    }
                }
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "job failed to load");
                    scan.invalid.push(InvalidJob {
                        name: dir_name(&dir),
                        path,
                        issues: vec![format!("{err:#}")],
                    });
                }
            }
        }

        debug!(
            jobs = scan.jobs.len(),
            invalid = scan.invalid.len(),
            "scanned jobs"
        );
        Ok(scan)
    }
}

/// Parse one job file without validating it.
pub fn load_job(path: &Path) -> Result<JobDefinition> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
