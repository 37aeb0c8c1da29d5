//! Initialization helpers for `.stepwise/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{StepwiseConfig, write_config};

/// All canonical paths within `.stepwise/` for a project root.
#[derive(Debug, Clone)]
pub struct StepwisePaths {
    pub root: PathBuf,
    pub stepwise_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub reviews_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub session_log_path: PathBuf,
}

impl StepwisePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let stepwise_dir = root.join(".stepwise");
        let sessions_dir = stepwise_dir.join("sessions");
        let tmp_dir = stepwise_dir.join("tmp");
        Self {
            root: root.clone(),
            stepwise_dir: stepwise_dir.clone(),
            jobs_dir: stepwise_dir.join("jobs"),
            sessions_dir: sessions_dir.clone(),
            tmp_dir: tmp_dir.clone(),
            reviews_dir: tmp_dir.join("reviews"),
            gitignore_path: stepwise_dir.join(".gitignore"),
            config_path: stepwise_dir.join("config.toml"),
            session_log_path: sessions_dir.join("history.jsonl"),
        }
    }

    /// Resolve a submitted output path against the project root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing stepwise-owned files.
    pub force: bool,
}

/// Create `.stepwise/` scaffolding in `root`.
///
/// Fails if `.stepwise/` already exists unless `options.force` is set. Job
/// definitions already present are never touched.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<StepwisePaths> {
    let paths = StepwisePaths::new(root);
    if paths.stepwise_dir.exists() && !options.force {
        return Err(anyhow!(
            "stepwise init: .stepwise already exists (use --force to overwrite)"
        ));
    }
    if paths.stepwise_dir.exists() && !paths.stepwise_dir.is_dir() {
        return Err(anyhow!(
            "stepwise init: .stepwise exists but is not a directory"
        ));
    }

    create_dir(&paths.stepwise_dir)?;
    create_dir(&paths.jobs_dir)?;
    create_dir(&paths.sessions_dir)?;
    create_dir(&paths.reviews_dir)?;

    write_file(&paths.gitignore_path, STEPWISE_GITIGNORE)?;
    write_config(&paths.config_path, &StepwiseConfig::default())?;

    let example_job = paths.jobs_dir.join("example").join("job.toml");
    if !example_job.exists() {
        write_file(&example_job, EXAMPLE_JOB)?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const STEPWISE_GITIGNORE: &str = "sessions/\ntmp/\n";

const EXAMPLE_JOB: &str = r#"name = "example"
summary = "Draft a short document and review it"

[[steps]]
id = "draft"
name = "Draft"
instructions = """
Write a first draft addressing: {{ goal }}
Save it and report its path as the `draft` output.
"""
[steps.outputs.draft]
kind = "single_file"

[[steps.reviews]]
scope = "draft"
guidance = "The draft is an early version; judge structure over polish."
criteria = [
  { name = "on_topic", check = "The draft addresses the stated goal." },
  { name = "structured", check = "The draft has a clear heading structure." },
]

[[workflows]]
name = "draft"
steps = ["draft"]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::job_source::{DirJobSource, JobSource};

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.jobs_dir.is_dir());
        assert!(paths.sessions_dir.is_dir());
        assert!(paths.reviews_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("gitignore"),
            STEPWISE_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            StepwiseConfig::default()
        );
    }

    #[test]
    fn example_job_is_valid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let scan = DirJobSource::new(&paths.jobs_dir).scan().expect("scan");
        assert!(scan.invalid.is_empty(), "{:?}", scan.invalid);
        assert_eq!(scan.jobs[0].name, "example");
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_project(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn resolve_keeps_absolute_paths() {
        let paths = StepwisePaths::new("/project");
        assert_eq!(paths.resolve("out/a.md"), PathBuf::from("/project/out/a.md"));
        assert_eq!(paths.resolve("/tmp/a.md"), PathBuf::from("/tmp/a.md"));
    }
}
