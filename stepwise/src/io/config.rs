//! Project configuration stored under `.stepwise/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::core::budget::ReviewBudget;

/// Stepwise configuration (TOML).
///
/// Every field has a default, so a missing file or a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepwiseConfig {
    /// Needs-work verdicts a step may receive before the workflow is blocked.
    pub max_quality_attempts: u32,
    pub review: ReviewConfig,
    pub judge: JudgeConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    /// Reviews run through the external judge command.
    #[default]
    External,
    /// The acting agent reviews its own work from a rendered instructions file.
    #[serde(rename = "self")]
    SelfReview,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    pub mode: ReviewMode,
    /// Reviews over at most this many files get the file contents inline.
    pub max_inline_files: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            mode: ReviewMode::External,
            max_inline_files: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JudgeConfig {
    /// Program and leading arguments (e.g. `["claude"]`).
    pub command: Vec<String>,
    pub base_timeout_secs: u64,
    pub per_file_timeout_secs: u64,
    /// Files covered by the base timeout.
    pub timeout_free_files: usize,
    /// Cap on captured judge stdout/stderr.
    pub output_limit_bytes: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            base_timeout_secs: 240,
            per_file_timeout_secs: 30,
            timeout_free_files: 5,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl JudgeConfig {
    pub fn budget(&self) -> ReviewBudget {
        ReviewBudget {
            base: Duration::from_secs(self.base_timeout_secs),
            per_file: Duration::from_secs(self.per_file_timeout_secs),
            free_files: self.timeout_free_files,
        }
    }
}

impl Default for StepwiseConfig {
    fn default() -> Self {
        Self {
            max_quality_attempts: 3,
            review: ReviewConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

impl StepwiseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_quality_attempts == 0 {
            bail!("max_quality_attempts must be > 0");
        }
        if self.judge.base_timeout_secs == 0 {
            bail!("judge.base_timeout_secs must be > 0");
        }
        if self.judge.output_limit_bytes == 0 {
            bail!("judge.output_limit_bytes must be > 0");
        }
        if self
            .judge
            .command
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            bail!("judge.command must be a non-empty array");
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// A missing file yields `StepwiseConfig::default()`.
pub fn load_config(path: &Path) -> Result<StepwiseConfig> {
    let cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<StepwiseConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        StepwiseConfig::default()
    };
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Write config to disk through a temp file and rename.
pub fn write_config(path: &Path, cfg: &StepwiseConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, StepwiseConfig::default());
        assert_eq!(cfg.review.mode, ReviewMode::External);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_quality_attempts = 5\n[review]\nmode = \"self\"\n[judge]\ncommand = [\"judge\", \"--fast\"]\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_quality_attempts, 5);
        assert_eq!(cfg.review.mode, ReviewMode::SelfReview);
        assert_eq!(cfg.review.max_inline_files, 5);
        assert_eq!(cfg.judge.command, vec!["judge", "--fast"]);
        assert_eq!(cfg.judge.base_timeout_secs, 240);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_quality_attempts = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_quality_attempts"));
    }

    #[test]
    fn written_config_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        let mut cfg = StepwiseConfig::default();
        cfg.review.mode = ReviewMode::SelfReview;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn budget_mirrors_judge_settings() {
        let budget = JudgeConfig::default().budget();
        assert_eq!(budget.timeout_for(7), Duration::from_secs(300));
    }
}
