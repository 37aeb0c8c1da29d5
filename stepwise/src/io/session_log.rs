//! Append-only record of sessions that left the stack.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Completed,
    Aborted,
}

/// One JSON line in the session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogEntry {
    pub session_id: String,
    pub job_name: String,
    pub workflow_name: String,
    pub goal: String,
    pub end: SessionEnd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub completed_step_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub review_overrides: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl SessionLogEntry {
    pub fn new(session: &Session, end: SessionEnd, reason: Option<&str>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            job_name: session.job_name.clone(),
            workflow_name: session.workflow_name.clone(),
            goal: session.goal.clone(),
            end,
            reason: reason.map(str::to_string),
            completed_step_ids: session.completed_step_ids.clone(),
            review_overrides: session.review_overrides.clone(),
            started_at: session.created_at,
            ended_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionLog {
    path: PathBuf,
}

impl SessionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &SessionLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("serialize session log entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }

    /// All entries, oldest first. A missing log reads as empty.
    pub fn read_all(&self) -> Result<Vec<SessionLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(index, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} entry {}", self.path.display(), index + 1))
            })
            .collect()
    }
}
