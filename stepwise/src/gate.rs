//! Quality gate: turns a step's review specs into a single [`GateOutcome`].
//!
//! External mode fans reviews out to the judge concurrently; self mode writes
//! a checklist for the acting agent instead.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::core::session::{Session, StepOutputs};
use crate::core::verdict::{GateOutcome, ReviewOutcome, aggregate};
use crate::io::config::ReviewMode;
use crate::io::init::StepwisePaths;
use crate::io::instructions::{InstructionRenderer, ReviewBrief};
use crate::io::judge::{Judge, JudgeRequest};
use crate::job::{OutputKind, ReviewSpec, Step, WHOLE_STEP_SCOPE};

/// One unit of judging: a review applied to a set of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewTask<'a> {
    pub label: String,
    pub review: &'a ReviewSpec,
    pub files: Vec<String>,
}

/// Split a step's reviews into judge tasks.
///
/// A whole-step review covers every submitted file; a single-file output gets
/// one task; a file-list output gets one task per file. Reviews of optional
/// outputs that were not submitted are skipped.
pub fn plan_reviews<'a>(step: &'a Step, outputs: &StepOutputs) -> Vec<ReviewTask<'a>> {
    let mut tasks = Vec::new();
    for review in &step.reviews {
        let Some(scope) = review.output_scope() else {
            tasks.push(ReviewTask {
                label: WHOLE_STEP_SCOPE.to_string(),
                review,
                files: outputs
                    .values()
                    .flat_map(|value| value.paths())
                    .map(str::to_string)
                    .collect(),
            });
            continue;
        };
        let (Some(spec), Some(value)) = (step.outputs.get(scope), outputs.get(scope)) else {
            continue;
        };
        match spec.kind {
            OutputKind::SingleFile => tasks.push(ReviewTask {
                label: scope.to_string(),
                review,
                files: value.paths().into_iter().map(str::to_string).collect(),
            }),
            OutputKind::FileList => {
                for path in value.paths() {
                    tasks.push(ReviewTask {
                        label: path.to_string(),
                        review,
                        files: vec![path.to_string()],
                    });
                }
            }
        }
    }
    tasks
}

pub struct QualityGate<J> {
    judge: J,
    mode: ReviewMode,
    max_inline_files: usize,
    paths: StepwisePaths,
    renderer: Arc<dyn InstructionRenderer>,
}

impl<J: Judge> QualityGate<J> {
    pub fn new(
        judge: J,
        mode: ReviewMode,
        max_inline_files: usize,
        paths: StepwisePaths,
        renderer: Arc<dyn InstructionRenderer>,
    ) -> Self {
        Self {
            judge,
            mode,
            max_inline_files,
            paths,
            renderer,
        }
    }

    pub fn mode(&self) -> ReviewMode {
        self.mode
    }

    /// Review `outputs` of `step`. `Err` means the gate itself could not run
    /// (template or filesystem failure), never a judge failure.
    #[instrument(skip_all, fields(session_id = %session.session_id, step_id = %step.id))]
    pub async fn evaluate(
        &self,
        session: &Session,
        step: &Step,
        outputs: &StepOutputs,
    ) -> Result<GateOutcome> {
        let tasks = plan_reviews(step, outputs);
        if tasks.is_empty() {
            debug!("no reviews to run");
            return Ok(GateOutcome::Passed);
        }
        match self.mode {
            ReviewMode::External => Ok(self.run_external(session, step, &tasks).await),
            ReviewMode::SelfReview => self.request_self_review(session, step, &tasks).await,
        }
    }

    async fn run_external(
        &self,
        session: &Session,
        step: &Step,
        tasks: &[ReviewTask<'_>],
    ) -> GateOutcome {
        debug!(tasks = tasks.len(), "running external reviews");
        let reviews = tasks.iter().map(|task| async move {
            let request = JudgeRequest {
                label: task.label.clone(),
                payload: self.build_payload(session, step, task).await,
                file_count: task.files.len(),
            };
            match self.judge.review(&request).await {
                Ok(result) => ReviewOutcome::Verdict {
                    label: task.label.clone(),
                    result,
                },
                Err(err) => {
                    warn!(label = %task.label, err = %err, "review did not complete");
                    ReviewOutcome::Failed {
                        label: task.label.clone(),
                        error: err.to_string(),
                    }
                }
            }
        });
        let outcomes = join_all(reviews).await;
        aggregate(&outcomes)
    }

    async fn build_payload(&self, session: &Session, step: &Step, task: &ReviewTask<'_>) -> String {
        let mut payload = String::new();
        let _ = writeln!(payload, "# Review request\n");
        let _ = writeln!(payload, "Workflow goal: {}", session.goal);
        let _ = writeln!(
            payload,
            "Step: `{}` ({}) in `{}/{}`",
            step.id, step.name, session.job_name, session.workflow_name
        );
        if !step.description.is_empty() {
            let _ = writeln!(payload, "\n{}", step.description.trim());
        }
        let _ = writeln!(payload, "Scope: {}\n\n## Criteria\n", task.label);
        for criterion in &task.review.criteria {
            let _ = writeln!(payload, "- **{}**: {}", criterion.name, criterion.check);
        }
        if let Some(guidance) = &task.review.guidance {
            let _ = writeln!(payload, "\n## Guidance\n\n{}", guidance.trim());
        }

        let _ = writeln!(payload, "\n## Artifacts\n");
        if task.files.is_empty() {
            let _ = writeln!(payload, "(no files were submitted)");
        } else if task.files.len() <= self.max_inline_files {
            for path in &task.files {
                let resolved = self.paths.resolve(path);
                let body = match tokio::fs::read(&resolved).await {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(err) => format!("(could not read file: {err})"),
                };
                let _ = writeln!(payload, "### {path}\n\n````\n{}\n````\n", body.trim_end());
            }
        } else {
            let _ = writeln!(
                payload,
                "{} files; read them from the working directory:",
                task.files.len()
            );
            for path in &task.files {
                let _ = writeln!(payload, "- {path}");
            }
        }
        payload
    }

    async fn request_self_review(
        &self,
        session: &Session,
        step: &Step,
        tasks: &[ReviewTask<'_>],
    ) -> Result<GateOutcome> {
        // Per-file tasks of one review collapse back into a single checklist.
        let mut grouped: Vec<(&ReviewSpec, ReviewBrief)> = Vec::new();
        for task in tasks {
            match grouped
                .iter_mut()
                .find(|(review, _)| std::ptr::eq(*review, task.review))
            {
                Some((_, brief)) => brief.files.extend(task.files.iter().cloned()),
                None => grouped.push((
                    task.review,
                    ReviewBrief {
                        scope: task.review.scope.clone(),
                        guidance: task.review.guidance.clone(),
                        criteria: task.review.criteria.clone(),
                        files: task.files.clone(),
                    },
                )),
            }
        }
        let briefs = grouped
            .into_iter()
            .map(|(_, brief)| brief)
            .collect::<Vec<_>>();

        let text = self.renderer.review_instructions(session, step, &briefs)?;
        let path = self.self_review_path(session, step);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        debug!(path = %path.display(), "self-review instructions written");
        Ok(GateOutcome::SelfReviewRequested {
            instructions_path: path,
        })
    }

    fn self_review_path(&self, session: &Session, step: &Step) -> PathBuf {
        self.paths
            .reviews_dir
            .join(format!("{}-{}.md", session.session_id, step.id))
    }
}
