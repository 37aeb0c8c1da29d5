//! Workflow session engine: start, advance, complete and abort sessions.
//!
//! Every operation that touches sessions holds the store lock from its first
//! read to its last write. The one exception is the quality gate of
//! `finished_step`, which runs unlocked under a per-step review claim.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::ReviewBudget;
use crate::core::graph::WorkflowGraph;
use crate::core::outputs::validate_outputs;
use crate::core::session::{BlockedStep, Session, StepOutputs};
use crate::core::verdict::{CriterionResult, GateOutcome};
use crate::error::EngineError;
use crate::gate::{QualityGate, plan_reviews};
use crate::io::config::{ReviewMode, StepwiseConfig, load_config};
use crate::io::init::StepwisePaths;
use crate::io::instructions::{InstructionRenderer, TemplateRenderer};
use crate::io::job_source::{DirJobSource, InvalidJob, JobSource};
use crate::io::judge::{CommandJudge, Judge};
use crate::io::session_log::{SessionEnd, SessionLog, SessionLogEntry};
use crate::io::session_store::{SessionStore, SessionTxn};
use crate::job::{JobDefinition, StepEntry};

const REVIEW_CLAIM_GRACE: Duration = Duration::from_secs(60);

static INSTANCE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("instance id regex"));

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub summary: String,
    pub steps: Vec<StepEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub summary: String,
    pub workflows: Vec<WorkflowSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub jobs: Vec<JobSummary>,
    /// Jobs that failed to load or validate, with their issues.
    pub invalid: Vec<InvalidJob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    pub job: String,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FinishRequest {
    pub session_id: String,
    /// Required only while several steps of a group are pending.
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub outputs: StepOutputs,
    #[serde(default)]
    pub override_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepInstructions {
    pub step_id: String,
    pub name: String,
    pub instructions: String,
}

/// The pending steps of a session's current entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryView {
    pub entry_index: usize,
    /// True when the caller should run `steps` concurrently.
    pub parallel: bool,
    pub steps: Vec<StepInstructions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub session_id: String,
    pub job_name: String,
    pub workflow_name: String,
    pub workflow_auto_selected: bool,
    pub branch_name: String,
    pub stack_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub current: EntryView,
}

/// A parent session that becomes the top of the stack again.
#[derive(Debug, Clone, Serialize)]
pub struct ResumedParent {
    pub session_id: String,
    pub job_name: String,
    pub workflow_name: String,
    /// Absent when the parent's instructions could not be rendered.
    pub current: Option<EntryView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdvanceResult {
    NeedsWork {
        step_id: String,
        attempt: u32,
        max_attempts: u32,
        feedback: String,
        criteria_results: Vec<CriterionResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        self_review_path: Option<PathBuf>,
    },
    /// The step passed; other members of its group are still pending.
    StepAccepted {
        step_id: String,
        waiting_on: Vec<String>,
    },
    Advanced {
        completed_step_id: String,
        current: EntryView,
    },
    WorkflowComplete {
        session_id: String,
        completed_step_id: String,
        outputs: BTreeMap<String, StepOutputs>,
        stack_depth: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<ResumedParent>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AbortResult {
    pub session_id: String,
    pub reason: String,
    pub stack_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ResumedParent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackFrame {
    pub session_id: String,
    pub job_name: String,
    pub workflow_name: String,
    pub goal: String,
    pub current_entry_index: usize,
    pub completed_step_ids: Vec<String>,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

impl From<&Session> for StackFrame {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            job_name: session.job_name.clone(),
            workflow_name: session.workflow_name.clone(),
            goal: session.goal.clone(),
            current_entry_index: session.current_entry_index,
            completed_step_ids: session.completed_step_ids.clone(),
            blocked: session.blocked.is_some(),
            parent_session_id: session.parent_session_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Everything the engine needs, assembled by the caller.
pub struct EngineParts<J> {
    pub paths: StepwisePaths,
    pub config: StepwiseConfig,
    pub jobs: Arc<dyn JobSource>,
    pub store: SessionStore,
    pub judge: J,
    pub renderer: Arc<dyn InstructionRenderer>,
}

pub struct WorkflowEngine<J> {
    paths: StepwisePaths,
    max_quality_attempts: u32,
    review_budget: ReviewBudget,
    jobs: Arc<dyn JobSource>,
    store: SessionStore,
    gate: QualityGate<J>,
    renderer: Arc<dyn InstructionRenderer>,
    log: SessionLog,
}

impl WorkflowEngine<CommandJudge> {
    /// Engine for the project at `root`, configured from `.stepwise/config.toml`.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        let paths = StepwisePaths::new(root);
        let config = load_config(&paths.config_path)?;
        let judge = CommandJudge::new(
            config.judge.command.clone(),
            config.judge.budget(),
            config.judge.output_limit_bytes,
        )
        .with_working_dir(root);
        Ok(Self::new(EngineParts {
            jobs: Arc::new(DirJobSource::new(&paths.jobs_dir)),
            store: SessionStore::in_dir(&paths.sessions_dir),
            renderer: Arc::new(TemplateRenderer::new().context("load templates")?),
            judge,
            config,
            paths,
        }))
    }
}

impl<J: Judge> WorkflowEngine<J> {
    pub fn new(parts: EngineParts<J>) -> Self {
        let gate = QualityGate::new(
            parts.judge,
            parts.config.review.mode,
            parts.config.review.max_inline_files,
            parts.paths.clone(),
            parts.renderer.clone(),
        );
        Self {
            log: SessionLog::new(&parts.paths.session_log_path),
            max_quality_attempts: parts.config.max_quality_attempts,
            review_budget: parts.config.judge.budget(),
            paths: parts.paths,
            jobs: parts.jobs,
            store: parts.store,
            gate,
            renderer: parts.renderer,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// All jobs with their workflows, re-read on every call.
    pub async fn list_workflows(&self) -> Result<ListResult, EngineError> {
        let scan = self.jobs.scan()?;
        let jobs = scan
            .jobs
            .into_iter()
            .map(|job| JobSummary {
                workflows: job
                    .workflows
                    .into_iter()
                    .map(|workflow| WorkflowSummary {
                        name: workflow.name,
                        summary: workflow.summary,
                        steps: workflow.steps,
                    })
                    .collect(),
                name: job.name,
                summary: job.summary,
            })
            .collect();
        Ok(ListResult {
            jobs,
            invalid: scan.invalid,
        })
    }

    #[instrument(skip_all, fields(job = %request.job))]
    pub async fn start(&self, request: StartRequest) -> Result<StartResult, EngineError> {
        let job = self.resolve_job(&request.job)?;
        let (workflow_name, auto_selected) = match request.workflow.as_deref() {
            Some(name) => {
                if job.workflow(name).is_none() {
                    return Err(EngineError::WorkflowNotFound {
                        job: job.name.clone(),
                        workflow: name.to_string(),
                        available: workflow_names(&job),
                    });
                }
                (name.to_string(), false)
            }
            None => match job.workflows.as_slice() {
                [only] => (only.name.clone(), true),
                _ => {
                    return Err(EngineError::WorkflowRequired {
                        job: job.name.clone(),
                        available: workflow_names(&job),
                    });
                }
            },
        };
        if let Some(instance) = &request.instance_id
            && !INSTANCE_ID_RE.is_match(instance)
        {
            return Err(EngineError::InvalidRequest(format!(
                "instance id '{instance}' must be letters, digits, '.', '_' or '-'"
            )));
        }
        let graph = graph_for(&job, &workflow_name)?;

        let mut txn = self.store.lock().await;
        let mut session = Session::new(
            &job.name,
            &workflow_name,
            &request.goal,
            request.instance_id,
        );
        session.parent_session_id = txn.top()?.map(|parent| parent.session_id);
        let current = self.entry_view(&graph, &session)?;
        let session_id = txn.create(session.clone())?;
        let stack_depth = txn.list_stack()?.len();

        info!(
            session_id = %session_id,
            workflow = %workflow_name,
            auto_selected,
            stack_depth,
            "workflow started"
        );
        Ok(StartResult {
            branch_name: session.branch_name(),
            parent_session_id: session.parent_session_id,
            session_id,
            job_name: job.name.clone(),
            workflow_name,
            workflow_auto_selected: auto_selected,
            stack_depth,
            current,
        })
    }

    /// Validate and review a finished step, then advance the session.
    ///
    /// The store lock is released while the judge runs. The step is claimed in
    /// `reviews_in_flight` meanwhile: further submissions on this session are
    /// refused until the claim is released or lapses, while other sessions keep
    /// moving.
    #[instrument(skip_all, fields(session_id = %request.session_id))]
    pub async fn finished_step(&self, request: FinishRequest) -> Result<AdvanceResult, EngineError> {
        let override_reason = request
            .override_reason
            .map(|reason| reason.trim().to_string())
            .filter(|reason| !reason.is_empty());

        let mut txn = self.store.lock().await;
        let session = txn.get(&request.session_id)?;
        ensure_not_blocked(&session)?;
        if let Some((step_id, expires_at)) = session.review_in_flight(Utc::now()) {
            return Err(EngineError::ReviewInProgress {
                step_id: step_id.to_string(),
                expires_at,
            });
        }

        let job = self.resolve_job(&session.job_name)?;
        let graph = graph_for(&job, &session.workflow_name)?;
        let pending = pending_steps(&graph, &session)?;

        let step_id = match request.step_id {
            Some(step_id) if pending.contains(&step_id) => step_id,
            Some(step_id) => return Err(EngineError::StepNotCurrent { step_id, pending }),
            None => match pending.as_slice() {
                [only] => only.clone(),
                _ => return Err(EngineError::StepRequired { pending }),
            },
        };
        let step = graph.step(&step_id).ok_or_else(|| {
            EngineError::Internal(anyhow::anyhow!("step '{step_id}' missing from job"))
        })?;

        let issues = validate_outputs(step, &request.outputs, |path| {
            self.paths.resolve(path).exists()
        });
        if !issues.is_empty() {
            debug!(step_id = %step_id, issues = issues.len(), "outputs rejected");
            return Err(EngineError::InvalidOutputs { step_id, issues });
        }

        if self.gate.mode() == ReviewMode::SelfReview && override_reason.is_some() {
            debug!(step_id = %step_id, "self-review confirmed by agent");
            return self.advance(&mut txn, session, &graph, step_id, request.outputs, None, pending);
        }
        if plan_reviews(step, &request.outputs).is_empty() {
            return self.advance(&mut txn, session, &graph, step_id, request.outputs, None, pending);
        }

        let file_count = request
            .outputs
            .values()
            .map(|value| value.paths().len())
            .sum();
        let expires_at = self.review_claim_expiry(file_count);
        let session = txn.update(&session.session_id, |s| {
            s.reviews_in_flight.insert(step_id.clone(), expires_at);
        })?;
        drop(txn);

        let evaluated = self.gate.evaluate(&session, step, &request.outputs).await;

        let mut txn = self.store.lock().await;
        let snapshot = session;
        let session = txn.update(&snapshot.session_id, |s| {
            // A lapsed claim may have been taken over by a later submission.
            if s.reviews_in_flight.get(&step_id) == Some(&expires_at) {
                s.reviews_in_flight.remove(&step_id);
            }
        })?;
        let outcome = evaluated?;
        ensure_not_blocked(&session)?;
        let pending = pending_steps(&graph, &session)?;
        if session.current_entry_index != snapshot.current_entry_index
            || !pending.contains(&step_id)
        {
            return Err(EngineError::StepNotCurrent { step_id, pending });
        }
        if session.attempts_for(&step_id) != snapshot.attempts_for(&step_id) {
            return Err(EngineError::StaleReview { step_id });
        }

        let mut bypass = None;
        match outcome {
            GateOutcome::Passed => {}
            GateOutcome::Failed(result) => {
                return self.needs_work(
                    &mut txn,
                    &session,
                    step_id,
                    result.feedback,
                    result.criteria_results,
                    None,
                );
            }
            GateOutcome::Incomplete { failures } => match override_reason {
                Some(reason) => {
                    warn!(
                        step_id = %step_id,
                        reason = %reason,
                        failures = ?failures,
                        "incomplete review bypassed by override"
                    );
                    bypass = Some(reason);
                }
                None => {
                    return Err(EngineError::ReviewInfrastructure {
                        step_id,
                        details: failures,
                    });
                }
            },
            GateOutcome::SelfReviewRequested { instructions_path } => {
                let feedback = format!(
                    "Read {} and assess your work against every criterion yourself. \
                     Fix what fails, then call finished_step again with the same outputs \
                     and an override_reason summarizing your review.",
                    instructions_path.display()
                );
                return self.needs_work(
                    &mut txn,
                    &session,
                    step_id,
                    feedback,
                    Vec::new(),
                    Some(instructions_path),
                );
            }
        }

        self.advance(&mut txn, session, &graph, step_id, request.outputs, bypass, pending)
    }

    /// Count one more needs-work verdict for `step_id`, or block the session
    /// once the attempt limit is already used up.
    fn needs_work(
        &self,
        txn: &mut SessionTxn<'_>,
        session: &Session,
        step_id: String,
        feedback: String,
        criteria_results: Vec<CriterionResult>,
        self_review_path: Option<PathBuf>,
    ) -> Result<AdvanceResult, EngineError> {
        let attempts = session.attempts_for(&step_id);
        if attempts >= self.max_quality_attempts {
            warn!(step_id = %step_id, attempts, "quality gate exhausted");
            let blocked = BlockedStep {
                step_id: step_id.clone(),
                attempts,
                last_feedback: feedback.clone(),
            };
            txn.update(&session.session_id, |s| {
                s.last_feedback = Some(blocked.last_feedback.clone());
                s.blocked = Some(blocked);
            })?;
            return Err(EngineError::QualityGateExhausted {
                step_id,
                attempts,
                last_feedback: feedback,
            });
        }

        let attempt = attempts + 1;
        txn.update(&session.session_id, |s| {
            s.quality_attempts.insert(step_id.clone(), attempt);
            s.last_feedback = Some(feedback.clone());
        })?;
        debug!(step_id = %step_id, attempt, "step needs work");
        Ok(AdvanceResult::NeedsWork {
            step_id,
            attempt,
            max_attempts: self.max_quality_attempts,
            feedback,
            criteria_results,
            self_review_path,
        })
    }

    /// When a review claim lapses: the judge budget for `file_count` files plus
    /// a grace period. Claims left behind by a crashed process expire on their own.
    fn review_claim_expiry(&self, file_count: usize) -> DateTime<Utc> {
        let window = self
            .review_budget
            .timeout_for(file_count)
            .saturating_add(REVIEW_CLAIM_GRACE);
        TimeDelta::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    #[allow(clippy::too_many_arguments)]
    fn advance(
        &self,
        txn: &mut SessionTxn<'_>,
        mut session: Session,
        graph: &WorkflowGraph<'_>,
        step_id: String,
        outputs: StepOutputs,
        bypass: Option<String>,
        pending: Vec<String>,
    ) -> Result<AdvanceResult, EngineError> {
        session.record_completed(&step_id, outputs);
        if let Some(reason) = bypass {
            session.review_overrides.insert(step_id.clone(), reason);
        }

        let waiting_on = pending
            .into_iter()
            .filter(|id| *id != step_id)
            .collect::<Vec<_>>();
        if !waiting_on.is_empty() {
            let id = session.session_id.clone();
            txn.update(&id, |s| *s = session)?;
            debug!(step_id = %step_id, waiting_on = ?waiting_on, "group step accepted");
            return Ok(AdvanceResult::StepAccepted {
                step_id,
                waiting_on,
            });
        }

        session.current_entry_index += 1;
        if graph.entry(session.current_entry_index).is_some() {
            let current = self.entry_view(graph, &session)?;
            let id = session.session_id.clone();
            txn.update(&id, |s| *s = session)?;
            debug!(
                step_id = %step_id,
                entry_index = current.entry_index,
                parallel = current.parallel,
                "advanced"
            );
            return Ok(AdvanceResult::Advanced {
                completed_step_id: step_id,
                current,
            });
        }

        let removed = txn.remove(&session.session_id)?;
        self.record_end(&session, SessionEnd::Completed, None);
        let stack_depth = txn.list_stack()?.len();
        let parent = self.resume_parent(txn, removed.parent_session_id.as_deref());
        info!(session_id = %session.session_id, stack_depth, "workflow complete");
        Ok(AdvanceResult::WorkflowComplete {
            session_id: session.session_id,
            completed_step_id: step_id,
            outputs: session.collected_outputs,
            stack_depth,
            parent,
        })
    }

    /// Remove `session_id` from the stack without reviewing anything.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn abort(&self, session_id: &str, reason: &str) -> Result<AbortResult, EngineError> {
        let mut txn = self.store.lock().await;
        let session = txn.remove(session_id)?;
        self.record_end(&session, SessionEnd::Aborted, Some(reason));
        let stack_depth = txn.list_stack()?.len();
        let parent = self.resume_parent(&txn, session.parent_session_id.as_deref());
        info!(reason = %reason, stack_depth, "workflow aborted");
        Ok(AbortResult {
            session_id: session.session_id,
            reason: reason.to_string(),
            stack_depth,
            parent,
        })
    }

    /// Active sessions, bottom of the stack first.
    pub async fn stack(&self) -> Result<Vec<StackFrame>, EngineError> {
        let sessions = self.store.list_stack().await?;
        Ok(sessions.iter().map(StackFrame::from).collect())
    }

    fn resolve_job(&self, name: &str) -> Result<JobDefinition, EngineError> {
        let scan = self.jobs.scan()?;
        if let Some(job) = scan.jobs.into_iter().find(|job| job.name == name) {
            return Ok(job);
        }
        match scan.invalid.into_iter().find(|job| job.name == name) {
            Some(invalid) => Err(EngineError::InvalidDefinition {
                job: invalid.name,
                issues: invalid.issues,
            }),
            None => Err(EngineError::JobNotFound(name.to_string())),
        }
    }

    fn entry_view(
        &self,
        graph: &WorkflowGraph<'_>,
        session: &Session,
    ) -> Result<EntryView, EngineError> {
        let index = session.current_entry_index;
        let parallel = graph.entry(index).is_some_and(StepEntry::is_parallel);
        let steps = graph
            .steps_at(index)
            .into_iter()
            .filter(|step| !session.is_completed(&step.id))
            .map(|step| {
                Ok(StepInstructions {
                    step_id: step.id.clone(),
                    name: step.name.clone(),
                    instructions: self.renderer.step_instructions(session, step)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(EntryView {
            entry_index: index,
            parallel,
            steps,
        })
    }

    fn resume_parent(&self, txn: &SessionTxn<'_>, parent_id: Option<&str>) -> Option<ResumedParent> {
        let parent = match txn.get(parent_id?) {
            Ok(parent) => parent,
            Err(err) => {
                debug!(err = %err, "parent session no longer on the stack");
                return None;
            }
        };
        let current = self
            .resolve_job(&parent.job_name)
            .and_then(|job| {
                let graph = graph_for(&job, &parent.workflow_name)?;
                self.entry_view(&graph, &parent)
            })
            .inspect_err(|err| {
                warn!(parent = %parent.session_id, err = %err, "could not render parent instructions");
            })
            .ok();
        Some(ResumedParent {
            session_id: parent.session_id,
            job_name: parent.job_name,
            workflow_name: parent.workflow_name,
            current,
        })
    }

    fn record_end(&self, session: &Session, end: SessionEnd, reason: Option<&str>) {
        if let Err(err) = self.log.append(&SessionLogEntry::new(session, end, reason)) {
            warn!(err = %err, "failed to append session log");
        }
    }
}

fn ensure_not_blocked(session: &Session) -> Result<(), EngineError> {
    match &session.blocked {
        Some(blocked) => Err(EngineError::QualityGateExhausted {
            step_id: blocked.step_id.clone(),
            attempts: blocked.attempts,
            last_feedback: blocked.last_feedback.clone(),
        }),
        None => Ok(()),
    }
}

/// Steps of the session's current entry that are not completed yet.
fn pending_steps(graph: &WorkflowGraph<'_>, session: &Session) -> Result<Vec<String>, EngineError> {
    let entry = graph.entry(session.current_entry_index).ok_or_else(|| {
        EngineError::Internal(anyhow::anyhow!(
            "session '{}' points past the last entry of workflow '{}'",
            session.session_id,
            session.workflow_name
        ))
    })?;
    Ok(entry
        .step_ids()
        .into_iter()
        .filter(|id| !session.is_completed(id))
        .map(str::to_string)
        .collect())
}

fn graph_for<'a>(job: &'a JobDefinition, workflow: &str) -> Result<WorkflowGraph<'a>, EngineError> {
    WorkflowGraph::new(job, workflow).ok_or_else(|| EngineError::WorkflowNotFound {
        job: job.name.clone(),
        workflow: workflow.to_string(),
        available: workflow_names(job),
    })
}

fn workflow_names(job: &JobDefinition) -> Vec<String> {
    job.workflows
        .iter()
        .map(|workflow| workflow.name.clone())
        .collect()
}
