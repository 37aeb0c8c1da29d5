//! Test-only helpers: job builders, a scripted judge, and a throwaway project.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use crate::core::verdict::{CriterionResult, QualityGateResult};
use crate::engine::{EngineParts, WorkflowEngine};
use crate::io::config::StepwiseConfig;
use crate::io::init::StepwisePaths;
use crate::io::instructions::TemplateRenderer;
use crate::io::job_source::DirJobSource;
use crate::io::judge::{Judge, JudgeRequest, ReviewerError};
use crate::io::session_store::SessionStore;
use crate::job::{JobDefinition, OutputKind, OutputSpec, Step, StepEntry, StepInput, WorkflowDef};

/// Job named `job` with the given steps and workflows.
pub fn job(steps: Vec<Step>, workflows: Vec<WorkflowDef>) -> JobDefinition {
    JobDefinition {
        name: "job".to_string(),
        summary: "test job".to_string(),
        steps,
        workflows,
    }
}

/// Step with no outputs, inputs, dependencies or reviews.
pub fn step(id: &str) -> Step {
    Step {
        id: id.to_string(),
        name: format!("{id} step"),
        description: String::new(),
        instructions: format!("Do {id}."),
        outputs: BTreeMap::new(),
        inputs: Vec::new(),
        depends_on: Vec::new(),
        reviews: Vec::new(),
    }
}

pub fn workflow(name: &str, steps: Vec<StepEntry>) -> WorkflowDef {
    WorkflowDef {
        name: name.to_string(),
        summary: String::new(),
        steps,
    }
}

/// Add a required single-file output.
pub fn single_output(step: Step, name: &str) -> Step {
    with_output(step, name, OutputKind::SingleFile)
}

/// Add a required file-list output.
pub fn list_output(step: Step, name: &str) -> Step {
    with_output(step, name, OutputKind::FileList)
}

fn with_output(mut step: Step, name: &str, kind: OutputKind) -> Step {
    step.outputs.insert(
        name.to_string(),
        OutputSpec {
            kind,
            required: true,
            description: String::new(),
        },
    );
    step
}

pub fn file_input(name: &str, from_step: &str) -> StepInput {
    StepInput::File {
        name: name.to_string(),
        from_step: from_step.to_string(),
    }
}

/// Reply a [`ScriptedJudge`] gives for one review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    Pass,
    Fail(String),
    Timeout,
    Malformed,
}

impl Scripted {
    fn into_reply(self, label: &str) -> Result<QualityGateResult, ReviewerError> {
        let verdict = |passed: bool, feedback: String| QualityGateResult {
            passed,
            criteria_results: vec![CriterionResult {
                criterion: label.to_string(),
                passed,
                feedback: feedback.clone(),
            }],
            feedback,
        };
        match self {
            Scripted::Pass => Ok(verdict(true, String::new())),
            Scripted::Fail(feedback) => Ok(verdict(false, feedback)),
            Scripted::Timeout => Err(ReviewerError::Timeout {
                after: Duration::from_secs(240),
            }),
            Scripted::Malformed => Err(ReviewerError::MalformedReply {
                excerpt: "<html>".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
struct ScriptedState {
    default: Scripted,
    queued: HashMap<String, VecDeque<Scripted>>,
    calls: Vec<JudgeRequest>,
}

/// Judge with canned replies per review label, recording every request.
///
/// Clones share state, so a test can keep one handle and give another to the
/// engine.
#[derive(Debug, Clone)]
pub struct ScriptedJudge {
    state: Arc<Mutex<ScriptedState>>,
    delay: Duration,
}

impl ScriptedJudge {
    pub fn with_default(default: Scripted) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptedState {
                default,
                queued: HashMap::new(),
                calls: Vec::new(),
            })),
            delay: Duration::ZERO,
        }
    }

    pub fn passing() -> Self {
        Self::with_default(Scripted::Pass)
    }

    pub fn failing(feedback: &str) -> Self {
        Self::with_default(Scripted::Fail(feedback.to_string()))
    }

    /// Replies used, in order, for reviews labelled `label` before the default.
    pub fn queue(self, label: &str, replies: impl IntoIterator<Item = Scripted>) -> Self {
        self.state
            .lock()
            .expect("scripted judge lock")
            .queued
            .entry(label.to_string())
            .or_default()
            .extend(replies);
        self
    }

    /// Sleep this long inside every review.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<JudgeRequest> {
        self.state.lock().expect("scripted judge lock").calls.clone()
    }
}

impl Judge for ScriptedJudge {
    async fn review(&self, request: &JudgeRequest) -> Result<QualityGateResult, ReviewerError> {
        let reply = {
            let mut state = self.state.lock().expect("scripted judge lock");
            state.calls.push(request.clone());
            let default = state.default.clone();
            state
                .queued
                .get_mut(&request.label)
                .and_then(VecDeque::pop_front)
                .unwrap_or(default)
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        reply.into_reply(&request.label)
    }
}

/// A temporary project root with an empty `.stepwise/` layout.
pub struct TestProject {
    pub dir: TempDir,
    pub paths: StepwisePaths,
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = StepwisePaths::new(dir.path());
        fs::create_dir_all(&paths.jobs_dir).expect("jobs dir");
        fs::create_dir_all(&paths.sessions_dir).expect("sessions dir");
        Self { dir, paths }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `job` to `.stepwise/jobs/<name>/job.toml`.
    pub fn add_job(&self, job: &JobDefinition) {
        let toml = toml::to_string(job).expect("serialize job");
        self.add_job_toml(&job.name, &toml);
    }

    pub fn add_job_toml(&self, dir_name: &str, contents: &str) {
        let dir = self.paths.jobs_dir.join(dir_name);
        fs::create_dir_all(&dir).expect("job dir");
        fs::write(dir.join("job.toml"), contents).expect("write job");
    }

    /// Write a file relative to the project root.
    pub fn write_file(&self, relative: &str, contents: &str) {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parent dir");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn engine(&self, judge: ScriptedJudge) -> WorkflowEngine<ScriptedJudge> {
        self.engine_with(judge, StepwiseConfig::default())
    }

    pub fn engine_with(
        &self,
        judge: ScriptedJudge,
        config: StepwiseConfig,
    ) -> WorkflowEngine<ScriptedJudge> {
        WorkflowEngine::new(EngineParts {
            paths: self.paths.clone(),
            config,
            jobs: Arc::new(DirJobSource::new(&self.paths.jobs_dir)),
            store: SessionStore::in_dir(&self.paths.sessions_dir),
            judge,
            renderer: Arc::new(TemplateRenderer::new().expect("templates")),
        })
    }
}
