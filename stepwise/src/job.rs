//! Job definition model loaded from `.stepwise/jobs/<job>/job.toml`.
//!
//! A job declares its steps once; each workflow is a named ordering of those
//! steps into entries. An entry is either a single step id or a concurrent
//! group of step ids:
//!
//! ```toml
//! name = "competitive_research"
//! summary = "Research competitors and write a report"
//!
//! [[steps]]
//! id = "identify"
//! name = "Identify competitors"
//! instructions = "List the main competitors of {{ goal }}."
//! [steps.outputs.competitors]
//! kind = "single_file"
//!
//! [[workflows]]
//! name = "full"
//! steps = ["identify", ["profile_a", "profile_b"], "report"]
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Scope sentinel that makes a review cover every output of its step.
pub const WHOLE_STEP_SCOPE: &str = "step";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDef>,
}

impl JobDefinition {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDef> {
        self.workflows.iter().find(|workflow| workflow.name == name)
    }
}

/// A named ordering of steps within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    pub steps: Vec<StepEntry>,
}

/// One position in a workflow: a lone step or a group meant to run in parallel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StepEntry {
    Single(String),
    Group(Vec<String>),
}

impl StepEntry {
    pub fn step_ids(&self) -> Vec<&str> {
        match self {
            StepEntry::Single(id) => vec![id.as_str()],
            StepEntry::Group(ids) => ids.iter().map(String::as_str).collect(),
        }
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.step_ids().contains(&step_id)
    }

    /// True when the caller is expected to run the member steps concurrently.
    pub fn is_parallel(&self) -> bool {
        matches!(self, StepEntry::Group(ids) if ids.len() > 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Template body rendered into the agent-facing instructions.
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
    #[serde(default)]
    pub inputs: Vec<StepInput>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub reviews: Vec<ReviewSpec>,
}

impl Step {
    /// File inputs that consume another step's output.
    pub fn file_inputs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inputs.iter().filter_map(|input| match input {
            StepInput::File { name, from_step } => Some((name.as_str(), from_step.as_str())),
            StepInput::Parameter { .. } => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StepInput {
    /// Output `name` produced by step `from_step`.
    File { name: String, from_step: String },
    /// Free-form parameter the user supplies (usually via the goal).
    Parameter {
        name: String,
        #[serde(default)]
        description: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    SingleFile,
    FileList,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::SingleFile => "single_file",
            OutputKind::FileList => "file_list",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSpec {
    pub kind: OutputKind,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewSpec {
    /// `"step"` for the whole step, otherwise the name of one declared output.
    #[serde(default = "default_scope")]
    pub scope: String,
    pub criteria: Vec<Criterion>,
    /// Context for the judge, which never sees the conversation.
    #[serde(default)]
    pub guidance: Option<String>,
}

fn default_scope() -> String {
    WHOLE_STEP_SCOPE.to_string()
}

impl ReviewSpec {
    /// Output name this review targets, or `None` for the whole step.
    pub fn output_scope(&self) -> Option<&str> {
        (self.scope != WHOLE_STEP_SCOPE).then_some(self.scope.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Criterion {
    pub name: String,
    pub check: String,
}
