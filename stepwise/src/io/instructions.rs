//! Agent-facing text: step instructions and self-review files.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::session::Session;
use crate::job::{Criterion, Step, StepInput};

const STEP_TEMPLATE: &str = include_str!("prompts/step_instructions.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review_instructions.md");

/// One review as presented to a self-reviewing agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewBrief {
    /// Output name, file path, or `"step"`.
    pub scope: String,
    pub guidance: Option<String>,
    pub criteria: Vec<Criterion>,
    pub files: Vec<String>,
}

pub trait InstructionRenderer: Send + Sync {
    /// Instructions for working on `step` within `session`.
    fn step_instructions(&self, session: &Session, step: &Step) -> Result<String>;

    /// Markdown checklist for reviewing `step`'s submitted work.
    fn review_instructions(
        &self,
        session: &Session,
        step: &Step,
        reviews: &[ReviewBrief],
    ) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ResolvedInput<'a> {
    name: &'a str,
    from_step: &'a str,
    paths: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct OutputLine<'a> {
    name: &'a str,
    kind: &'static str,
    required: bool,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct ParameterLine<'a> {
    name: &'a str,
    description: &'a str,
}

/// minijinja-backed renderer using the bundled templates.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("step", STEP_TEMPLATE)
            .context("load step instructions template")?;
        env.add_template("review", REVIEW_TEMPLATE)
            .context("load review instructions template")?;
        Ok(Self { env })
    }
}

impl InstructionRenderer for TemplateRenderer {
    fn step_instructions(&self, session: &Session, step: &Step) -> Result<String> {
        let inputs = step
            .file_inputs()
            .map(|(name, from_step)| ResolvedInput {
                name,
                from_step,
                paths: session
                    .collected_outputs
                    .get(from_step)
                    .and_then(|outputs| outputs.get(name))
                    .map(|value| value.paths())
                    .unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        let parameters = step
            .inputs
            .iter()
            .filter_map(|input| match input {
                StepInput::Parameter { name, description } => Some(ParameterLine {
                    name,
                    description,
                }),
                StepInput::File { .. } => None,
            })
            .collect::<Vec<_>>();
        let outputs = step
            .outputs
            .iter()
            .map(|(name, spec)| OutputLine {
                name,
                kind: spec.kind.as_str(),
                required: spec.required,
                description: &spec.description,
            })
            .collect::<Vec<_>>();

        let body = self
            .env
            .render_str(
                &step.instructions,
                context! {
                    goal => &session.goal,
                    session_id => &session.session_id,
                    instance_id => &session.instance_id,
                    inputs => &inputs,
                },
            )
            .with_context(|| format!("render instructions of step '{}'", step.id))?;

        let rendered = self
            .env
            .get_template("step")?
            .render(context! {
                step => step,
                body => body.trim(),
                goal => &session.goal,
                session_id => &session.session_id,
                job_name => &session.job_name,
                workflow_name => &session.workflow_name,
                inputs => inputs,
                parameters => parameters,
                outputs => outputs,
                reviews => &step.reviews,
                feedback => session.last_feedback.as_deref(),
            })
            .with_context(|| format!("render step '{}'", step.id))?;
        debug!(step_id = %step.id, bytes = rendered.len(), "rendered step instructions");
        Ok(rendered)
    }

    fn review_instructions(
        &self,
        session: &Session,
        step: &Step,
        reviews: &[ReviewBrief],
    ) -> Result<String> {
        self.env
            .get_template("review")?
            .render(context! {
                step => step,
                goal => &session.goal,
                session_id => &session.session_id,
                job_name => &session.job_name,
                workflow_name => &session.workflow_name,
                reviews => reviews,
            })
            .with_context(|| format!("render self-review for step '{}'", step.id))
    }
}
