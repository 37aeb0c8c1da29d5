//! Workflow ordering and job-definition invariants.
//!
//! [`WorkflowGraph`] is a borrowed view over one workflow of a job: the entry
//! sequence plus step lookup. [`validate_job`] checks the invariants the TOML
//! shape cannot express and returns stable, itemized messages.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::LazyLock;

use regex::Regex;

use crate::job::{JobDefinition, Step, StepEntry, WHOLE_STEP_SCOPE, WorkflowDef};

static STEP_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("step id regex"));

#[derive(Debug, Clone, Copy)]
pub struct WorkflowGraph<'a> {
    job: &'a JobDefinition,
    workflow: &'a WorkflowDef,
}

impl<'a> WorkflowGraph<'a> {
    /// Build the graph for `workflow_name`, or `None` if the job has no such workflow.
    pub fn new(job: &'a JobDefinition, workflow_name: &str) -> Option<Self> {
        let workflow = job.workflow(workflow_name)?;
        Some(Self { job, workflow })
    }

    pub fn entry(&self, index: usize) -> Option<&'a StepEntry> {
        self.workflow.steps.get(index)
    }

    /// Index of the entry containing `step_id`.
    pub fn position_of(&self, step_id: &str) -> Option<usize> {
        self.workflow
            .steps
            .iter()
            .position(|entry| entry.contains(step_id))
    }

    /// The entry following the one that contains `step_id`; `None` when terminal.
    pub fn entry_after(&self, step_id: &str) -> Option<&'a StepEntry> {
        let index = self.position_of(step_id)?;
        self.entry(index + 1)
    }

    pub fn step(&self, id: &str) -> Option<&'a Step> {
        self.job.step(id)
    }

    /// Steps of the entry at `index`, in declaration order.
    pub fn steps_at(&self, index: usize) -> Vec<&'a Step> {
        self.entry(index)
            .map(|entry| {
                entry
                    .step_ids()
                    .into_iter()
                    .filter_map(|id| self.job.step(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Check job invariants not expressible in the definition format:
/// - Step ids are unique slugs
/// - Dependencies exist and form no cycle
/// - File inputs come from declared dependencies and name declared outputs
/// - Review scopes name a declared output or the whole step
/// - Workflows reference known steps, respect dependency order, and never
///   group a step with one of its producers
pub fn validate_job(job: &JobDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for step in &job.steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
        if !STEP_ID_RE.is_match(&step.id) {
            errors.push(format!(
                "step id '{}' must match [a-z0-9][a-z0-9_-]*",
                step.id
            ));
        }
    }

    for step in &job.steps {
        validate_step(job, step, &mut errors);
    }

    if let Some(cycle) = find_cycle(job) {
        errors.push(format!(
            "dependency cycle involving steps: {}",
            cycle.join(", ")
        ));
    }

    if job.workflows.is_empty() {
        errors.push(format!("job '{}' declares no workflows", job.name));
    }
    let mut workflow_names = HashSet::new();
    for workflow in &job.workflows {
        if !workflow_names.insert(workflow.name.as_str()) {
            errors.push(format!("duplicate workflow name '{}'", workflow.name));
        }
        validate_workflow(job, workflow, &mut errors);
    }

    errors
}

fn validate_step(job: &JobDefinition, step: &Step, errors: &mut Vec<String>) {
    if step.outputs.contains_key(WHOLE_STEP_SCOPE) {
        errors.push(format!(
            "step '{}' output name '{}' is reserved for whole-step reviews",
            step.id, WHOLE_STEP_SCOPE
        ));
    }

    for dep in &step.depends_on {
        if dep == &step.id {
            errors.push(format!("step '{}' depends on itself", step.id));
        } else if job.step(dep).is_none() {
            errors.push(format!(
                "step '{}' depends on unknown step '{}'",
                step.id, dep
            ));
        }
    }

    for (name, from_step) in step.file_inputs() {
        if !step.depends_on.iter().any(|dep| dep == from_step) {
            errors.push(format!(
                "step '{}' input '{}' comes from '{}' which is not in depends_on",
                step.id, name, from_step
            ));
        }
        if let Some(source) = job.step(from_step)
            && !source.outputs.contains_key(name)
        {
            errors.push(format!(
                "step '{}' input '{}' is not an output of step '{}'",
                step.id, name, from_step
            ));
        }
    }

    for (index, review) in step.reviews.iter().enumerate() {
        if let Some(output) = review.output_scope()
            && !step.outputs.contains_key(output)
        {
            errors.push(format!(
                "step '{}' review #{} targets unknown output '{}'",
                step.id,
                index + 1,
                output
            ));
        }
        if review.criteria.is_empty() {
            errors.push(format!(
                "step '{}' review #{} has no criteria",
                step.id,
                index + 1
            ));
        }
        let mut names = HashSet::new();
        for criterion in &review.criteria {
            if !names.insert(criterion.name.as_str()) {
                errors.push(format!(
                    "step '{}' review #{} repeats criterion '{}'",
                    step.id,
                    index + 1,
                    criterion.name
                ));
            }
        }
    }
}

fn validate_workflow(job: &JobDefinition, workflow: &WorkflowDef, errors: &mut Vec<String>) {
    let label = format!("workflow '{}'", workflow.name);
    if workflow.steps.is_empty() {
        errors.push(format!("{label} has no steps"));
        return;
    }

    let mut placed: BTreeMap<&str, usize> = BTreeMap::new();
    for (index, entry) in workflow.steps.iter().enumerate() {
        let ids = entry.step_ids();
        if ids.is_empty() {
            errors.push(format!("{label} entry #{} is an empty group", index + 1));
        }
        for &id in &ids {
            if job.step(id).is_none() {
                errors.push(format!("{label} references unknown step '{id}'"));
            }
            if placed.insert(id, index).is_some() {
                errors.push(format!("{label} lists step '{id}' more than once"));
            }
        }
    }

    for (index, entry) in workflow.steps.iter().enumerate() {
        let members: BTreeSet<&str> = entry.step_ids().into_iter().collect();
        for id in &members {
            let Some(step) = job.step(id) else {
                continue;
            };
            for dep in &step.depends_on {
                if members.contains(dep.as_str()) {
                    errors.push(format!(
                        "{label} groups '{id}' with its dependency '{dep}'"
                    ));
                    continue;
                }
                match placed.get(dep.as_str()) {
                    Some(dep_index) if *dep_index < index => {}
                    Some(_) => errors.push(format!(
                        "{label} runs '{id}' before its dependency '{dep}'"
                    )),
                    None => errors.push(format!(
                        "{label} includes '{id}' but not its dependency '{dep}'"
                    )),
                }
            }
            for (name, from_step) in step.file_inputs() {
                if members.contains(from_step) && !step.depends_on.iter().any(|d| d == from_step)
                {
                    errors.push(format!(
                        "{label} groups '{id}' with '{from_step}' whose output '{name}' it consumes"
                    ));
                }
            }
        }
    }
}

/// Kahn's algorithm over `depends_on`; returns the steps left unsorted when a cycle exists.
fn find_cycle(job: &JobDefinition) -> Option<Vec<String>> {
    let known: BTreeSet<&str> = job.steps.iter().map(|step| step.id.as_str()).collect();
    let mut in_degree: BTreeMap<&str, usize> = known.iter().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for step in &job.steps {
        for dep in &step.depends_on {
            if !known.contains(dep.as_str()) || dep == &step.id {
                continue;
            }
            *in_degree.entry(step.id.as_str()).or_default() += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = 0usize;
    while let Some(id) = queue.pop_front() {
        sorted += 1;
        for next in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if sorted == in_degree.len() {
        return None;
    }
    Some(
        in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Criterion, ReviewSpec, StepInput};
    use crate::test_support::{file_input, job, single_output, step, workflow};

    #[test]
    fn valid_job_has_no_errors() {
        let mut b = step("b");
        b.depends_on = vec!["a".to_string()];
        b.inputs = vec![file_input("data", "a")];
        let job = job(
            vec![single_output(step("a"), "data"), b],
            vec![workflow("main", vec![StepEntry::Single("a".into()), StepEntry::Single("b".into())])],
        );
        assert!(validate_job(&job).is_empty(), "{:?}", validate_job(&job));
    }

    #[test]
    fn traversal_follows_entries() {
        let job = job(
            vec![step("a"), step("b"), step("c")],
            vec![workflow(
                "main",
                vec![
                    StepEntry::Single("a".into()),
                    StepEntry::Group(vec!["b".into(), "c".into()]),
                ],
            )],
        );
        let graph = WorkflowGraph::new(&job, "main").expect("graph");
        assert_eq!(graph.entry_after("a"), graph.entry(1));
        assert_eq!(graph.entry_after("b"), None);
        assert_eq!(graph.position_of("c"), Some(1));
        assert_eq!(graph.steps_at(1).len(), 2);
        assert!(WorkflowGraph::new(&job, "missing").is_none());
    }

    #[test]
    fn reports_unknown_dependency_and_missing_input_dependency() {
        let mut b = step("b");
        b.depends_on = vec!["ghost".to_string()];
        b.inputs = vec![StepInput::File {
            name: "data".into(),
            from_step: "a".into(),
        }];
        let job = job(
            vec![single_output(step("a"), "data"), b],
            vec![workflow("main", vec![StepEntry::Single("a".into()), StepEntry::Single("b".into())])],
        );
        let errors = validate_job(&job);
        assert!(errors.contains(&"step 'b' depends on unknown step 'ghost'".to_string()));
        assert!(errors.contains(
            &"step 'b' input 'data' comes from 'a' which is not in depends_on".to_string()
        ));
    }

    #[test]
    fn reports_cycles() {
        let mut a = step("a");
        a.depends_on = vec!["b".to_string()];
        let mut b = step("b");
        b.depends_on = vec!["a".to_string()];
        let job = job(
            vec![a, b],
            vec![workflow("main", vec![StepEntry::Single("a".into())])],
        );
        let errors = validate_job(&job);
        assert!(
            errors
                .iter()
                .any(|err| err == "dependency cycle involving steps: a, b"),
            "{errors:?}"
        );
    }

    #[test]
    fn reports_review_scope_and_duplicate_ids() {
        let mut a = step("a");
        a.reviews = vec![ReviewSpec {
            scope: "missing".into(),
            criteria: vec![Criterion {
                name: "x".into(),
                check: "y".into(),
            }],
            guidance: None,
        }];
        let job = job(
            vec![a, step("a")],
            vec![workflow("main", vec![StepEntry::Single("a".into())])],
        );
        let errors = validate_job(&job);
        assert!(errors.contains(&"duplicate step id 'a'".to_string()));
        assert!(errors.contains(&"step 'a' review #1 targets unknown output 'missing'".to_string()));
    }

    #[test]
    fn output_named_like_the_whole_step_scope_is_rejected() {
        let job = job(
            vec![single_output(step("a"), "step")],
            vec![workflow("main", vec![StepEntry::Single("a".into())])],
        );
        assert_eq!(
            validate_job(&job),
            vec!["step 'a' output name 'step' is reserved for whole-step reviews".to_string()]
        );
    }

    #[test]
    fn reports_workflow_ordering_violations() {
        let mut b = step("b");
        b.depends_on = vec!["a".to_string()];
        let mut c = step("c");
        c.depends_on = vec!["a".to_string()];
        let job = job(
            vec![step("a"), b, c],
            vec![
                workflow(
                    "backwards",
                    vec![StepEntry::Single("b".into()), StepEntry::Single("a".into())],
                ),
                workflow(
                    "grouped",
                    vec![StepEntry::Group(vec!["a".into(), "c".into()])],
                ),
            ],
        );
        let errors = validate_job(&job);
        assert!(errors.contains(&"workflow 'backwards' runs 'b' before its dependency 'a'".to_string()));
        assert!(errors.contains(&"workflow 'grouped' groups 'c' with its dependency 'a'".to_string()));
    }
}
