//! Output contract validation for a finished step.
//!
//! Every violation is collected so the agent can fix all of them in one retry.
//! File existence is checked through a caller-supplied probe so this module
//! stays free of I/O.

use std::fmt;

use serde::Serialize;

use crate::core::session::StepOutputs;
use crate::job::{OutputKind, Step};

/// One violation of a step's output contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum OutputIssue {
    /// Submitted key not declared by the step.
    Undeclared { output: String },
    /// Required output absent from the submission.
    MissingRequired { output: String },
    /// Single-file output with zero or several paths.
    WrongArity {
        output: String,
        kind: &'static str,
        count: usize,
    },
    /// Required file-list output with no paths.
    EmptyList { output: String },
    /// Referenced path does not exist.
    FileNotFound { output: String, path: String },
}

impl OutputIssue {
    pub fn output(&self) -> &str {
        match self {
            OutputIssue::Undeclared { output }
            | OutputIssue::MissingRequired { output }
            | OutputIssue::WrongArity { output, .. }
            | OutputIssue::EmptyList { output }
            | OutputIssue::FileNotFound { output, .. } => output,
        }
    }
}

impl fmt::Display for OutputIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputIssue::Undeclared { output } => {
                write!(f, "output '{output}' is not declared by this step")
            }
            OutputIssue::MissingRequired { output } => {
                write!(f, "required output '{output}' is missing")
            }
            OutputIssue::WrongArity {
                output,
                kind,
                count,
            } => write!(
                f,
                "output '{output}' is {kind} and needs exactly one path (got {count})"
            ),
            OutputIssue::EmptyList { output } => {
                write!(f, "required output '{output}' must list at least one path")
            }
            OutputIssue::FileNotFound { output, path } => {
                write!(f, "output '{output}' references missing file '{path}'")
            }
        }
    }
}

/// Validate `submitted` against the step's declared outputs.
///
/// `exists` reports whether a submitted path is present on disk. Returns every
/// issue found, in output-name order (empty on success).
pub fn validate_outputs<F>(step: &Step, submitted: &StepOutputs, exists: F) -> Vec<OutputIssue>
where
    F: Fn(&str) -> bool,
{
    let mut issues = Vec::new();

    for name in submitted.keys() {
        if !step.outputs.contains_key(name) {
            issues.push(OutputIssue::Undeclared {
                output: name.clone(),
            });
        }
    }

    for (name, spec) in &step.outputs {
        let Some(value) = submitted.get(name) else {
            if spec.required {
                issues.push(OutputIssue::MissingRequired {
                    output: name.clone(),
                });
            }
            continue;
        };

        let paths = value.paths();
        match spec.kind {
            OutputKind::SingleFile if paths.len() != 1 => {
                issues.push(OutputIssue::WrongArity {
                    output: name.clone(),
                    kind: spec.kind.as_str(),
                    count: paths.len(),
                });
            }
            OutputKind::FileList if paths.is_empty() && spec.required => {
                issues.push(OutputIssue::EmptyList {
                    output: name.clone(),
                });
            }
            _ => {}
        }

        for path in paths {
            if !exists(path) {
                issues.push(OutputIssue::FileNotFound {
                    output: name.clone(),
                    path: path.to_string(),
                });
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::OutputValue;
    use crate::job::OutputSpec;
    use crate::test_support::{list_output, single_output, step};

    fn submit(pairs: &[(&str, OutputValue)]) -> StepOutputs {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn single(path: &str) -> OutputValue {
        OutputValue::Single(path.to_string())
    }

    #[test]
    fn accepts_matching_submission() {
        let step = list_output(single_output(step("a"), "report"), "pages");
        let submitted = submit(&[
            ("report", single("report.md")),
            (
                "pages",
                OutputValue::List(vec!["p1.md".to_string(), "p2.md".to_string()]),
            ),
        ]);
        assert!(validate_outputs(&step, &submitted, |_| true).is_empty());
    }

    #[test]
    fn missing_required_output_is_named() {
        let step = single_output(step("a"), "report");
        let issues = validate_outputs(&step, &StepOutputs::new(), |_| true);
        assert_eq!(
            issues,
            vec![OutputIssue::MissingRequired {
                output: "report".to_string()
            }]
        );
        assert_eq!(issues[0].to_string(), "required output 'report' is missing");
    }

    #[test]
    fn optional_output_may_be_absent() {
        let mut step = step("a");
        step.outputs.insert(
            "notes".to_string(),
            OutputSpec {
                kind: OutputKind::SingleFile,
                required: false,
                description: String::new(),
            },
        );
        assert!(validate_outputs(&step, &StepOutputs::new(), |_| true).is_empty());
    }

    #[test]
    fn reports_every_issue_at_once() {
        let step = list_output(single_output(step("a"), "report"), "pages");
        let submitted = submit(&[
            (
                "report",
                OutputValue::List(vec!["a.md".to_string(), "b.md".to_string()]),
            ),
            ("pages", OutputValue::List(Vec::new())),
            ("extra", single("x.md")),
        ]);
        let issues = validate_outputs(&step, &submitted, |path| path != "b.md");
        assert_eq!(
            issues,
            vec![
                OutputIssue::Undeclared {
                    output: "extra".to_string()
                },
                OutputIssue::EmptyList {
                    output: "pages".to_string()
                },
                OutputIssue::WrongArity {
                    output: "report".to_string(),
                    kind: "single_file",
                    count: 2
                },
                OutputIssue::FileNotFound {
                    output: "report".to_string(),
                    path: "b.md".to_string()
                },
            ]
        );
    }

    #[test]
    fn missing_file_references_output() {
        let step = single_output(step("a"), "report");
        let issues = validate_outputs(&step, &submit(&[("report", single("nope.md"))]), |_| false);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].output(), "report");
        assert!(issues[0].to_string().contains("nope.md"));
    }
}
