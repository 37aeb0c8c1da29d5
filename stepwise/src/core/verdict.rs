//! Quality-gate verdict types and their aggregation.
//!
//! A step's reviews produce independent results; [`aggregate`] folds them into
//! one [`GateOutcome`] without depending on the order they completed in.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Verdict for one criterion, as returned by the judge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    #[serde(default)]
    pub feedback: String,
}

/// Verdict for one review (or the aggregate of a step's reviews).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub passed: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub criteria_results: Vec<CriterionResult>,
}

/// Outcome of a single review task: a verdict or an infrastructure failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Verdict {
        label: String,
        result: QualityGateResult,
    },
    /// The judge never produced a verdict (timeout, crash, malformed reply).
    Failed { label: String, error: String },
}

/// Overall gate decision for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Passed,
    /// At least one review ran and explicitly failed.
    Failed(QualityGateResult),
    /// No review failed, but at least one could not complete.
    Incomplete { failures: Vec<String> },
    /// The acting agent must self-assess using the written instructions.
    SelfReviewRequested { instructions_path: PathBuf },
}

/// Fold review outcomes into a gate outcome.
///
/// An explicit failing verdict always wins over infrastructure failures so a
/// flaky judge cannot hide real negative feedback.
pub fn aggregate(outcomes: &[ReviewOutcome]) -> GateOutcome {
    let mut failed_reviews = Vec::new();
    let mut infra_failures = Vec::new();

    for outcome in outcomes {
        match outcome {
            ReviewOutcome::Verdict { label, result } if !result.passed => {
                failed_reviews.push((label, result));
            }
            ReviewOutcome::Verdict { .. } => {}
            ReviewOutcome::Failed { label, error } => {
                infra_failures.push(format!("{label}: {error}"));
            }
        }
    }

    if !failed_reviews.is_empty() {
        let mut feedback = failed_reviews
            .iter()
            .map(|(label, result)| format!("## {label}\n{}", result.feedback.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        if !infra_failures.is_empty() {
            feedback.push_str("\n\nReviews that could not complete:\n- ");
            feedback.push_str(&infra_failures.join("\n- "));
        }
        let criteria_results = failed_reviews
            .iter()
            .flat_map(|(label, result)| {
                result.criteria_results.iter().map(move |criterion| CriterionResult {
                    criterion: format!("{label}: {}", criterion.criterion),
                    passed: criterion.passed,
                    feedback: criterion.feedback.clone(),
                })
            })
            .collect();
        return GateOutcome::Failed(QualityGateResult {
            passed: false,
            feedback,
            criteria_results,
        });
    }

    if !infra_failures.is_empty() {
        return GateOutcome::Incomplete {
            failures: infra_failures,
        };
    }

    GateOutcome::Passed
}
