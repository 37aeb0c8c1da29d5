//! Engine error taxonomy.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::core::outputs::OutputIssue;
use crate::io::session_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step '{step_id}' outputs are invalid: {}", join_issues(issues))]
    InvalidOutputs {
        step_id: String,
        issues: Vec<OutputIssue>,
    },
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error("workflow '{workflow}' not found in job '{job}' (available: {})", available.join(", "))]
    WorkflowNotFound {
        job: String,
        workflow: String,
        available: Vec<String>,
    },
    #[error("job '{job}' has several workflows; choose one of: {}", available.join(", "))]
    WorkflowRequired { job: String, available: Vec<String> },
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("step '{step_id}' is not pending in the current entry (pending: {})", pending.join(", "))]
    StepNotCurrent {
        step_id: String,
        pending: Vec<String>,
    },
    #[error("several steps are pending; name one of: {}", pending.join(", "))]
    StepRequired { pending: Vec<String> },
    #[error(
        "quality gate exhausted for step '{step_id}' after {attempts} attempts; abort the workflow or get human help"
    )]
    QualityGateExhausted {
        step_id: String,
        attempts: u32,
        last_feedback: String,
    },
    #[error("reviews for step '{step_id}' could not complete: {}", details.join("; "))]
    ReviewInfrastructure {
        step_id: String,
        details: Vec<String>,
    },
    #[error("step '{step_id}' is already under review until {expires_at}; wait for that result")]
    ReviewInProgress {
        step_id: String,
        expires_at: DateTime<Utc>,
    },
    #[error("session changed while step '{step_id}' was under review; submit the step again")]
    StaleReview { step_id: String },
    #[error("job '{job}' is invalid: {}", issues.join("; "))]
    InvalidDefinition { job: String, issues: Vec<String> },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(StoreError),
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidOutputs { .. } => "invalid_outputs",
            EngineError::JobNotFound(_) => "job_not_found",
            EngineError::WorkflowNotFound { .. } => "workflow_not_found",
            EngineError::WorkflowRequired { .. } => "workflow_required",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::StepNotCurrent { .. } => "step_not_current",
            EngineError::StepRequired { .. } => "step_required",
            EngineError::QualityGateExhausted { .. } => "quality_gate_exhausted",
            EngineError::ReviewInfrastructure { .. } => "review_infrastructure",
            EngineError::ReviewInProgress { .. } => "review_in_progress",
            EngineError::StaleReview { .. } => "stale_review",
            EngineError::InvalidDefinition { .. } => "invalid_definition",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::Store(_) | EngineError::Internal(_) => "internal",
        }
    }

    /// Structured payload for callers that act on the error.
    pub fn details(&self) -> Value {
        match self {
            EngineError::InvalidOutputs { step_id, issues } => json!({
                "step_id": step_id,
                "issues": issues
                    .iter()
                    .map(|issue| json!({ "output": issue.output(), "message": issue.to_string(), "detail": issue }))
                    .collect::<Vec<_>>(),
            }),
            EngineError::WorkflowNotFound { available, .. }
            | EngineError::WorkflowRequired { available, .. } => json!({ "available": available }),
            EngineError::StepNotCurrent { step_id, pending } => {
                json!({ "step_id": step_id, "pending": pending })
            }
            EngineError::StepRequired { pending } => json!({ "pending": pending }),
            EngineError::QualityGateExhausted {
                step_id,
                attempts,
                last_feedback,
            } => json!({
                "step_id": step_id,
                "attempts": attempts,
                "last_feedback": last_feedback,
            }),
            EngineError::ReviewInfrastructure { step_id, details } => {
                json!({ "step_id": step_id, "failures": details })
            }
            EngineError::ReviewInProgress {
                step_id,
                expires_at,
            } => json!({ "step_id": step_id, "expires_at": expires_at }),
            EngineError::StaleReview { step_id } => json!({ "step_id": step_id }),
            EngineError::InvalidDefinition { job, issues } => {
                json!({ "job": job, "issues": issues })
            }
            EngineError::JobNotFound(_)
            | EngineError::SessionNotFound(_)
            | EngineError::InvalidRequest(_)
            | EngineError::Store(_)
            | EngineError::Internal(_) => Value::Null,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => EngineError::SessionNotFound(id),
            other => EngineError::Store(other),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err)
    }
}

fn join_issues(issues: &[OutputIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
