//! External judge invocation and reply validation.
//!
//! The judge is an opaque CLI (by default `claude`) that receives the review
//! payload on stdin and must answer with a JSON wrapper whose
//! `structured_output` matches `schemas/judge_verdict.schema.json`. Nothing
//! about the verdict's content is trusted beyond that shape.

use std::future::Future;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::core::budget::ReviewBudget;
use crate::core::verdict::QualityGateResult;
use crate::io::process::{SpawnError, run_command_with_timeout};

pub const JUDGE_SYSTEM_PROMPT: &str = include_str!("prompts/judge_system.md");
pub const JUDGE_VERDICT_SCHEMA: &str = include_str!("../../schemas/judge_verdict.schema.json");

const EXCERPT_CHARS: usize = 500;

static VERDICT_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    serde_json::from_str(JUDGE_VERDICT_SCHEMA).expect("embedded verdict schema is valid JSON")
});

static VERDICT_VALIDATOR: LazyLock<jsonschema::Validator> = LazyLock::new(|| {
    jsonschema::validator_for(&VERDICT_SCHEMA).expect("embedded verdict schema compiles")
});

/// One review to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    /// Human label for logs and feedback headings (output name or file path).
    pub label: String,
    /// Full review payload sent on stdin.
    pub payload: String,
    /// Files under review; drives the timeout.
    pub file_count: usize,
}

/// Why a review produced no verdict.
#[derive(Debug, thiserror::Error)]
pub enum ReviewerError {
    #[error("judge program '{program}' is not installed or not on PATH")]
    NotInstalled { program: String },
    #[error("failed to start judge: {0:#}")]
    Spawn(anyhow::Error),
    #[error("judge timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("judge exited with {code:?}: {stderr_excerpt}")]
    NonZeroExit {
        code: Option<i32>,
        stderr_excerpt: String,
    },
    #[error("judge reply is not JSON: {excerpt}")]
    MalformedReply { excerpt: String },
    #[error("judge reported an error: {excerpt}")]
    JudgeReported { excerpt: String },
    #[error("judge reply has no structured_output: {excerpt}")]
    MissingStructuredOutput { excerpt: String },
    #[error("judge verdict does not match schema ({}): {excerpt}", errors.join("; "))]
    SchemaViolation {
        errors: Vec<String>,
        excerpt: String,
    },
    #[error("judge I/O failed: {0:#}")]
    Io(anyhow::Error),
}

/// Something that can turn a review request into a verdict.
pub trait Judge: Send + Sync {
    fn review(
        &self,
        request: &JudgeRequest,
    ) -> impl Future<Output = Result<QualityGateResult, ReviewerError>> + Send;
}

/// Runs the configured judge command as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandJudge {
    command: Vec<String>,
    budget: ReviewBudget,
    output_limit_bytes: usize,
    working_dir: Option<PathBuf>,
}

impl CommandJudge {
    pub fn new(command: Vec<String>, budget: ReviewBudget, output_limit_bytes: usize) -> Self {
        Self {
            command,
            budget,
            output_limit_bytes,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn build_command(&self) -> Result<Command, ReviewerError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| ReviewerError::Spawn(anyhow::anyhow!("judge command is empty")))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(["--print", "--output-format", "json", "--system-prompt"])
            .arg(JUDGE_SYSTEM_PROMPT)
            .arg("--json-schema")
            .arg(VERDICT_SCHEMA.to_string());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

impl Judge for CommandJudge {
    #[instrument(skip_all, fields(label = %request.label, files = request.file_count))]
    async fn review(&self, request: &JudgeRequest) -> Result<QualityGateResult, ReviewerError> {
        let cmd = self.build_command()?;
        let timeout = self.budget.timeout_for(request.file_count);
        let program = self.command.first().cloned().unwrap_or_default();

        let output = run_command_with_timeout(
            cmd,
            Some(request.payload.clone().into_bytes()),
            timeout,
            self.output_limit_bytes,
        )
        .await
        .map_err(|err| match err.downcast_ref::<SpawnError>() {
            Some(spawn) if spawn.source.kind() == std::io::ErrorKind::NotFound => {
                ReviewerError::NotInstalled { program }
            }
            Some(_) => ReviewerError::Spawn(err),
            None => ReviewerError::Io(err),
        })?;

        if output.timed_out {
            return Err(ReviewerError::Timeout { after: timeout });
        }
        if !output.status.success() {
            warn!(code = ?output.status.code(), "judge exited unsuccessfully");
            return Err(ReviewerError::NonZeroExit {
                code: output.status.code(),
                stderr_excerpt: excerpt(&output.stderr_lossy()),
            });
        }

        let verdict = parse_reply(&output.stdout_lossy())?;
        debug!(passed = verdict.passed, "judge verdict");
        Ok(verdict)
    }
}

/// Extract and shape-check the verdict from the judge's JSON wrapper.
pub fn parse_reply(stdout: &str) -> Result<QualityGateResult, ReviewerError> {
    let wrapper: Value =
        serde_json::from_str(stdout.trim()).map_err(|_| ReviewerError::MalformedReply {
            excerpt: excerpt(stdout),
        })?;

    if wrapper.get("is_error").and_then(Value::as_bool) == Some(true) {
        return Err(ReviewerError::JudgeReported {
            excerpt: excerpt(stdout),
        });
    }

    let structured = match wrapper.get("structured_output") {
        Some(value) if !value.is_null() => value,
        _ => {
            return Err(ReviewerError::MissingStructuredOutput {
                excerpt: excerpt(stdout),
            });
        }
    };

    let errors = VERDICT_VALIDATOR
        .iter_errors(structured)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    if !errors.is_empty() {
        return Err(ReviewerError::SchemaViolation {
            errors,
            excerpt: excerpt(&structured.to_string()),
        });
    }

    serde_json::from_value(structured.clone()).map_err(|err| ReviewerError::SchemaViolation {
        errors: vec![err.to_string()],
        excerpt: excerpt(&structured.to_string()),
    })
}

/// First `EXCERPT_CHARS` characters of `text`.
fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSING: &str = r#"{"type":"result","is_error":false,"structured_output":{"passed":true,"feedback":"","criteria_results":[{"criterion":"cited","passed":true,"feedback":"ok"}]}}"#;

    fn sh_judge(script: &str, budget: ReviewBudget) -> CommandJudge {
        CommandJudge::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            budget,
            64 * 1024,
        )
    }

    fn quick_budget() -> ReviewBudget {
        ReviewBudget {
            base: Duration::from_secs(10),
            per_file: Duration::ZERO,
            free_files: 0,
        }
    }

    fn request() -> JudgeRequest {
        JudgeRequest {
            label: "report".to_string(),
            payload: "review this".to_string(),
            file_count: 1,
        }
    }

    #[test]
    fn parses_structured_verdict() {
        let verdict = parse_reply(PASSING).expect("verdict");
        assert!(verdict.passed);
        assert_eq!(verdict.criteria_results[0].criterion, "cited");
    }

    #[test]
    fn classifies_bad_replies() {
        assert!(matches!(
            parse_reply("not json at all"),
            Err(ReviewerError::MalformedReply { .. })
        ));
        assert!(matches!(
            parse_reply(r#"{"is_error":true,"result":"rate limited"}"#),
            Err(ReviewerError::JudgeReported { excerpt }) if excerpt.contains("rate limited")
        ));
        assert!(matches!(
            parse_reply(r#"{"is_error":false,"result":"looks fine"}"#),
            Err(ReviewerError::MissingStructuredOutput { .. })
        ));
        assert!(matches!(
            parse_reply(r#"{"structured_output":{"passed":"yes"}}"#),
            Err(ReviewerError::SchemaViolation { errors, .. }) if !errors.is_empty()
        ));
    }

    #[test]
    fn excerpt_is_bounded_on_char_boundary() {
        let long = "é".repeat(EXCERPT_CHARS + 20);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(excerpt("short"), "short");
    }

    #[tokio::test]
    async fn command_judge_reads_payload_and_reply() {
        let script = format!("read line; test \"$line\" = 'review this' && printf '%s' '{PASSING}'");
        let verdict = sh_judge(&script, quick_budget())
            .review(&request())
            .await
            .expect("verdict");
        assert!(verdict.passed);
    }

    /// Verifies a judge that outlives its budget yields an error, never a verdict.
    #[tokio::test]
    async fn timed_out_judge_is_an_error() {
        let budget = ReviewBudget {
            base: Duration::from_millis(200),
            per_file: Duration::ZERO,
            free_files: 0,
        };
        let err = sh_judge("exec sleep 30", budget)
            .review(&request())
            .await
            .unwrap_err();
        assert!(matches!(err, ReviewerError::Timeout { after } if after == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_stderr() {
        let err = sh_judge("echo quota exceeded >&2; exit 7", quick_budget())
            .review(&request())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReviewerError::NonZeroExit { code: Some(7), stderr_excerpt } if stderr_excerpt == "quota exceeded"
        ));
    }

    #[tokio::test]
    async fn missing_program_is_not_installed() {
        let judge = CommandJudge::new(
            vec!["stepwise-test-missing-judge".to_string()],
            quick_budget(),
            1024,
        );
        let err = judge.review(&request()).await.unwrap_err();
        assert!(matches!(err, ReviewerError::NotInstalled { program } if program == "stepwise-test-missing-judge"));
    }

    #[tokio::test]
    async fn unstartable_program_is_a_spawn_error() {
        // Directories exist but cannot be executed.
        let judge = CommandJudge::new(vec!["/".to_string()], quick_budget(), 1024);
        let err = judge.review(&request()).await.unwrap_err();
        assert!(matches!(err, ReviewerError::Spawn(_)), "{err:?}");
    }
}
