//! Hooks shipped with stepwise, runnable via `stepwise hook <host> <name>`.

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use anyhow::{Result, bail};

use super::canonical::{CanonicalEvent, CanonicalInput, CanonicalOutput, CanonicalTool};
use crate::core::session::Session;
use crate::io::init::StepwisePaths;
use crate::io::session_store::{FileBackend, SessionBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinHook {
    /// Inject a summary of the active session stack.
    WorkflowContext,
    /// Refuse file writes into the sessions directory.
    ProtectSessions,
}

impl BuiltinHook {
    pub const ALL: [BuiltinHook; 2] = [BuiltinHook::WorkflowContext, BuiltinHook::ProtectSessions];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinHook::WorkflowContext => "workflow-context",
            BuiltinHook::ProtectSessions => "protect-sessions",
        }
    }

    pub fn run(self, input: &CanonicalInput, paths: &StepwisePaths) -> Result<CanonicalOutput> {
        match self {
            BuiltinHook::WorkflowContext => workflow_context(input, paths),
            BuiltinHook::ProtectSessions => Ok(protect_sessions(input, paths)),
        }
    }
}

impl FromStr for BuiltinHook {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match BuiltinHook::ALL.into_iter().find(|hook| hook.name() == s) {
            Some(hook) => Ok(hook),
            None => {
                let known: Vec<_> = BuiltinHook::ALL.iter().map(|hook| hook.name()).collect();
                bail!("unknown hook '{s}' (available: {})", known.join(", "))
            }
        }
    }
}

fn workflow_context(input: &CanonicalInput, paths: &StepwisePaths) -> Result<CanonicalOutput> {
    let output = CanonicalOutput::for_input(input);
    if !matches!(
        input.event,
        CanonicalEvent::SessionStart | CanonicalEvent::BeforePrompt
    ) {
        return Ok(output);
    }
    let mut stack = FileBackend::new(&paths.sessions_dir).load_all()?;
    if stack.is_empty() {
        return Ok(output);
    }
    stack.sort_by_key(|session| session.stack_seq);
    Ok(output.with_context(describe_stack(&stack)))
}

fn describe_stack(stack: &[Session]) -> String {
    let mut text = String::from("Active stepwise workflows (innermost last):\n");
    for (depth, session) in stack.iter().enumerate() {
        let _ = write!(
            text,
            "{}. {}/{} (session {}) goal: {}; entry {}",
            depth + 1,
            session.job_name,
            session.workflow_name,
            session.session_id,
            session.goal,
            session.current_entry_index,
        );
        if !session.completed_step_ids.is_empty() {
            let _ = write!(text, "; completed: {}", session.completed_step_ids.join(", "));
        }
        if let Some(blocked) = &session.blocked {
            let _ = write!(
                text,
                "; BLOCKED on '{}' after {} attempts",
                blocked.step_id, blocked.attempts
            );
        }
        text.push('\n');
    }
    if let Some(top) = stack.last() {
        let _ = write!(
            text,
            "Report finished steps with `stepwise finish --session {}`.",
            top.session_id
        );
    }
    text
}

fn protect_sessions(input: &CanonicalInput, paths: &StepwisePaths) -> CanonicalOutput {
    let output = CanonicalOutput::for_input(input);
    if input.event != CanonicalEvent::BeforeTool
        || !input.tool.as_ref().is_some_and(CanonicalTool::writes_files)
    {
        return output;
    }
    let Some(target) = input
        .tool_input_str("file_path")
        .or_else(|| input.tool_input_str("path"))
    else {
        return output;
    };
    let base = input.cwd.as_deref().map_or_else(|| paths.root.clone(), PathBuf::from);
    let resolved = base.join(target);
    if inside_sessions_dir(&resolved) {
        return output.block(format!(
            "{target} is stepwise session state; use `stepwise finish` or `stepwise abort` instead of editing it"
        ));
    }
    output
}

/// Whether the path has a `.stepwise/sessions` pair of components.
fn inside_sessions_dir(path: &Path) -> bool {
    let names: Vec<_> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect();
    names
        .windows(2)
        .any(|pair| pair[0] == ".stepwise" && pair[1] == "sessions")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::hooks::canonical::Decision;
    use crate::hooks::host::{HostId, host_for, normalize_input};

    fn input(host: HostId, raw: serde_json::Value) -> CanonicalInput {
        normalize_input(host_for(host), &raw)
    }

    #[test]
    fn names_parse() {
        for hook in BuiltinHook::ALL {
            assert_eq!(hook.name().parse::<BuiltinHook>().expect("parse"), hook);
        }
        assert!("nope".parse::<BuiltinHook>().is_err());
    }

    #[test]
    fn protect_sessions_blocks_writes_into_session_state() {
        let paths = StepwisePaths::new("/work");
        let hit = input(
            HostId::Claude,
            json!({
                "hook_event_name": "PreToolUse",
                "tool_name": "Write",
                "cwd": "/work",
                "tool_input": { "file_path": ".stepwise/sessions/abc.json" }
            }),
        );
        let out = BuiltinHook::ProtectSessions.run(&hit, &paths).expect("run");
        assert_eq!(out.decision, Some(Decision::Block));

        let gemini = input(
            HostId::Gemini,
            json!({
                "hook_event_name": "BeforeTool",
                "tool_name": "replace",
                "tool_input": { "file_path": "/work/.stepwise/sessions/abc.json" }
            }),
        );
        assert!(BuiltinHook::ProtectSessions.run(&gemini, &paths).expect("run").decision.is_some());
    }

    #[test]
    fn protect_sessions_ignores_other_targets() {
        let paths = StepwisePaths::new("/work");
        for raw in [
            json!({ "hook_event_name": "PreToolUse", "tool_name": "Write",
                    "tool_input": { "file_path": "docs/report.md" } }),
            json!({ "hook_event_name": "PreToolUse", "tool_name": "Read",
                    "tool_input": { "file_path": ".stepwise/sessions/abc.json" } }),
            json!({ "hook_event_name": "PostToolUse", "tool_name": "Write",
                    "tool_input": { "file_path": ".stepwise/sessions/abc.json" } }),
            json!({ "hook_event_name": "PreToolUse", "tool_name": "Write",
                    "tool_input": { "file_path": ".stepwise/jobs/demo/job.toml" } }),
        ] {
            let out = BuiltinHook::ProtectSessions
                .run(&input(HostId::Claude, raw.clone()), &paths)
                .expect("run");
            assert_eq!(out.decision, None, "{raw}");
        }
    }

    #[test]
    fn workflow_context_summarizes_stack() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = StepwisePaths::new(dir.path());
        let mut backend = FileBackend::new(&paths.sessions_dir);
        let mut outer = Session::new("research", "deep", "study caching", None);
        outer.stack_seq = 1;
        outer.completed_step_ids.push("gather".to_string());
        let mut inner = Session::new("writeup", "draft", "write summary", None);
        inner.stack_seq = 2;
        backend.write(&outer).expect("write outer");
        backend.write(&inner).expect("write inner");

        let start = input(HostId::Claude, json!({ "hook_event_name": "SessionStart" }));
        let out = BuiltinHook::WorkflowContext.run(&start, &paths).expect("run");
        let context = out.additional_context.expect("context");
        let outer_at = context.find("research/deep").expect("outer listed");
        let inner_at = context.find("writeup/draft").expect("inner listed");
        assert!(outer_at < inner_at);
        assert!(context.contains("completed: gather"));
        assert!(context.contains(&format!("--session {}", inner.session_id)));

        let tool = input(HostId::Claude, json!({ "hook_event_name": "PreToolUse" }));
        let quiet = BuiltinHook::WorkflowContext.run(&tool, &paths).expect("run");
        assert_eq!(quiet.additional_context, None);
    }

    #[test]
    fn workflow_context_is_empty_without_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = StepwisePaths::new(dir.path());
        let prompt = input(HostId::Gemini, json!({ "hook_event_name": "BeforeAgent" }));
        let out = BuiltinHook::WorkflowContext.run(&prompt, &paths).expect("run");
        assert_eq!(out, CanonicalOutput::for_input(&prompt));
    }
}
