//! Host-neutral vocabulary for hook events, tools, inputs and outputs.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalEvent {
    SessionStart,
    SessionEnd,
    BeforePrompt,
    BeforeTool,
    AfterTool,
    AfterAgent,
    AfterSubagent,
    BeforeCompact,
    Notification,
}

impl CanonicalEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalEvent::SessionStart => "session_start",
            CanonicalEvent::SessionEnd => "session_end",
            CanonicalEvent::BeforePrompt => "before_prompt",
            CanonicalEvent::BeforeTool => "before_tool",
            CanonicalEvent::AfterTool => "after_tool",
            CanonicalEvent::AfterAgent => "after_agent",
            CanonicalEvent::AfterSubagent => "after_subagent",
            CanonicalEvent::BeforeCompact => "before_compact",
            CanonicalEvent::Notification => "notification",
        }
    }
}

/// Tool identity. Tools no host table knows keep their lowercased native name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalTool {
    WriteFile,
    EditFile,
    ReadFile,
    Shell,
    Glob,
    Grep,
    WebFetch,
    WebSearch,
    Task,
    Other(String),
}

impl CanonicalTool {
    pub fn as_str(&self) -> &str {
        match self {
            CanonicalTool::WriteFile => "write_file",
            CanonicalTool::EditFile => "edit_file",
            CanonicalTool::ReadFile => "read_file",
            CanonicalTool::Shell => "shell",
            CanonicalTool::Glob => "glob",
            CanonicalTool::Grep => "grep",
            CanonicalTool::WebFetch => "web_fetch",
            CanonicalTool::WebSearch => "web_search",
            CanonicalTool::Task => "task",
            CanonicalTool::Other(name) => name,
        }
    }

    /// Tools that create or modify files.
    pub fn writes_files(&self) -> bool {
        matches!(self, CanonicalTool::WriteFile | CanonicalTool::EditFile)
    }
}

impl fmt::Display for CanonicalTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hook invocation in host-neutral terms.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalInput {
    pub event: CanonicalEvent,
    /// Event name exactly as the host sent it.
    pub native_event: Option<String>,
    pub tool: Option<CanonicalTool>,
    pub native_tool: Option<String>,
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub transcript_path: Option<String>,
    pub prompt: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_response: Option<Value>,
    /// The full payload, including fields not extracted above.
    pub raw: Map<String, Value>,
}

impl CanonicalInput {
    /// String field of `tool_input`, if present.
    pub fn tool_input_str(&self, key: &str) -> Option<&str> {
        self.tool_input.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block,
}

/// What a hook wants the host to do, in host-neutral terms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalOutput {
    /// Event the output answers; encoded so the host can match it up.
    pub event: Option<CanonicalEvent>,
    pub tool: Option<CanonicalTool>,
    pub decision: Option<Decision>,
    pub reason: Option<String>,
    /// Extra context injected into the agent's conversation.
    pub additional_context: Option<String>,
    /// Message shown to the user, not the agent.
    pub system_message: Option<String>,
    pub suppress_output: bool,
    /// When set, the host stops the agent with this reason.
    pub stop_reason: Option<String>,
    /// Host-specific fields passed through verbatim. Computed fields win.
    pub extra: Map<String, Value>,
}

impl CanonicalOutput {
    /// Empty output addressed to the event (and tool) of `input`.
    pub fn for_input(input: &CanonicalInput) -> Self {
        Self {
            event: Some(input.event),
            tool: input.tool.clone(),
            ..Self::default()
        }
    }

    pub fn block(mut self, reason: impl Into<String>) -> Self {
        self.decision = Some(Decision::Block);
        self.reason = Some(reason.into());
        self
    }

    pub fn allow(mut self) -> Self {
        self.decision = Some(Decision::Allow);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.additional_context = Some(context.into());
        self
    }
}
