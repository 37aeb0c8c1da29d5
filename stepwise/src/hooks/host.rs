//! Host adapters: native hook vocabulary <-> canonical vocabulary.
//!
//! | Canonical | Claude | Gemini |
//! |---|---|---|
//! | session_start | SessionStart | SessionStart |
//! | session_end | SessionEnd | SessionEnd |
//! | before_prompt | UserPromptSubmit | BeforeAgent |
//! | before_tool | PreToolUse | BeforeTool |
//! | after_tool | PostToolUse | AfterTool |
//! | after_agent | Stop | AfterAgent |
//! | after_subagent | SubagentStop | (none) |
//! | before_compact | PreCompact | PreCompress |
//! | notification | Notification | Notification |

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde_json::{Map, Value, json};

use super::canonical::{CanonicalEvent, CanonicalInput, CanonicalOutput, CanonicalTool, Decision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostId {
    Claude,
    Gemini,
}

impl HostId {
    pub fn as_str(self) -> &'static str {
        match self {
            HostId::Claude => "claude",
            HostId::Gemini => "gemini",
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(HostId::Claude),
            "gemini" => Ok(HostId::Gemini),
            other => bail!("unknown host '{other}' (expected claude or gemini)"),
        }
    }
}

/// One agent host's hook dialect.
///
/// Name mappings come from the host's tables; only the output encoding differs
/// in code.
pub trait Host: Send + Sync {
    fn id(&self) -> HostId;

    /// Native event name -> canonical event.
    fn events(&self) -> &'static [(&'static str, CanonicalEvent)];

    /// Native tool name -> canonical tool.
    fn tools(&self) -> &'static [(&'static str, CanonicalTool)];

    fn encode_output(&self, output: &CanonicalOutput) -> Value;

    fn to_canonical_event(&self, native: &str) -> Option<CanonicalEvent> {
        self.events()
            .iter()
            .find(|(name, _)| *name == native)
            .map(|(_, event)| *event)
    }

    /// `None` when the host has no such event.
    fn from_canonical_event(&self, event: CanonicalEvent) -> Option<&'static str> {
        self.events()
            .iter()
            .find(|(_, candidate)| *candidate == event)
            .map(|(name, _)| *name)
    }

    fn to_canonical_tool(&self, native: &str) -> CanonicalTool {
        self.tools()
            .iter()
            .find(|(name, _)| *name == native)
            .map(|(_, tool)| tool.clone())
            .unwrap_or_else(|| CanonicalTool::Other(native.to_lowercase()))
    }

    fn from_canonical_tool(&self, tool: &CanonicalTool) -> String {
        self.tools()
            .iter()
            .find(|(_, candidate)| candidate == tool)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_else(|| tool.as_str().to_string())
    }
}

pub struct ClaudeHost;

const CLAUDE_EVENTS: &[(&str, CanonicalEvent)] = &[
    ("SessionStart", CanonicalEvent::SessionStart),
    ("SessionEnd", CanonicalEvent::SessionEnd),
    ("UserPromptSubmit", CanonicalEvent::BeforePrompt),
    ("PreToolUse", CanonicalEvent::BeforeTool),
    ("PostToolUse", CanonicalEvent::AfterTool),
    ("Stop", CanonicalEvent::AfterAgent),
    ("SubagentStop", CanonicalEvent::AfterSubagent),
    ("PreCompact", CanonicalEvent::BeforeCompact),
    ("Notification", CanonicalEvent::Notification),
];

const CLAUDE_TOOLS: &[(&str, CanonicalTool)] = &[
    ("Write", CanonicalTool::WriteFile),
    ("Edit", CanonicalTool::EditFile),
    ("Read", CanonicalTool::ReadFile),
    ("Bash", CanonicalTool::Shell),
    ("Glob", CanonicalTool::Glob),
    ("Grep", CanonicalTool::Grep),
    ("WebFetch", CanonicalTool::WebFetch),
    ("WebSearch", CanonicalTool::WebSearch),
    ("Task", CanonicalTool::Task),
];

impl Host for ClaudeHost {
    fn id(&self) -> HostId {
        HostId::Claude
    }

    fn events(&self) -> &'static [(&'static str, CanonicalEvent)] {
        CLAUDE_EVENTS
    }

    fn tools(&self) -> &'static [(&'static str, CanonicalTool)] {
        CLAUDE_TOOLS
    }

    fn encode_output(&self, output: &CanonicalOutput) -> Value {
        let mut out = Map::new();
        if let Some(decision) = output.decision {
            let word = match decision {
                Decision::Allow => "approve",
                Decision::Block => "block",
            };
            out.insert("decision".into(), json!(word));
        }
        let mut specific = identity(self, output);
        if let Some(context) = &output.additional_context {
            specific.insert("additionalContext".into(), json!(context));
        }
        if !specific.is_empty() {
            out.insert("hookSpecificOutput".into(), Value::Object(specific));
        }
        if output.suppress_output {
            out.insert("suppressOutput".into(), json!(true));
        }
        encode_common(output, out)
    }
}

pub struct GeminiHost;

const GEMINI_EVENTS: &[(&str, CanonicalEvent)] = &[
    ("SessionStart", CanonicalEvent::SessionStart),
    ("SessionEnd", CanonicalEvent::SessionEnd),
    ("BeforeAgent", CanonicalEvent::BeforePrompt),
    ("BeforeTool", CanonicalEvent::BeforeTool),
    ("AfterTool", CanonicalEvent::AfterTool),
    ("AfterAgent", CanonicalEvent::AfterAgent),
    ("PreCompress", CanonicalEvent::BeforeCompact),
    ("Notification", CanonicalEvent::Notification),
];

const GEMINI_TOOLS: &[(&str, CanonicalTool)] = &[
    ("write_file", CanonicalTool::WriteFile),
    ("replace", CanonicalTool::EditFile),
    ("read_file", CanonicalTool::ReadFile),
    ("run_shell_command", CanonicalTool::Shell),
    ("glob", CanonicalTool::Glob),
    ("search_file_content", CanonicalTool::Grep),
    ("web_fetch", CanonicalTool::WebFetch),
    ("google_web_search", CanonicalTool::WebSearch),
];

impl Host for GeminiHost {
    fn id(&self) -> HostId {
        HostId::Gemini
    }

    fn events(&self) -> &'static [(&'static str, CanonicalEvent)] {
        GEMINI_EVENTS
    }

    fn tools(&self) -> &'static [(&'static str, CanonicalTool)] {
        GEMINI_TOOLS
    }

    fn encode_output(&self, output: &CanonicalOutput) -> Value {
        let mut out = Map::new();
        if let Some(decision) = output.decision {
            let word = match decision {
                Decision::Allow => "allow",
                Decision::Block => "deny",
            };
            out.insert("decision".into(), json!(word));
        }
        if let Some(context) = &output.additional_context {
            out.insert("additionalContext".into(), json!(context));
        }
        let specific = identity(self, output);
        if !specific.is_empty() {
            out.insert("hookSpecificOutput".into(), Value::Object(specific));
        }
        if output.suppress_output {
            out.insert("quiet".into(), json!(true));
        }
        encode_common(output, out)
    }
}

/// `hookEventName`/`toolName` in the host's own vocabulary.
fn identity(host: &dyn Host, output: &CanonicalOutput) -> Map<String, Value> {
    let mut specific = Map::new();
    if let Some(name) = output.event.and_then(|event| host.from_canonical_event(event)) {
        specific.insert("hookEventName".into(), json!(name));
    }
    if let Some(tool) = &output.tool {
        specific.insert("toolName".into(), json!(host.from_canonical_tool(tool)));
    }
    specific
}

/// Fields both hosts spell the same way, then the pass-through extras.
fn encode_common(output: &CanonicalOutput, mut out: Map<String, Value>) -> Value {
    if let Some(reason) = &output.reason {
        out.insert("reason".into(), json!(reason));
    }
    if let Some(message) = &output.system_message {
        out.insert("systemMessage".into(), json!(message));
    }
    if let Some(stop) = &output.stop_reason {
        out.insert("continue".into(), json!(false));
        out.insert("stopReason".into(), json!(stop));
    }
    for (key, value) in &output.extra {
        out.entry(key.clone()).or_insert_with(|| value.clone());
    }
    Value::Object(out)
}

static CLAUDE: ClaudeHost = ClaudeHost;
static GEMINI: GeminiHost = GeminiHost;

pub fn host_for(id: HostId) -> &'static dyn Host {
    match id {
        HostId::Claude => &CLAUDE,
        HostId::Gemini => &GEMINI,
    }
}

/// Read a host payload into canonical form. Never fails: a non-object payload
/// yields an empty input and an unknown event is treated as `AfterAgent`.
pub fn normalize_input(host: &dyn Host, raw: &Value) -> CanonicalInput {
    let raw = raw.as_object().cloned().unwrap_or_default();
    let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);

    let native_event = text("hook_event_name");
    let native_tool = text("tool_name");
    CanonicalInput {
        event: native_event
            .as_deref()
            .and_then(|name| host.to_canonical_event(name))
            .unwrap_or(CanonicalEvent::AfterAgent),
        tool: native_tool.as_deref().map(|name| host.to_canonical_tool(name)),
        session_id: text("session_id"),
        cwd: text("cwd"),
        transcript_path: text("transcript_path"),
        prompt: text("prompt"),
        tool_input: raw.get("tool_input").cloned(),
        tool_response: raw.get("tool_response").cloned(),
        native_event,
        native_tool,
        raw,
    }
}

pub fn denormalize_output(host: &dyn Host, output: &CanonicalOutput) -> Value {
    host.encode_output(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> [&'static dyn Host; 2] {
        [host_for(HostId::Claude), host_for(HostId::Gemini)]
    }

    /// Verifies every table pair survives normalize -> denormalize.
    #[test]
    fn event_and_tool_names_round_trip() {
        for host in hosts() {
            for (event, _) in host.events() {
                for (tool, _) in host.tools() {
                    let raw = json!({ "hook_event_name": event, "tool_name": tool });
                    let input = normalize_input(host, &raw);
                    let encoded = denormalize_output(host, &CanonicalOutput::for_input(&input));
                    assert_eq!(encoded["hookSpecificOutput"]["hookEventName"], *event, "{}", host.id());
                    assert_eq!(encoded["hookSpecificOutput"]["toolName"], *tool, "{}", host.id());
                }
            }
        }
    }

    #[test]
    fn tables_are_one_to_one() {
        for host in hosts() {
            for (name, event) in host.events() {
                assert_eq!(host.from_canonical_event(*event), Some(*name));
            }
            for (name, tool) in host.tools() {
                assert_eq!(host.from_canonical_tool(tool), *name);
            }
        }
    }

    #[test]
    fn same_meaning_maps_to_same_canonical_name() {
        let claude = host_for(HostId::Claude);
        let gemini = host_for(HostId::Gemini);
        assert_eq!(claude.to_canonical_tool("Bash"), gemini.to_canonical_tool("run_shell_command"));
        assert_eq!(claude.to_canonical_tool("Edit"), gemini.to_canonical_tool("replace"));
        assert_eq!(
            claude.to_canonical_event("UserPromptSubmit"),
            gemini.to_canonical_event("BeforeAgent")
        );
        assert_eq!(gemini.from_canonical_event(CanonicalEvent::AfterSubagent), None);
    }

    #[test]
    fn unknown_names_degrade_gracefully() {
        let claude = host_for(HostId::Claude);
        let input = normalize_input(
            claude,
            &json!({ "hook_event_name": "SomethingNew", "tool_name": "MultiEdit" }),
        );
        assert_eq!(input.event, CanonicalEvent::AfterAgent);
        assert_eq!(input.tool, Some(CanonicalTool::Other("multiedit".to_string())));

        let empty = normalize_input(claude, &json!(["not", "an", "object"]));
        assert_eq!(empty.event, CanonicalEvent::AfterAgent);
        assert!(empty.raw.is_empty());
    }

    #[test]
    fn extracts_known_fields_and_keeps_raw() {
        let input = normalize_input(
            host_for(HostId::Gemini),
            &json!({
                "hook_event_name": "BeforeTool",
                "session_id": "s1",
                "cwd": "/work",
                "tool_name": "write_file",
                "tool_input": { "file_path": "a.md" },
                "custom": 1
            }),
        );
        assert_eq!(input.event, CanonicalEvent::BeforeTool);
        assert_eq!(input.tool, Some(CanonicalTool::WriteFile));
        assert_eq!(input.session_id.as_deref(), Some("s1"));
        assert_eq!(input.tool_input_str("file_path"), Some("a.md"));
        assert_eq!(input.raw["custom"], 1);
    }

    #[test]
    fn host_quirks_are_encoded() {
        let output = CanonicalOutput {
            event: Some(CanonicalEvent::SessionStart),
            additional_context: Some("ctx".to_string()),
            suppress_output: true,
            ..CanonicalOutput::default()
        }
        .block("no");

        let claude = denormalize_output(host_for(HostId::Claude), &output);
        assert_eq!(claude["decision"], "block");
        assert_eq!(claude["suppressOutput"], true);
        assert_eq!(claude["hookSpecificOutput"]["additionalContext"], "ctx");
        assert!(claude.get("additionalContext").is_none());

        let gemini = denormalize_output(host_for(HostId::Gemini), &output);
        assert_eq!(gemini["decision"], "deny");
        assert_eq!(gemini["quiet"], true);
        assert_eq!(gemini["additionalContext"], "ctx");
        assert_eq!(gemini["reason"], "no");

        let allowed = CanonicalOutput::default().allow();
        assert_eq!(denormalize_output(host_for(HostId::Claude), &allowed)["decision"], "approve");
        assert_eq!(denormalize_output(host_for(HostId::Gemini), &allowed)["decision"], "allow");
    }

    #[test]
    fn empty_output_is_empty_object() {
        for host in hosts() {
            assert_eq!(denormalize_output(host, &CanonicalOutput::default()), json!({}));
        }
    }

    #[test]
    fn extra_never_overwrites_computed_fields() {
        let mut output = CanonicalOutput::default().block("computed");
        output.extra.insert("reason".into(), json!("from extra"));
        output.extra.insert("custom".into(), json!(42));
        let encoded = denormalize_output(host_for(HostId::Claude), &output);
        assert_eq!(encoded["reason"], "computed");
        assert_eq!(encoded["custom"], 42);
    }

    #[test]
    fn host_ids_parse_case_insensitively() {
        assert_eq!("Claude".parse::<HostId>().expect("claude"), HostId::Claude);
        assert_eq!("gemini".parse::<HostId>().expect("gemini"), HostId::Gemini);
        assert!("cursor".parse::<HostId>().is_err());
    }
}
