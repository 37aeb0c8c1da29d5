//! Wraps a hook so that it always answers the host with valid JSON.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::canonical::{CanonicalInput, CanonicalOutput};
use super::host::{Host, denormalize_output, normalize_input};

/// Run `hook` against the raw stdin payload and encode its answer for `host`.
///
/// Unparseable input is treated as an empty payload. An error or a panic in
/// the hook becomes a block decision so the host never sees a crash.
pub fn run_hook<F>(host: &dyn Host, stdin: &str, hook: F) -> Value
where
    F: FnOnce(&CanonicalInput) -> anyhow::Result<CanonicalOutput>,
{
    let raw = match serde_json::from_str::<Value>(stdin) {
        Ok(value) => value,
        Err(err) => {
            debug!(host = %host.id(), error = %err, "hook input is not JSON; using empty payload");
            Value::Object(Map::new())
        }
    };
    let input = normalize_input(host, &raw);

    let output = match catch_unwind(AssertUnwindSafe(|| hook(&input))) {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(host = %host.id(), event = input.event.as_str(), error = %format!("{err:#}"), "hook failed");
            CanonicalOutput::for_input(&input).block(format!("stepwise hook failed: {err:#}"))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(host = %host.id(), event = input.event.as_str(), panic = %message, "hook panicked");
            CanonicalOutput::for_input(&input).block(format!("stepwise hook panicked: {message}"))
        }
    };
    denormalize_output(host, &output)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use serde_json::json;

    use super::*;
    use crate::hooks::canonical::CanonicalEvent;
    use crate::hooks::host::{HostId, host_for};

    #[test]
    fn passes_normalized_input_to_hook() {
        let out = run_hook(
            host_for(HostId::Claude),
            r#"{"hook_event_name":"UserPromptSubmit","prompt":"hi"}"#,
            |input| {
                assert_eq!(input.event, CanonicalEvent::BeforePrompt);
                assert_eq!(input.prompt.as_deref(), Some("hi"));
                Ok(CanonicalOutput::for_input(input).with_context("ctx"))
            },
        );
        assert_eq!(out["hookSpecificOutput"]["hookEventName"], "UserPromptSubmit");
        assert_eq!(out["hookSpecificOutput"]["additionalContext"], "ctx");
    }

    #[test]
    fn garbage_input_becomes_empty_payload() {
        let out = run_hook(host_for(HostId::Gemini), "not json {", |input| {
            assert!(input.raw.is_empty());
            Ok(CanonicalOutput::default())
        });
        assert_eq!(out, json!({}));
    }

    /// Verifies a failing hook turns into a deny instead of an error exit.
    #[test]
    fn error_becomes_block_decision() {
        let out = run_hook(
            host_for(HostId::Gemini),
            r#"{"hook_event_name":"BeforeTool","tool_name":"write_file"}"#,
            |_| Err(anyhow!("disk on fire")),
        );
        assert_eq!(out["decision"], "deny");
        assert!(out["reason"].as_str().expect("reason").contains("disk on fire"));
        assert_eq!(out["hookSpecificOutput"]["toolName"], "write_file");
    }

    #[test]
    fn panic_becomes_block_decision() {
        let out = run_hook(
            host_for(HostId::Claude),
            r#"{"hook_event_name":"PreToolUse"}"#,
            |_| panic!("boom"),
        );
        assert_eq!(out["decision"], "block");
        assert!(out["reason"].as_str().expect("reason").contains("boom"));
    }
}
