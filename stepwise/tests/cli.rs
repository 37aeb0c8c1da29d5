//! CLI tests: spawn the `stepwise` binary and check output and exit codes.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::Value;
use stepwise::exit_codes;
use stepwise::io::init::{InitOptions, init_project};

fn stepwise(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stepwise"))
        .current_dir(root)
        .env("RUST_LOG", "off")
        .args(args)
        .output()
        .expect("run stepwise")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is json")
}

#[test]
fn init_then_list_shows_example_job() {
    let temp = tempfile::tempdir().expect("tempdir");
    let init = stepwise(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));

    let again = stepwise(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));

    let list = stepwise(temp.path(), &["list"]);
    assert_eq!(list.status.code(), Some(exit_codes::OK));
    let listed = stdout_json(&list);
    assert_eq!(listed["jobs"].as_array().expect("jobs").len(), 1);

    let validate = stepwise(temp.path(), &["validate"]);
    assert_eq!(validate.status.code(), Some(exit_codes::OK));
}

#[test]
fn finish_with_missing_file_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_project(temp.path(), &InitOptions { force: false }).expect("init");

    let start = stepwise(temp.path(), &["start", "--job", "example", "--goal", "try it"]);
    assert_eq!(start.status.code(), Some(exit_codes::OK));
    let session_id = stdout_json(&start)["session_id"]
        .as_str()
        .expect("session id")
        .to_string();

    let stack = stdout_json(&stepwise(temp.path(), &["stack"]));
    assert_eq!(stack[0]["session_id"], session_id.as_str());

    let finish = stepwise(
        temp.path(),
        &["finish", "--session", &session_id, "--output", "draft=missing.md"],
    );
    assert_eq!(finish.status.code(), Some(exit_codes::INVALID));
    assert_eq!(stdout_json(&finish)["error"]["kind"], "invalid_outputs");

    let abort = stepwise(temp.path(), &["abort", "--session", &session_id]);
    assert_eq!(abort.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&abort)["stack_depth"], 0);
}

#[test]
fn hook_answers_with_json_even_for_unknown_hooks() {
    let temp = tempfile::tempdir().expect("tempdir");
    for (host, name, expected_event) in [
        ("claude", "workflow-context", Some("SessionStart")),
        ("gemini", "no-such-hook", None),
    ] {
        let mut child = Command::new(env!("CARGO_BIN_EXE_stepwise"))
            .current_dir(temp.path())
            .env("RUST_LOG", "off")
            .args(["hook", host, name])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn hook");
        child
            .stdin
            .take()
            .expect("stdin")
            .write_all(br#"{"hook_event_name":"SessionStart"}"#)
            .expect("write stdin");
        let output = child.wait_with_output().expect("hook output");
        assert_eq!(output.status.code(), Some(exit_codes::OK));
        let out = stdout_json(&output);
        match expected_event {
            Some(event) => assert_eq!(out["hookSpecificOutput"]["hookEventName"], event),
            None => assert_eq!(out, serde_json::json!({})),
        }
    }
}
