//! `stepwise`: multi-step agent workflows with quality-gated steps.
//!
//! Jobs live in `.stepwise/jobs/<name>/job.toml`; sessions are tracked in
//! `.stepwise/sessions/`. Results print as JSON on stdout, logs go to stderr.

use std::collections::btree_map::Entry;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, BufReader};
use tracing::warn;

use stepwise::core::session::{OutputValue, StepOutputs};
use stepwise::engine::{AdvanceResult, FinishRequest, StartRequest, WorkflowEngine};
use stepwise::error::EngineError;
use stepwise::exit_codes;
use stepwise::hooks::builtin::BuiltinHook;
use stepwise::hooks::{HostId, host_for, run_hook};
use stepwise::io::config::load_config;
use stepwise::io::init::{InitOptions, StepwisePaths, init_project};
use stepwise::io::job_source::{DirJobSource, JobSource};
use stepwise::logging;
use stepwise::rpc::{self, RpcError};

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Quality-gated multi-step workflows for coding agents"
)]
struct Cli {
    /// Project root containing `.stepwise/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.stepwise/` with a default config and an example job.
    Init {
        /// Overwrite an existing layout.
        #[arg(short, long)]
        force: bool,
    },
    /// List jobs and their workflows.
    List,
    /// Check the config and every job definition.
    Validate,
    /// Start a workflow session, nested under the current one if any.
    Start {
        #[arg(long)]
        job: String,
        /// Required when the job has several workflows.
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long, default_value = "")]
        goal: String,
        #[arg(long = "instance")]
        instance_id: Option<String>,
    },
    /// Report a finished step and advance the session.
    Finish {
        #[arg(long = "session")]
        session_id: String,
        /// Required while several steps of a parallel group are pending.
        #[arg(long = "step")]
        step_id: Option<String>,
        /// `name=path`; repeat a name to submit a list.
        #[arg(long = "output", value_parser = parse_output)]
        outputs: Vec<(String, String)>,
        /// Accept the step despite reviews that could not complete.
        #[arg(long)]
        override_reason: Option<String>,
    },
    /// Abort a session and resume its parent.
    Abort {
        #[arg(long = "session")]
        session_id: String,
        #[arg(long, default_value = "aborted from the command line")]
        reason: String,
    },
    /// Print the active session stack, outermost first.
    Stack,
    /// Serve JSON-lines requests on stdin/stdout.
    Serve,
    /// Run a built-in hook for an agent host (stdin JSON in, JSON out).
    Hook {
        /// `claude` or `gemini`.
        host: String,
        /// `workflow-context` or `protect-sessions`.
        name: String,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let root = cli.root;
    match cli.command {
        Command::Init { force } => {
            let paths = init_project(&root, &InitOptions { force })?;
            print_json(&json!({
                "stepwise_dir": paths.stepwise_dir,
                "config": paths.config_path,
                "jobs_dir": paths.jobs_dir,
            }))?;
            Ok(exit_codes::OK)
        }
        Command::List => {
            let engine = WorkflowEngine::open(&root)?;
            report(engine.list_workflows().await, |_| exit_codes::OK)
        }
        Command::Validate => cmd_validate(&root),
        Command::Start {
            job,
            workflow,
            goal,
            instance_id,
        } => {
            let engine = WorkflowEngine::open(&root)?;
            let request = StartRequest {
                job,
                workflow,
                goal,
                instance_id,
            };
            report(engine.start(request).await, |_| exit_codes::OK)
        }
        Command::Finish {
            session_id,
            step_id,
            outputs,
            override_reason,
        } => {
            let engine = WorkflowEngine::open(&root)?;
            let request = FinishRequest {
                session_id,
                step_id,
                outputs: collect_outputs(outputs),
                override_reason,
            };
            report(engine.finished_step(request).await, |result| match result {
                AdvanceResult::NeedsWork { .. } => exit_codes::NEEDS_WORK,
                _ => exit_codes::OK,
            })
        }
        Command::Abort { session_id, reason } => {
            let engine = WorkflowEngine::open(&root)?;
            report(engine.abort(&session_id, &reason).await, |_| exit_codes::OK)
        }
        Command::Stack => {
            let engine = WorkflowEngine::open(&root)?;
            report(engine.stack().await, |_| exit_codes::OK)
        }
        Command::Serve => {
            let engine = WorkflowEngine::open(&root)?;
            rpc::serve(&engine, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
            Ok(exit_codes::OK)
        }
        Command::Hook { host, name } => cmd_hook(&root, &host, &name).await,
    }
}

fn cmd_validate(root: &Path) -> Result<i32> {
    let paths = StepwisePaths::new(root);
    load_config(&paths.config_path)?;
    let scan = DirJobSource::new(&paths.jobs_dir).scan()?;
    let valid: Vec<_> = scan.jobs.iter().map(|job| job.name.as_str()).collect();
    print_json(&json!({ "valid": valid, "invalid": scan.invalid }))?;
    Ok(if scan.invalid.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

/// Hooks always answer with one JSON object and exit 0, whatever goes wrong.
async fn cmd_hook(root: &Path, host: &str, name: &str) -> Result<i32> {
    let mut stdin = String::new();
    if let Err(err) = tokio::io::stdin().read_to_string(&mut stdin).await {
        warn!(error = %err, "could not read hook input");
    }
    let (host, hook) = match (host.parse::<HostId>(), name.parse::<BuiltinHook>()) {
        (Ok(host), Ok(hook)) => (host_for(host), hook),
        (Err(err), _) | (_, Err(err)) => {
            warn!(error = %err, "unusable hook invocation");
            println!("{{}}");
            return Ok(exit_codes::OK);
        }
    };
    let paths = StepwisePaths::new(root);
    let output = run_hook(host, &stdin, |input| hook.run(input, &paths));
    println!("{output}");
    Ok(exit_codes::OK)
}

/// Print an engine result, or its error as `{"error": {...}}`, and pick the exit code.
fn report<T: Serialize>(
    result: Result<T, EngineError>,
    code_for: impl FnOnce(&T) -> i32,
) -> Result<i32> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(code_for(&value))
        }
        Err(err) => {
            eprintln!("{err}");
            let code = match err {
                EngineError::QualityGateExhausted { .. } => exit_codes::BLOCKED,
                _ => exit_codes::INVALID,
            };
            print_json(&json!({ "error": RpcError::from(err) }))?;
            Ok(code)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize result")?;
    println!("{payload}");
    Ok(())
}

fn parse_output(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => {
            Ok((name.to_string(), path.to_string()))
        }
        _ => Err(format!("expected name=path, got '{raw}'")),
    }
}

/// Repeated names become lists; a name given once stays a single path.
fn collect_outputs(pairs: Vec<(String, String)>) -> StepOutputs {
    let mut outputs = StepOutputs::new();
    for (name, path) in pairs {
        match outputs.entry(name) {
            Entry::Vacant(slot) => {
                slot.insert(OutputValue::Single(path));
            }
            Entry::Occupied(mut slot) => {
                let merged = match slot.get_mut() {
                    OutputValue::Single(first) => {
                        OutputValue::List(vec![std::mem::take(first), path])
                    }
                    OutputValue::List(paths) => {
                        paths.push(path);
                        continue;
                    }
                };
                slot.insert(merged);
            }
        }
    }
    outputs
}
