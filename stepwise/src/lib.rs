//! Quality-gated multi-step workflows for coding agents.
//!
//! A job (`.stepwise/jobs/<name>/job.toml`) declares steps and the workflows
//! that order them. The engine walks a session through a workflow one entry at
//! a time, checking each step's reported outputs and running its reviews
//! before letting the session advance. Sessions nest: starting a workflow
//! while another is active pushes it onto a stack.
//!
//! - **[`core`]**: Pure logic (workflow graph, output checks, verdict
//!   aggregation, review budgets). No I/O.
//! - **[`io`]**: Filesystem, subprocess and template plumbing behind traits so
//!   the engine can be driven by fakes in tests.
//! - **[`engine`]** and **[`gate`]**: The session state machine and the
//!   quality gate it consults.
//! - **[`hooks`]**: Agent-host hook normalization and built-in hooks.
//! - **[`rpc`]**: The engine over JSON lines on stdio.

pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod hooks;
pub mod io;
pub mod job;
pub mod logging;
pub mod rpc;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
