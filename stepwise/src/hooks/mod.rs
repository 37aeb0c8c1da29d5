//! Hook normalization across agent hosts.
//!
//! Hosts send hook events in their own dialect. [`host`] maps them onto the
//! [`canonical`] vocabulary and back, [`runner`] makes a hook safe to expose
//! to a host, and [`builtin`] holds the hooks stepwise ships.

pub mod builtin;
pub mod canonical;
pub mod host;
pub mod runner;

pub use canonical::{CanonicalEvent, CanonicalInput, CanonicalOutput, CanonicalTool, Decision};
pub use host::{Host, HostId, denormalize_output, host_for, normalize_input};
pub use runner::run_hook;
