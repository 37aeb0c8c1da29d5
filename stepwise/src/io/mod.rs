//! Side-effecting collaborators of the engine: project layout, config, job
//! definitions, session storage, the judge subprocess and templates.

pub mod config;
pub mod init;
pub mod instructions;
pub mod job_source;
pub mod judge;
pub mod process;
pub mod session_log;
pub mod session_store;
