//! Stable exit codes for stepwise CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input, definition or request, or any other error.
pub const INVALID: i32 = 1;
/// `stepwise finish` was not accepted yet: reviews asked for more work.
pub const NEEDS_WORK: i32 = 2;
/// `stepwise finish` hit the quality-attempt limit; the step is blocked.
pub const BLOCKED: i32 = 3;
