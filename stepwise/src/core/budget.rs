//! Wall-clock budget for judge invocations.

use std::time::Duration;

/// Timeout parameters for one review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewBudget {
    pub base: Duration,
    pub per_file: Duration,
    /// Files covered by the base budget before `per_file` starts accruing.
    pub free_files: usize,
}

impl ReviewBudget {
    /// Timeout for a review over `file_count` files.
    pub fn timeout_for(&self, file_count: usize) -> Duration {
        let extra_files = file_count.saturating_sub(self.free_files);
        let extra = u32::try_from(extra_files).unwrap_or(u32::MAX);
        self.base.saturating_add(self.per_file.saturating_mul(extra))
    }
}
