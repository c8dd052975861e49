//! How an owner ends its lease.

use serde::{Deserialize, Serialize};

/// Outcome passed to `Release`.
///
/// - `Completed`: the record is cleared; the task leaves the lease system.
/// - `Failed` / `Abandoned`: the record goes stale with `retry_count + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Completed,
    Failed,
    Abandoned,
}

impl ReleaseOutcome {
    pub fn counts_as_failure(self) -> bool {
        !matches!(self, ReleaseOutcome::Completed)
    }
}

/// What a `Release` call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseEffect {
    /// Record removed (completed).
    Cleared,

    /// Record left stale for the next claimer.
    MarkedStale { retry_count: u32 },

    /// Token or owner did not match the stored record; nothing was written.
    NoOp,
}
