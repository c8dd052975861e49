//! StateStore port - persistence for one task's shared lease record.
//!
//! Backends range from a process-local map with real atomicity to an issue
//! tracker whose only "storage" is labels and comments. The contract is written
//! for the weakest of them:
//!
//! - `read` of a never-claimed task is `Ok(None)`, not an error; absence is the common case
//! - `write` replaces the whole record and is idempotent under retry
//! - `Expectation` is enforced only when `capabilities().conditional_writes` is true;
//!   otherwise callers must verify by re-reading after the write
//! - the status tag mirrors the record for cheap filtering and may lag it

use async_trait::async_trait;

use crate::domain::ids::{AttemptToken, TaskId};
use crate::domain::lease::{SharedLeaseState, StatusTag};
use crate::domain::StoreError;

/// What a backend can guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCapabilities {
    /// `write`/`clear` honour their `Expectation` atomically.
    pub conditional_writes: bool,
}

/// Precondition on the stored record for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Unconditional.
    Any,

    /// No record may exist.
    Absent,

    /// The stored record must carry this attempt token.
    Token(AttemptToken),
}

impl Expectation {
    /// Expect exactly what was observed: its token, or absence.
    pub fn observed(current: Option<&SharedLeaseState>) -> Self {
        match current {
            Some(state) => Expectation::Token(state.attempt_token),
            None => Expectation::Absent,
        }
    }

    pub fn matches(&self, current: Option<&SharedLeaseState>) -> bool {
        match (self, current) {
            (Expectation::Any, _) => true,
            (Expectation::Absent, None) => true,
            (Expectation::Absent, Some(_)) => false,
            (Expectation::Token(token), Some(state)) => &state.attempt_token == token,
            (Expectation::Token(_), None) => false,
        }
    }
}

/// Result of a write that reached the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,

    /// The precondition failed (conditional backends only).
    Conflict { current: Option<SharedLeaseState> },
}

#[async_trait]
pub trait StateStore: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    async fn read(&self, task_id: &TaskId) -> Result<Option<SharedLeaseState>, StoreError>;

    async fn write(
        &self,
        state: &SharedLeaseState,
        expect: Expectation,
    ) -> Result<WriteOutcome, StoreError>;

    /// Remove the record entirely (the task leaves the lease system).
    async fn clear(&self, task_id: &TaskId, expect: Expectation)
    -> Result<WriteOutcome, StoreError>;

    /// Every record currently stored, for sweeps and status views.
    async fn list(&self) -> Result<Vec<SharedLeaseState>, StoreError>;

    /// All labels/tags on the task, including ones this crate does not own.
    async fn list_tags(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError>;

    /// Replace the `lease:*` tag; `None` removes it.
    async fn set_status_tag(
        &self,
        task_id: &TaskId,
        tag: Option<StatusTag>,
    ) -> Result<(), StoreError>;
}
