//! Errors and their operational classification.
//!
//! Two families never mix:
//! - **backend** failures (network, timeout, rate limit) are retried with bounded backoff
//! - **logical** failures (`AlreadyClaimed`, `LostLease`, ...) are decisions for the caller
//!   and are never retried, since retrying them would break exclusivity

use std::time::Duration;

use thiserror::Error;

use super::ids::{OwnerId, TaskId};

/// Operational classification of an error.
///
/// - Transient: retry may succeed (timeouts, rate limits)
/// - Permanent: retrying is pointless or harmful (logical conflicts, corrupt data)
/// - Infrastructure: the backend itself is down or misbehaving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure talking to a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rate limited{}", retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Timeout { .. } | StoreError::RateLimited { .. } => ErrorKind::Transient,
            StoreError::Unavailable(_) | StoreError::Io(_) => ErrorKind::Infrastructure,
            StoreError::Corrupt { .. } | StoreError::Encode(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }

    /// Backend-suggested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            StoreError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of a lease operation.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("task {task_id} is already claimed by {owner_id}")]
    AlreadyClaimed { task_id: TaskId, owner_id: OwnerId },

    #[error("lease on task {task_id} was lost to another attempt")]
    LostLease { task_id: TaskId },

    #[error("task {task_id} needs attention: {retry_count} failed attempts (max {max_retries})")]
    RetryCeilingExceeded {
        task_id: TaskId,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("task {task_id} is marked ignored")]
    Ignored { task_id: TaskId },

    #[error("backend failed after {attempts} attempt(s): {source}")]
    Backend {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl LeaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeaseError::Backend { source, .. } => source.kind(),
            _ => ErrorKind::Permanent,
        }
    }

    /// `AlreadyClaimed` / `LostLease`: a race with another owner.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            LeaseError::AlreadyClaimed { .. } | LeaseError::LostLease { .. }
        )
    }
}

/// Failure of a workspace slot operation.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("workspace pool exhausted ({pool_size} slots in use)")]
    PoolExhausted { pool_size: usize },

    #[error("unknown workspace slot {0}")]
    UnknownSlot(String),

    #[error("slot {slot_id} is not leased to {task_key}")]
    NotOwner { slot_id: String, task_key: String },

    #[error("slot registry: {0}")]
    Store(#[from] StoreError),
}
