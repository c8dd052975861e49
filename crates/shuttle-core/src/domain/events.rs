//! Domain events emitted for human visibility (logs, chat, dashboards).

use serde::{Deserialize, Serialize};

use super::ids::{AttemptToken, OwnerId, SweepId, TaskId};
use super::outcome::ReleaseOutcome;

/// Something that happened to a lease that an operator may care about.
///
/// Events are informational: nothing reads them back to make decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Claimed {
        task_id: TaskId,
        owner_id: OwnerId,
        attempt_token: AttemptToken,
        retry_count: u32,
    },

    Released {
        task_id: TaskId,
        owner_id: OwnerId,
        outcome: ReleaseOutcome,
    },

    /// A lease was found past its heartbeat threshold and made claimable again.
    Reclaimed {
        task_id: TaskId,
        prior_owner: OwnerId,
        age_secs: u64,
        retry_count: u32,
        /// `None` when the takeover happened inline in `Claim` rather than in a sweep.
        sweep_id: Option<SweepId>,
    },

    /// The owner tried to renew but another attempt holds the record.
    LostLease {
        task_id: TaskId,
        owner_id: OwnerId,
    },

    /// Retry ceiling reached; only an operator can move this task again.
    NeedsAttention {
        task_id: TaskId,
        retry_count: u32,
        max_retries: u32,
    },

    Ignored {
        task_id: TaskId,
        reason: String,
    },

    Reset {
        task_id: TaskId,
    },
}

impl DomainEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            DomainEvent::Claimed { task_id, .. }
            | DomainEvent::Released { task_id, .. }
            | DomainEvent::Reclaimed { task_id, .. }
            | DomainEvent::LostLease { task_id, .. }
            | DomainEvent::NeedsAttention { task_id, .. }
            | DomainEvent::Ignored { task_id, .. }
            | DomainEvent::Reset { task_id } => task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::Claimed { .. } => "claimed",
            DomainEvent::Released { .. } => "released",
            DomainEvent::Reclaimed { .. } => "reclaimed",
            DomainEvent::LostLease { .. } => "lost_lease",
            DomainEvent::NeedsAttention { .. } => "needs_attention",
            DomainEvent::Ignored { .. } => "ignored",
            DomainEvent::Reset { .. } => "reset",
        }
    }
}
