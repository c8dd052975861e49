//! Workspace slots: reusable physical work areas (worktrees) on one host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slot status as persisted.
///
/// `Expired` is only ever reported by views: a leased slot past its expiry
/// stays `Leased` on disk until `prune` reclaims it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Free,
    Leased,
    Expired,
}

/// One pooled workspace.
///
/// Slots are created once and reused; they are never deleted while the pool
/// exists. A released slot keeps its `owner_task_key` as an affinity hint so
/// the same task can resume in the same workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSlot {
    pub slot_id: String,
    pub owner_task_key: Option<String>,
    pub branch: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub status: SlotStatus,
    /// When the slot last became free; drives least-recently-used selection.
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
}

impl WorkspaceSlot {
    pub fn free(slot_id: impl Into<String>) -> Self {
        Self {
            slot_id: slot_id.into(),
            owner_task_key: None,
            branch: None,
            lease_expires_at: None,
            status: SlotStatus::Free,
            released_at: None,
        }
    }

    pub fn is_bound_to(&self, task_key: &str) -> bool {
        self.owner_task_key.as_deref() == Some(task_key)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SlotStatus::Leased
            && self.lease_expires_at.is_some_and(|expires| expires <= now)
    }

    /// Status as seen at `now`, surfacing leases that have run out.
    pub fn observed_status(&self, now: DateTime<Utc>) -> SlotStatus {
        if self.lease_expired(now) {
            SlotStatus::Expired
        } else {
            self.status
        }
    }
}
