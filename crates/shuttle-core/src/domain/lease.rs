//! Shared lease record: the one piece of state every worker reads and writes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptToken, OwnerId, TaskId};

/// Lease status.
///
/// State transitions:
/// - (absent) -> Claimed -> Working -> (absent, on completion)
/// - Claimed/Working -> Stale (sweep, or owner released as failed/abandoned)
/// - Stale -> Claimed (next claim, while under the retry ceiling)
/// - any -> Ignored (operator), Ignored -> Stale (operator reset)
///
/// `Stale` is never written by the claiming owner's renew path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Claimed, no renewal seen yet.
    Claimed,

    /// At least one renewal has landed.
    Working,

    /// Presumed abandoned; claimable again while retries remain.
    Stale,

    /// Terminal "do not auto-claim" marker set by an operator path.
    Ignored,
}

impl LeaseStatus {
    /// Held by an owner (subject to heartbeat freshness).
    pub fn is_held(self) -> bool {
        matches!(self, LeaseStatus::Claimed | LeaseStatus::Working)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LeaseStatus::Claimed => "claimed",
            LeaseStatus::Working => "working",
            LeaseStatus::Stale => "stale",
            LeaseStatus::Ignored => "ignored",
        }
    }
}

/// Fast-path status label mirrored next to the primary record.
///
/// Allowed to lag the record briefly; never used to make claim decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusTag {
    Claimed,
    Working,
    Stale,
    NeedsAttention,
    Ignored,
}

impl StatusTag {
    pub const PREFIX: &'static str = "lease:";

    pub const ALL: [StatusTag; 5] = [
        StatusTag::Claimed,
        StatusTag::Working,
        StatusTag::Stale,
        StatusTag::NeedsAttention,
        StatusTag::Ignored,
    ];

    pub fn label(self) -> &'static str {
        match self {
            StatusTag::Claimed => "lease:claimed",
            StatusTag::Working => "lease:working",
            StatusTag::Stale => "lease:stale",
            StatusTag::NeedsAttention => "lease:needs-attention",
            StatusTag::Ignored => "lease:ignored",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.label() == label)
    }

    /// Tag for a record, given the retry ceiling in force.
    pub fn for_state(state: &SharedLeaseState, max_retries: u32) -> Self {
        match state.status {
            LeaseStatus::Claimed => StatusTag::Claimed,
            LeaseStatus::Working => StatusTag::Working,
            LeaseStatus::Ignored => StatusTag::Ignored,
            LeaseStatus::Stale if state.retry_count >= max_retries => StatusTag::NeedsAttention,
            LeaseStatus::Stale => StatusTag::Stale,
        }
    }
}

/// One task's shared lease state, persisted as a single JSON document.
///
/// Invariants:
/// - `heartbeat_at >= attempt_started_at`
/// - `retry_count` never decreases except through an operator reset
/// - the whole record is rewritten on every mutation; there are no partial updates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedLeaseState {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub attempt_token: AttemptToken,
    pub attempt_started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub status: LeaseStatus,
    pub retry_count: u32,
}

impl SharedLeaseState {
    /// Fresh claim record.
    pub fn claimed(
        task_id: TaskId,
        owner_id: OwnerId,
        attempt_token: AttemptToken,
        now: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        Self {
            task_id,
            owner_id,
            attempt_token,
            attempt_started_at: now,
            heartbeat_at: now,
            status: LeaseStatus::Claimed,
            retry_count,
        }
    }

    /// Time since the last heartbeat. Clock skew that puts the heartbeat in the
    /// future reads as zero age.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.heartbeat_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Held and renewed within the threshold.
    pub fn is_live(&self, now: DateTime<Utc>, stale_threshold: Duration) -> bool {
        self.status.is_held() && self.heartbeat_age(now) < stale_threshold
    }

    /// Held, but the heartbeat is at or past the threshold.
    pub fn is_overdue(&self, now: DateTime<Utc>, stale_threshold: Duration) -> bool {
        self.status.is_held() && self.heartbeat_age(now) >= stale_threshold
    }

    /// Same attempt as `token` and still held by `owner`.
    pub fn is_held_by(&self, owner: &OwnerId, token: &AttemptToken) -> bool {
        self.status.is_held() && &self.attempt_token == token && &self.owner_id == owner
    }

    /// Record a renewal. `heartbeat_at` never moves backwards.
    pub fn renewed(mut self, now: DateTime<Utc>) -> Self {
        if now > self.heartbeat_at {
            self.heartbeat_at = now;
        }
        self.status = LeaseStatus::Working;
        self
    }

    /// Mark abandoned and count the failed attempt.
    pub fn abandoned(mut self) -> Self {
        self.status = LeaseStatus::Stale;
        self.retry_count = self.retry_count.saturating_add(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::InstanceId;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn sample(now: DateTime<Utc>) -> SharedLeaseState {
        SharedLeaseState::claimed(
            TaskId::new("T-42"),
            OwnerId::new(InstanceId::new("w1"), "agent"),
            AttemptToken::from_ulid(Ulid::new()),
            now,
            0,
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn persisted_shape_uses_camel_case_fields() {
        let state = sample(t0());
        let json = serde_json::to_value(&state).unwrap();

        for key in [
            "taskId",
            "ownerId",
            "attemptToken",
            "attemptStartedAt",
            "heartbeatAt",
            "status",
            "retryCount",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["ownerId"], "w1/agent");
        assert_eq!(json["status"], "claimed");
    }

    #[test]
    fn liveness_is_strictly_below_threshold() {
        let state = sample(t0());
        let threshold = Duration::from_secs(60);

        assert!(state.is_live(t0() + chrono::Duration::seconds(59), threshold));
        assert!(!state.is_live(t0() + chrono::Duration::seconds(60), threshold));
        assert!(state.is_overdue(t0() + chrono::Duration::seconds(60), threshold));
    }

    #[test]
    fn renewal_never_moves_heartbeat_backwards() {
        let state = sample(t0()).renewed(t0() + chrono::Duration::seconds(10));
        let again = state.clone().renewed(t0() + chrono::Duration::seconds(5));

        assert_eq!(again.heartbeat_at, state.heartbeat_at);
        assert_eq!(again.status, LeaseStatus::Working);
    }

    #[test]
    fn stale_record_at_ceiling_is_tagged_needs_attention() {
        let mut state = sample(t0()).abandoned();
        assert_eq!(StatusTag::for_state(&state, 3), StatusTag::Stale);

        state.retry_count = 3;
        assert_eq!(StatusTag::for_state(&state, 3), StatusTag::NeedsAttention);
        assert_eq!(
            StatusTag::from_label("lease:needs-attention"),
            Some(StatusTag::NeedsAttention)
        );
    }
}
