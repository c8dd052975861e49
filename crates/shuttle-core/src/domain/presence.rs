//! Presence records: which worker instances are alive.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::InstanceId;

/// Whether an instance may be elected to run sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Worker,
    CoordinatorCandidate,
}

/// One instance's heartbeat in the shared registry.
///
/// There is no explicit deletion: an instance that stops refreshing simply
/// ages out after the presence TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub instance_id: InstanceId,
    pub last_seen_at: DateTime<Utc>,
    pub role: Role,
}

impl PresenceRecord {
    pub fn new(instance_id: InstanceId, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            last_seen_at: now,
            role,
        }
    }

    /// Expired once `now - last_seen_at` exceeds the TTL.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = (now - self.last_seen_at).to_std().unwrap_or(Duration::ZERO);
        age > ttl
    }
}
