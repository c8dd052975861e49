//! PresenceRegistry - instance heartbeats and coordinator election.
//!
//! Election is a pure function of the registry snapshot: the live
//! coordinator candidate with the smallest instance id. No messages are
//! exchanged; instances that see the same snapshot agree. While a write is
//! still propagating two instances may both believe they coordinate, which
//! only means a redundant sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::app::backoff::{BackoffPolicy, RetriesExhausted};
use crate::domain::{InstanceId, PresenceRecord, Role};
use crate::ports::{Clock, PresenceStore};

/// `SelectCoordinator`: smallest live `CoordinatorCandidate` instance id.
///
/// Records with role `Worker` are never elected. Returns `None` when no
/// candidate is live.
pub fn select_coordinator(
    records: &[PresenceRecord],
    now: DateTime<Utc>,
    ttl: Duration,
) -> Option<InstanceId> {
    records
        .iter()
        .filter(|r| r.role == Role::CoordinatorCandidate && !r.is_expired(now, ttl))
        .map(|r| &r.instance_id)
        .min()
        .cloned()
}

/// Who coordinates, as computed for one tick.
///
/// Built fresh from the registry every time a sweep is due and passed into
/// the sweep; never cached across ticks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorContext {
    instance_id: InstanceId,
    coordinator: Option<InstanceId>,
    live_instances: Vec<InstanceId>,
    computed_at: DateTime<Utc>,
}

impl CoordinatorContext {
    pub fn from_snapshot(
        instance_id: InstanceId,
        records: &[PresenceRecord],
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let mut live_instances: Vec<InstanceId> = records
            .iter()
            .filter(|r| !r.is_expired(now, ttl))
            .map(|r| r.instance_id.clone())
            .collect();
        live_instances.sort();

        Self {
            coordinator: select_coordinator(records, now, ttl),
            instance_id,
            live_instances,
            computed_at: now,
        }
    }

    /// Operator override: act as coordinator regardless of the registry.
    pub fn assume(instance_id: InstanceId, now: DateTime<Utc>) -> Self {
        Self {
            coordinator: Some(instance_id.clone()),
            live_instances: vec![instance_id.clone()],
            instance_id,
            computed_at: now,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator.as_ref() == Some(&self.instance_id)
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn coordinator(&self) -> Option<&InstanceId> {
        self.coordinator.as_ref()
    }

    pub fn live_instances(&self) -> &[InstanceId] {
        &self.live_instances
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }
}

pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    instance_id: InstanceId,
    role: Role,
    ttl: Duration,
    backoff: BackoffPolicy,
}

impl PresenceRegistry {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
        instance_id: InstanceId,
        role: Role,
        ttl: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id,
            role,
            ttl,
            backoff,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write this instance's record with `lastSeenAt = now`.
    pub async fn heartbeat(&self) -> Result<PresenceRecord, RetriesExhausted> {
        let record = PresenceRecord::new(self.instance_id.clone(), self.role, self.clock.now());
        self.backoff
            .retry("presence_upsert", || self.store.upsert(&record))
            .await?;
        debug!(instance = %self.instance_id, role = ?self.role, "presence refreshed");
        Ok(record)
    }

    /// Every record in the registry, expired ones included.
    pub async fn snapshot(&self) -> Result<Vec<PresenceRecord>, RetriesExhausted> {
        self.backoff
            .retry("presence_list", || self.store.list())
            .await
    }

    pub async fn live(&self) -> Result<Vec<PresenceRecord>, RetriesExhausted> {
        let now = self.clock.now();
        let mut records = self.snapshot().await?;
        records.retain(|r| !r.is_expired(now, self.ttl));
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }

    /// Fresh election from a fresh snapshot.
    pub async fn coordinator_context(&self) -> Result<CoordinatorContext, RetriesExhausted> {
        let records = self.snapshot().await?;
        Ok(CoordinatorContext::from_snapshot(
            self.instance_id.clone(),
            &records,
            self.clock.now(),
            self.ttl,
        ))
    }
}
