//! WorkspaceAllocator - binds tasks to pooled workspace slots on this host.
//!
//! Slots are created lazily up to the pool size and then reused forever.
//! A released slot keeps `ownerTaskKey` and `branch` as an affinity hint, so
//! a task that comes back resumes in the workspace it used before.
//!
//! Slot expiry is independent of task leases: a task lease can go stale while
//! its slot is fine, and a slot can expire while the lease is still renewed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{AllocError, SlotStatus, WorkspaceSlot};
use crate::ports::{Clock, SlotStore};

const SLOT_PREFIX: &str = "slot-";

pub struct WorkspaceAllocator {
    store: Arc<dyn SlotStore>,
    clock: Arc<dyn Clock>,
    pool_size: usize,
    lease_ttl: Duration,
    // load-modify-save must not interleave within this process
    registry: Mutex<()>,
}

impl WorkspaceAllocator {
    pub fn new(
        store: Arc<dyn SlotStore>,
        clock: Arc<dyn Clock>,
        pool_size: usize,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            pool_size,
            lease_ttl,
            registry: Mutex::new(()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Lease a slot to `task_key`.
    ///
    /// Preference: a slot this task already holds (its expiry is refreshed),
    /// then a free slot last used by this task, then the least recently
    /// released free slot, then a new slot while the pool has room. A slot
    /// leased to another task is never handed out. Never waits: a full pool
    /// is `PoolExhausted` straight away.
    pub async fn acquire(&self, task_key: &str) -> Result<WorkspaceSlot, AllocError> {
        let _registry = self.registry.lock().await;
        let now = self.clock.now();
        let mut slots = self.store.load().await?;
        reclaim_expired(&mut slots, now);

        if let Some(held) = slots
            .iter_mut()
            .find(|slot| slot.status == SlotStatus::Leased && slot.is_bound_to(task_key))
        {
            held.lease_expires_at = Some(self.expiry(now));
            let resumed = held.clone();
            self.store.save(&slots).await?;
            debug!(slot = %resumed.slot_id, task = task_key, "workspace slot resumed");
            return Ok(resumed);
        }

        let index = match pick_free(&slots, task_key) {
            Some(index) => index,
            None if slots.len() < self.pool_size => {
                slots.push(WorkspaceSlot::free(next_slot_id(&slots)));
                slots.len() - 1
            }
            None => {
                return Err(AllocError::PoolExhausted {
                    pool_size: self.pool_size,
                });
            }
        };

        let slot = &mut slots[index];
        if !slot.is_bound_to(task_key) {
            slot.branch = None;
        }
        slot.owner_task_key = Some(task_key.to_string());
        slot.status = SlotStatus::Leased;
        slot.lease_expires_at = Some(self.expiry(now));
        let acquired = slot.clone();

        self.store.save(&slots).await?;
        debug!(slot = %acquired.slot_id, task = task_key, "workspace slot acquired");
        Ok(acquired)
    }

    /// Mark the slot free for reassignment. Contents are left as they are.
    pub async fn release(&self, slot_id: &str) -> Result<WorkspaceSlot, AllocError> {
        let _registry = self.registry.lock().await;
        let now = self.clock.now();
        let mut slots = self.store.load().await?;

        let slot = find_mut(&mut slots, slot_id)?;
        if slot.status == SlotStatus::Free {
            return Ok(slot.clone());
        }
        mark_free(slot, now);
        let released = slot.clone();

        self.store.save(&slots).await?;
        debug!(slot = slot_id, task = ?released.owner_task_key, "workspace slot released");
        Ok(released)
    }

    /// Push the slot's expiry forward. Only the task holding it may renew.
    pub async fn renew(&self, slot_id: &str, task_key: &str) -> Result<WorkspaceSlot, AllocError> {
        self.update_leased(slot_id, task_key, |slot, allocator, now| {
            slot.lease_expires_at = Some(allocator.expiry(now));
        })
        .await
    }

    pub async fn bind_branch(
        &self,
        slot_id: &str,
        task_key: &str,
        branch: &str,
    ) -> Result<WorkspaceSlot, AllocError> {
        self.update_leased(slot_id, task_key, |slot, _, _| {
            slot.branch = Some(branch.to_string());
        })
        .await
    }

    /// Free every leased slot whose lease ran out without renewal.
    pub async fn prune(&self) -> Result<Vec<String>, AllocError> {
        let _registry = self.registry.lock().await;
        let mut slots = self.store.load().await?;
        let pruned = reclaim_expired(&mut slots, self.clock.now());

        if !pruned.is_empty() {
            self.store.save(&slots).await?;
            info!(slots = ?pruned, "expired workspace slots reclaimed");
        }
        Ok(pruned)
    }

    /// All slots, with leases past expiry reported as `Expired`.
    pub async fn slots(&self) -> Result<Vec<WorkspaceSlot>, AllocError> {
        let now = self.clock.now();
        let mut slots = self.store.load().await?;
        for slot in &mut slots {
            slot.status = slot.observed_status(now);
        }
        Ok(slots)
    }

    async fn update_leased(
        &self,
        slot_id: &str,
        task_key: &str,
        update: impl FnOnce(&mut WorkspaceSlot, &Self, DateTime<Utc>),
    ) -> Result<WorkspaceSlot, AllocError> {
        let _registry = self.registry.lock().await;
        let now = self.clock.now();
        let mut slots = self.store.load().await?;

        let slot = find_mut(&mut slots, slot_id)?;
        if slot.status != SlotStatus::Leased || !slot.is_bound_to(task_key) {
            return Err(AllocError::NotOwner {
                slot_id: slot_id.to_string(),
                task_key: task_key.to_string(),
            });
        }
        update(slot, self, now);
        let updated = slot.clone();

        self.store.save(&slots).await?;
        Ok(updated)
    }

    fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn pick_free(slots: &[WorkspaceSlot], task_key: &str) -> Option<usize> {
    let free = || {
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.status == SlotStatus::Free)
    };

    free()
        .find(|(_, slot)| slot.is_bound_to(task_key))
        .or_else(|| {
            // never-used slots (no released_at) sort first
            free().min_by(|(_, a), (_, b)| {
                a.released_at
                    .cmp(&b.released_at)
                    .then_with(|| a.slot_id.cmp(&b.slot_id))
            })
        })
        .map(|(index, _)| index)
}

fn find_mut<'a>(
    slots: &'a mut [WorkspaceSlot],
    slot_id: &str,
) -> Result<&'a mut WorkspaceSlot, AllocError> {
    slots
        .iter_mut()
        .find(|slot| slot.slot_id == slot_id)
        .ok_or_else(|| AllocError::UnknownSlot(slot_id.to_string()))
}

fn mark_free(slot: &mut WorkspaceSlot, now: DateTime<Utc>) {
    slot.status = SlotStatus::Free;
    slot.lease_expires_at = None;
    slot.released_at = Some(now);
}

fn reclaim_expired(slots: &mut [WorkspaceSlot], now: DateTime<Utc>) -> Vec<String> {
    let mut reclaimed = Vec::new();
    for slot in slots.iter_mut().filter(|slot| slot.lease_expired(now)) {
        mark_free(slot, now);
        reclaimed.push(slot.slot_id.clone());
    }
    reclaimed
}

fn next_slot_id(slots: &[WorkspaceSlot]) -> String {
    (0..)
        .map(|n| format!("{SLOT_PREFIX}{n}"))
        .find(|id| slots.iter().all(|slot| &slot.slot_id != id))
        .unwrap_or_else(|| format!("{SLOT_PREFIX}{}", slots.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemorySlotStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn allocator(pool_size: usize) -> (WorkspaceAllocator, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let allocator = WorkspaceAllocator::new(
            Arc::new(InMemorySlotStore::new()),
            Arc::new(clock.clone()),
            pool_size,
            Duration::from_secs(600),
        );
        (allocator, clock)
    }

    #[tokio::test]
    async fn slots_are_created_lazily_up_to_pool_size() {
        let (allocator, _) = allocator(2);

        let a = allocator.acquire("T-1").await.unwrap();
        let b = allocator.acquire("T-2").await.unwrap();
        assert_eq!(a.slot_id, "slot-0");
        assert_eq!(b.slot_id, "slot-1");

        assert!(matches!(
            allocator.acquire("T-3").await,
            Err(AllocError::PoolExhausted { pool_size: 2 })
        ));
    }

    #[tokio::test]
    async fn released_slot_is_resumed_by_the_same_task() {
        let (allocator, clock) = allocator(3);
        let a = allocator.acquire("T-1").await.unwrap();
        allocator.bind_branch(&a.slot_id, "T-1", "task/T-1").await.unwrap();
        allocator.acquire("T-2").await.unwrap();
        allocator.release(&a.slot_id).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let again = allocator.acquire("T-1").await.unwrap();

        assert_eq!(again.slot_id, a.slot_id);
        assert_eq!(again.branch.as_deref(), Some("task/T-1"));
    }

    #[tokio::test]
    async fn least_recently_released_slot_is_reused_first() {
        let (allocator, clock) = allocator(2);
        let a = allocator.acquire("T-1").await.unwrap();
        let b = allocator.acquire("T-2").await.unwrap();

        allocator.release(&b.slot_id).await.unwrap();
        clock.advance(Duration::from_secs(5));
        allocator.release(&a.slot_id).await.unwrap();

        let next = allocator.acquire("T-3").await.unwrap();
        assert_eq!(next.slot_id, b.slot_id);
        assert_eq!(next.branch, None);
    }

    #[tokio::test]
    async fn slot_already_held_by_the_task_is_resumed_with_fresh_expiry() {
        let (allocator, clock) = allocator(1);
        let first = allocator.acquire("T-1").await.unwrap();
        clock.advance(Duration::from_secs(300));

        let second = allocator.acquire("T-1").await.unwrap();

        assert_eq!(second.slot_id, first.slot_id);
        assert_eq!(second.status, SlotStatus::Leased);
        assert!(second.lease_expires_at > first.lease_expires_at);
        assert_eq!(allocator.slots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slot_leased_to_another_task_is_not_handed_out() {
        let (allocator, _) = allocator(1);
        allocator.acquire("T-1").await.unwrap();

        assert!(matches!(
            allocator.acquire("T-2").await,
            Err(AllocError::PoolExhausted { pool_size: 1 })
        ));
    }

    #[tokio::test]
    async fn prune_frees_slots_past_expiry_and_view_reports_them_first() {
        let (allocator, clock) = allocator(1);
        let slot = allocator.acquire("T-1").await.unwrap();
        clock.advance(Duration::from_secs(601));

        let view = allocator.slots().await.unwrap();
        assert_eq!(view[0].status, SlotStatus::Expired);

        assert_eq!(allocator.prune().await.unwrap(), vec![slot.slot_id.clone()]);
        assert!(allocator.prune().await.unwrap().is_empty());
        assert_eq!(allocator.slots().await.unwrap()[0].status, SlotStatus::Free);
    }

    #[tokio::test]
    async fn renewal_extends_expiry_for_the_holder_only() {
        let (allocator, clock) = allocator(1);
        let slot = allocator.acquire("T-1").await.unwrap();
        clock.advance(Duration::from_secs(300));

        let renewed = allocator.renew(&slot.slot_id, "T-1").await.unwrap();
        assert!(renewed.lease_expires_at > slot.lease_expires_at);

        assert!(matches!(
            allocator.renew(&slot.slot_id, "T-2").await,
            Err(AllocError::NotOwner { .. })
        ));
        assert!(matches!(
            allocator.release("slot-9").await,
            Err(AllocError::UnknownSlot(_))
        ));
    }
}
