//! 定期処理: presence 更新、coordinator sweep、slot prune、lease heartbeat
//!
//! 各ループは独立しており、共有ストア経由でしかやり取りしない。
//! 共有の `watch` フラグが `true` になる（または sender が drop される）と止まる。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app::allocator::WorkspaceAllocator;
use crate::app::lease_manager::LeaseManager;
use crate::app::presence::PresenceRegistry;
use crate::app::sweeper::StaleSweeper;
use crate::app::worker::Assignment;
use crate::domain::{InstanceId, LeaseError};

/// Handle over the background loops of one node.
/// - `request_shutdown()` stops every loop at its next wake-up
/// - `shutdown_and_join()` also waits for them to finish
pub struct BackgroundLoops {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl BackgroundLoops {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            joins: Vec::new(),
        }
    }

    /// Receiver for anything else that should stop with these loops (workers).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn spawn_presence(&mut self, registry: Arc<PresenceRegistry>, interval: Duration) {
        let shutdown = self.subscribe();
        self.joins
            .push(tokio::spawn(presence_loop(registry, interval, shutdown)));
    }

    pub fn spawn_sweeper(
        &mut self,
        registry: Arc<PresenceRegistry>,
        sweeper: Arc<StaleSweeper>,
        interval: Duration,
    ) {
        let shutdown = self.subscribe();
        self.joins
            .push(tokio::spawn(sweep_loop(registry, sweeper, interval, shutdown)));
    }

    pub fn spawn_slot_prune(&mut self, allocator: Arc<WorkspaceAllocator>, interval: Duration) {
        let shutdown = self.subscribe();
        self.joins
            .push(tokio::spawn(prune_loop(allocator, interval, shutdown)));
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "background loop ended abnormally");
            }
        }
    }
}

impl Default for BackgroundLoops {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn ticker(interval: Duration, first_tick_now: bool) -> tokio::time::Interval {
    let start = if first_tick_now {
        Instant::now()
    } else {
        Instant::now() + interval
    };
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn presence_loop(
    registry: Arc<PresenceRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(interval, true);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                if let Err(err) = registry.heartbeat().await {
                    warn!(instance = %registry.instance_id(), error = %err, "presence refresh failed");
                }
            }
        }
    }
    debug!(instance = %registry.instance_id(), "presence loop stopped");
}

async fn sweep_loop(
    registry: Arc<PresenceRegistry>,
    sweeper: Arc<StaleSweeper>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(interval, false);
    let mut last_coordinator: Option<InstanceId> = None;
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                // recomputed every tick, never carried over
                let ctx = match registry.coordinator_context().await {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        warn!(error = %err, "presence snapshot failed, sweep skipped");
                        continue;
                    }
                };
                if ctx.coordinator() != last_coordinator.as_ref() {
                    info!(
                        instance = %ctx.instance_id(),
                        coordinator = ?ctx.coordinator().map(|id| id.as_str()),
                        is_self = ctx.is_coordinator(),
                        "coordinator changed"
                    );
                    last_coordinator = ctx.coordinator().cloned();
                }
                if let Err(err) = sweeper.sweep(&ctx).await {
                    warn!(error = %err, "sweep failed");
                }
            }
        }
    }
    debug!(instance = %registry.instance_id(), "sweep loop stopped");
}

async fn prune_loop(
    allocator: Arc<WorkspaceAllocator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = ticker(interval, false);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                if let Err(err) = allocator.prune().await {
                    warn!(error = %err, "slot prune failed");
                }
            }
        }
    }
}

/// Renew lease and slot every `interval` until the lease is lost.
///
/// Only returns on a logical failure (`LostLease`, or the task being
/// ignored); backend failures are logged and retried on the next tick, and if
/// they outlast the stale threshold the next successful renew reports the loss.
pub async fn heartbeat_assignment(
    leases: &LeaseManager,
    allocator: &WorkspaceAllocator,
    assignment: &Assignment,
    interval: Duration,
) -> LeaseError {
    let Assignment { lease, slot } = assignment;
    let mut ticker = ticker(interval, false);
    loop {
        ticker.tick().await;
        match leases
            .renew(&lease.task_id, &lease.owner_id, &lease.attempt_token)
            .await
        {
            Ok(_) => {}
            Err(err @ LeaseError::Backend { .. }) => {
                warn!(task = %lease.task_id, error = %err, "lease renewal failed, will retry");
            }
            Err(err) => return err,
        }
        if let Err(err) = allocator.renew(&slot.slot_id, lease.task_id.as_str()).await {
            warn!(slot = %slot.slot_id, error = %err, "slot renewal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::backoff::BackoffPolicy;
    use crate::app::lease_manager::LeaseSettings;
    use crate::domain::{LeaseStatus, OwnerId, RetryPolicy, Role, TaskId};
    use crate::impls::{InMemoryPresenceStore, InMemoryStateStore, MemoryEventSink};
    use crate::ports::{Clock, FixedClock, PresenceStore, StateStore, UlidGenerator};
    use chrono::{TimeZone, Utc};

    #[tokio::test(start_paused = true)]
    async fn presence_loop_refreshes_until_shutdown() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let store = Arc::new(InMemoryPresenceStore::new());
        let registry = Arc::new(PresenceRegistry::new(
            store.clone(),
            Arc::new(clock.clone()),
            InstanceId::new("w1"),
            Role::CoordinatorCandidate,
            Duration::from_secs(30),
            BackoffPolicy::default(),
        ));

        let mut loops = BackgroundLoops::new();
        loops.spawn_presence(registry, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = store.list().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].last_seen_at, clock.now());

        clock.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.list().await.unwrap()[0].last_seen_at, clock.now());

        loops.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_reclaims_abandoned_lease_on_coordinator() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let state = InMemoryStateStore::new();
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let leases = Arc::new(LeaseManager::new(
            Arc::new(state.clone()),
            Arc::new(clock.clone()),
            ids.clone(),
            Arc::new(MemoryEventSink::new()),
            LeaseSettings {
                stale_threshold: Duration::from_secs(60),
                retry: RetryPolicy::new(3),
                verify_delay: Duration::ZERO,
                backoff: BackoffPolicy::default(),
            },
        ));
        let registry = Arc::new(PresenceRegistry::new(
            Arc::new(InMemoryPresenceStore::new()),
            Arc::new(clock.clone()),
            InstanceId::new("w1"),
            Role::CoordinatorCandidate,
            Duration::from_secs(600),
            BackoffPolicy::default(),
        ));
        registry.heartbeat().await.unwrap();

        let task = TaskId::new("T-1");
        leases
            .claim(&task, &OwnerId::new(InstanceId::new("gone"), "agent"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(120));

        let mut loops = BackgroundLoops::new();
        loops.spawn_sweeper(
            registry,
            Arc::new(StaleSweeper::new(leases, ids)),
            Duration::from_secs(5),
        );
        tokio::time::sleep(Duration::from_secs(6)).await;
        loops.shutdown_and_join().await;

        let stored = state.read(&task).await.unwrap().unwrap();
        assert_eq!(stored.status, LeaseStatus::Stale);
        assert_eq!(stored.retry_count, 1);
    }
}
