//! Worker - the top-level claim / execute / release cycle.
//!
//! One pass: ask the backlog for candidates, take a workspace slot, claim the
//! task, run it while heartbeats keep lease and slot alive, then release
//! with the matching outcome. A task that cannot be claimed is skipped in
//! favour of the next candidate; a full pool or an empty backlog idles
//! until the next poll.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::allocator::WorkspaceAllocator;
use crate::app::lease_manager::LeaseManager;
use crate::app::loops::{heartbeat_assignment, wait_for_shutdown};
use crate::domain::{
    AllocError, ErrorKind, LeaseError, OwnerId, ReleaseEffect, ReleaseOutcome, SharedLeaseState,
    StoreError, TaskId, WorkspaceSlot,
};
use crate::ports::{Backlog, TaskExecutor};

/// A claimed task together with the slot it runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub lease: SharedLeaseState,
    pub slot: WorkspaceSlot,
}

/// How an assignment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOutcome {
    Released {
        outcome: ReleaseOutcome,
        effect: ReleaseEffect,
    },

    /// Another attempt took the task over; the work was dropped unreleased.
    LostLease,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("backlog unavailable: {0}")]
    Backlog(#[source] StoreError),
}

/// Tally of a `Worker::run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub lost: usize,
}

pub struct Worker {
    leases: Arc<LeaseManager>,
    allocator: Arc<WorkspaceAllocator>,
    owner: OwnerId,
    renew_interval: Duration,
    idle_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        leases: Arc<LeaseManager>,
        allocator: Arc<WorkspaceAllocator>,
        owner: OwnerId,
        renew_interval: Duration,
        idle_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            leases,
            allocator,
            owner,
            renew_interval,
            idle_interval,
            shutdown,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Claim the first candidate that can be claimed.
    ///
    /// The slot is taken first because it is local and cheap to give back;
    /// the claim is the step other workers can observe. `PoolExhausted` ends
    /// the pass at once since no later candidate could get a slot either.
    pub async fn claim_next(&self, candidates: &[TaskId]) -> Result<Option<Assignment>, WorkerError> {
        for task_id in candidates {
            let slot = self.allocator.acquire(task_id.as_str()).await?;

            match self.leases.claim(task_id, &self.owner).await {
                Ok(lease) => {
                    info!(task = %task_id, owner = %self.owner, slot = %slot.slot_id, "task assigned");
                    return Ok(Some(Assignment { lease, slot }));
                }
                Err(err) => {
                    self.allocator.release(&slot.slot_id).await?;
                    if err.kind() == ErrorKind::Permanent {
                        debug!(task = %task_id, reason = %err, "candidate skipped");
                    } else {
                        warn!(task = %task_id, error = %err, "candidate skipped after backend failure");
                    }
                }
            }
        }
        Ok(None)
    }

    /// Drive `work` to the end while heartbeating, then release.
    ///
    /// - work `Ok` → `Completed`, work `Err` → `Failed`
    /// - shutdown requested → work dropped, `Abandoned`
    /// - lease lost → work dropped at once, nothing released but the slot
    pub async fn run_assignment<F>(
        &self,
        assignment: &Assignment,
        work: F,
    ) -> Result<AssignmentOutcome, WorkerError>
    where
        F: Future<Output = Result<(), String>>,
    {
        let Assignment { lease, slot } = assignment;
        let mut shutdown = self.shutdown.clone();
        let heartbeat =
            heartbeat_assignment(&self.leases, &self.allocator, assignment, self.renew_interval);
        tokio::pin!(work);
        tokio::pin!(heartbeat);

        let outcome = tokio::select! {
            result = &mut work => match result {
                Ok(()) => ReleaseOutcome::Completed,
                Err(reason) => {
                    warn!(task = %lease.task_id, reason = %reason, "task attempt failed");
                    ReleaseOutcome::Failed
                }
            },
            err = &mut heartbeat => {
                warn!(task = %lease.task_id, owner = %lease.owner_id, error = %err, "lease lost, work dropped");
                self.release_slot(slot).await;
                return Ok(AssignmentOutcome::LostLease);
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(task = %lease.task_id, "shutdown requested, abandoning task");
                ReleaseOutcome::Abandoned
            }
        };

        let released = self
            .leases
            .release(&lease.task_id, &lease.owner_id, &lease.attempt_token, outcome)
            .await;
        self.release_slot(slot).await;

        let effect = released?;
        Ok(AssignmentOutcome::Released { outcome, effect })
    }

    /// Loop until shutdown: poll backlog, claim, execute, release.
    pub async fn run(&self, backlog: &dyn Backlog, executor: &dyn TaskExecutor) -> WorkerSummary {
        let mut summary = WorkerSummary::default();
        let mut shutdown = self.shutdown.clone();

        while !*shutdown.borrow() {
            match self.poll_once(backlog).await {
                Ok(Some(assignment)) => {
                    let work = executor.execute(&assignment.lease.task_id, &assignment.slot);
                    match self.run_assignment(&assignment, work).await {
                        Ok(AssignmentOutcome::Released { outcome, .. }) => match outcome {
                            ReleaseOutcome::Completed => summary.completed += 1,
                            ReleaseOutcome::Failed => summary.failed += 1,
                            ReleaseOutcome::Abandoned => summary.abandoned += 1,
                        },
                        Ok(AssignmentOutcome::LostLease) => summary.lost += 1,
                        Err(err) => {
                            warn!(task = %assignment.lease.task_id, error = %err, "release failed");
                        }
                    }
                    continue;
                }
                Ok(None) => {}
                Err(WorkerError::Alloc(AllocError::PoolExhausted { pool_size })) => {
                    debug!(pool_size, "workspace pool exhausted, waiting");
                }
                Err(err) => warn!(error = %err, "claim pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.idle_interval) => {}
                _ = wait_for_shutdown(&mut shutdown) => {}
            }
        }

        info!(owner = %self.owner, ?summary, "worker stopped");
        summary
    }

    async fn poll_once(&self, backlog: &dyn Backlog) -> Result<Option<Assignment>, WorkerError> {
        let candidates = backlog.candidates().await.map_err(WorkerError::Backlog)?;
        self.claim_next(&candidates).await
    }

    async fn release_slot(&self, slot: &WorkspaceSlot) {
        if let Err(err) = self.allocator.release(&slot.slot_id).await {
            warn!(slot = %slot.slot_id, error = %err, "slot release failed; it will expire");
        }
    }
}
