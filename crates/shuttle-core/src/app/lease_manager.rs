//! LeaseManager - 任意の `StateStore` 上の claim / renew / release
//!
//! # フロー
//! - `claim`: read → 判定 (absent / stale / overdue / live) → write → verify → tag → event
//! - `renew`: read → token 照合 → heartbeat 書き込み → verify
//! - `release`: read → token 照合 → clear (completed) または stale 化 (failed / abandoned)
//!
//! verify の方法はバックエンド次第。条件付き書き込みがあれば、`Expectation` が
//! 成り立たない書き込みはストアが拒否する。なければ書き込み後に読み直し、
//! 他人の attempt token が見えたら競合に負けたとみなす。自分の読み直しを
//! 生き残った書き込みが勝ち。
//!
//! 同じタスクへの呼び出しはプロセス内ではタスクごとの mutex で直列化する。
//! プロセス間は直列化しない。そのための attempt token。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::app::backoff::BackoffPolicy;
use crate::app::status::LeaseCounts;
use crate::domain::{
    AttemptToken, DomainEvent, LeaseError, LeaseStatus, OwnerId, ReleaseEffect, ReleaseOutcome,
    RetryPolicy, SharedLeaseState, StatusTag, SweepId, TaskId,
};
use crate::ports::{Clock, EventSink, Expectation, IdGenerator, StateStore, WriteOutcome};

/// Timing and retry knobs for lease operations.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// A held lease whose heartbeat is at least this old is presumed abandoned.
    pub stale_threshold: Duration,

    pub retry: RetryPolicy,

    /// Pause between a claim write and its verifying re-read (non-CAS stores).
    pub verify_delay: Duration,

    pub backoff: BackoffPolicy,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            verify_delay: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A lease moved to stale because its owner stopped renewing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedLease {
    /// The record as written: stale, retry count already incremented.
    pub record: SharedLeaseState,
    pub prior_owner: OwnerId,
    pub age_secs: u64,
    /// Whether a later `claim` may pick the task up again.
    pub retry_eligible: bool,
}

/// Everything known about one task's lease, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseInspection {
    pub task_id: TaskId,
    pub record: Option<SharedLeaseState>,
    pub tags: Vec<String>,
    pub live: bool,
    pub heartbeat_age_secs: Option<u64>,
    pub retry_eligible: bool,
}

pub struct LeaseManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    settings: LeaseSettings,
    task_locks: StdMutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
        settings: LeaseSettings,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            events,
            settings,
            task_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Held, with a heartbeat at or past the stale threshold.
    pub fn is_overdue(&self, state: &SharedLeaseState) -> bool {
        state.is_overdue(self.now(), self.settings.stale_threshold)
    }

    /// Claim `task_id` for `owner_id` under a freshly minted attempt token.
    ///
    /// # Errors
    /// - `AlreadyClaimed`: a live lease exists, or another claimer won the write race
    /// - `RetryCeilingExceeded`: the task has failed too often to be picked up again
    /// - `Ignored`: an operator marked the task do-not-claim
    /// - `Backend`: the store kept failing
    pub async fn claim(
        &self,
        task_id: &TaskId,
        owner_id: &OwnerId,
    ) -> Result<SharedLeaseState, LeaseError> {
        let _guard = self.lock_task(task_id).await;
        let now = self.now();
        let mut current = self.read(task_id).await?;

        if let Some(state) = &current {
            if state.status == LeaseStatus::Ignored {
                return Err(LeaseError::Ignored {
                    task_id: task_id.clone(),
                });
            }
            if state.is_live(now, self.settings.stale_threshold) {
                debug!(task = %task_id, holder = %state.owner_id, "claim refused: lease is live");
                return Err(LeaseError::AlreadyClaimed {
                    task_id: task_id.clone(),
                    owner_id: state.owner_id.clone(),
                });
            }
        }

        // Held but overdue and not yet swept: take it over here.
        if let Some(observed) = current.clone().filter(|s| s.status.is_held()) {
            match self.mark_stale_locked(&observed, None).await? {
                Some(reclaimed) => current = Some(reclaimed.record),
                None => {
                    let latest = self.read(task_id).await?;
                    return Err(self.claim_conflict(task_id, latest));
                }
            }
        }

        let retry_count = match &current {
            Some(state) => {
                if !self.settings.retry.should_retry(state.retry_count) {
                    warn!(
                        task = %task_id,
                        retry_count = state.retry_count,
                        max_retries = self.settings.retry.max_retries,
                        "claim refused: retry ceiling reached"
                    );
                    return Err(LeaseError::RetryCeilingExceeded {
                        task_id: task_id.clone(),
                        retry_count: state.retry_count,
                        max_retries: self.settings.retry.max_retries,
                    });
                }
                state.retry_count
            }
            None => 0,
        };

        let token = self.ids.generate_attempt_token();
        let record =
            SharedLeaseState::claimed(task_id.clone(), owner_id.clone(), token, now, retry_count);

        let expect = Expectation::observed(current.as_ref());
        if let WriteOutcome::Conflict { current } = self.write(&record, expect).await? {
            return Err(self.claim_conflict(task_id, current));
        }

        let stored = self.read_back(&record, self.settings.verify_delay).await?;
        if stored.as_ref().map(|s| s.attempt_token) != Some(token) {
            warn!(task = %task_id, owner = %owner_id, "claim lost the write race on re-read");
            return Err(self.claim_conflict(task_id, stored));
        }

        self.mirror_tag(&record).await;
        self.events.emit(DomainEvent::Claimed {
            task_id: task_id.clone(),
            owner_id: owner_id.clone(),
            attempt_token: token,
            retry_count,
        });
        Ok(record)
    }

    /// Refresh the heartbeat of a lease this attempt still holds.
    ///
    /// The first renewal moves the status from `claimed` to `working`. Any
    /// mismatch (token, owner, or a status that is no longer held) is
    /// `LostLease`; the caller must stop working on the task.
    pub async fn renew(
        &self,
        task_id: &TaskId,
        owner_id: &OwnerId,
        token: &AttemptToken,
    ) -> Result<SharedLeaseState, LeaseError> {
        let _guard = self.lock_task(task_id).await;
        let current = self.read(task_id).await?;

        let Some(state) = current.filter(|s| s.is_held_by(owner_id, token)) else {
            return Err(self.lost(task_id, owner_id));
        };
        let first_renewal = state.status == LeaseStatus::Claimed;
        let renewed = state.renewed(self.now());

        if let WriteOutcome::Conflict { .. } =
            self.write(&renewed, Expectation::Token(*token)).await?
        {
            return Err(self.lost(task_id, owner_id));
        }
        let stored = self.read_back(&renewed, Duration::ZERO).await?;
        if !stored.is_some_and(|s| s.is_held_by(owner_id, token)) {
            return Err(self.lost(task_id, owner_id));
        }

        if first_renewal {
            self.mirror_tag(&renewed).await;
        }
        debug!(task = %task_id, owner = %owner_id, heartbeat_at = %renewed.heartbeat_at, "lease renewed");
        Ok(renewed)
    }

    /// End an attempt.
    ///
    /// A release from an attempt that no longer owns the record is a silent
    /// `NoOp`, so a straggler cannot undo a newer claim.
    pub async fn release(
        &self,
        task_id: &TaskId,
        owner_id: &OwnerId,
        token: &AttemptToken,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseEffect, LeaseError> {
        let _guard = self.lock_task(task_id).await;
        let current = self.read(task_id).await?;

        let Some(state) =
            current.filter(|s| &s.attempt_token == token && &s.owner_id == owner_id)
        else {
            debug!(task = %task_id, owner = %owner_id, "release ignored: attempt no longer owns the lease");
            return Ok(ReleaseEffect::NoOp);
        };

        let effect = match (outcome, state.status) {
            (_, LeaseStatus::Ignored) => ReleaseEffect::NoOp,
            (ReleaseOutcome::Completed, _) => {
                match self.clear(task_id, Expectation::Token(*token)).await? {
                    WriteOutcome::Written => {
                        self.set_tag(task_id, None).await;
                        ReleaseEffect::Cleared
                    }
                    WriteOutcome::Conflict { .. } => ReleaseEffect::NoOp,
                }
            }
            // A sweep already marked this attempt stale and counted it.
            (_, LeaseStatus::Stale) => ReleaseEffect::NoOp,
            (_, LeaseStatus::Claimed | LeaseStatus::Working) => {
                let stale = state.abandoned();
                match self.write(&stale, Expectation::Token(*token)).await? {
                    WriteOutcome::Written => {
                        self.mirror_tag(&stale).await;
                        self.flag_if_exhausted(&stale);
                        ReleaseEffect::MarkedStale {
                            retry_count: stale.retry_count,
                        }
                    }
                    WriteOutcome::Conflict { .. } => ReleaseEffect::NoOp,
                }
            }
        };

        if effect != ReleaseEffect::NoOp {
            self.events.emit(DomainEvent::Released {
                task_id: task_id.clone(),
                owner_id: owner_id.clone(),
                outcome,
            });
        }
        Ok(effect)
    }

    pub async fn inspect(&self, task_id: &TaskId) -> Result<LeaseInspection, LeaseError> {
        let record = self.read(task_id).await?;
        let tags = self
            .settings
            .backoff
            .retry("list_tags", || self.store.list_tags(task_id))
            .await?;
        let now = self.now();

        Ok(LeaseInspection {
            task_id: task_id.clone(),
            live: record
                .as_ref()
                .is_some_and(|s| s.is_live(now, self.settings.stale_threshold)),
            heartbeat_age_secs: record.as_ref().map(|s| s.heartbeat_age(now).as_secs()),
            retry_eligible: record.as_ref().is_none_or(|s| {
                s.status != LeaseStatus::Ignored && self.settings.retry.should_retry(s.retry_count)
            }),
            record,
            tags,
        })
    }

    pub async fn list_leases(&self) -> Result<Vec<SharedLeaseState>, LeaseError> {
        Ok(self
            .settings
            .backoff
            .retry("list", || self.store.list())
            .await?)
    }

    pub async fn counts(&self) -> Result<LeaseCounts, LeaseError> {
        let records = self.list_leases().await?;
        Ok(LeaseCounts::from_records(
            &records,
            self.now(),
            self.settings.stale_threshold,
            self.settings.retry.max_retries,
        ))
    }

    /// Operator path: never auto-claim this task again.
    ///
    /// A live owner loses its lease on its next renewal. A task with no
    /// record gets one, attributed to `by`.
    pub async fn mark_ignored(
        &self,
        task_id: &TaskId,
        by: &OwnerId,
        reason: &str,
    ) -> Result<SharedLeaseState, LeaseError> {
        let _guard = self.lock_task(task_id).await;
        let current = self.read(task_id).await?;

        if let Some(state) = current.as_ref().filter(|s| s.status == LeaseStatus::Ignored) {
            return Ok(state.clone());
        }

        let mut record = match &current {
            Some(state) => state.clone(),
            None => SharedLeaseState::claimed(
                task_id.clone(),
                by.clone(),
                self.ids.generate_attempt_token(),
                self.now(),
                0,
            ),
        };
        record.status = LeaseStatus::Ignored;

        if let WriteOutcome::Conflict { current } = self
            .write(&record, Expectation::observed(current.as_ref()))
            .await?
        {
            return Err(self.claim_conflict(task_id, current));
        }

        self.mirror_tag(&record).await;
        self.events.emit(DomainEvent::Ignored {
            task_id: task_id.clone(),
            reason: reason.to_string(),
        });
        Ok(record)
    }

    /// Operator override: zero the retry count and make the task claimable.
    ///
    /// Clears an ignore marker too. Refused while a live owner holds the lease.
    pub async fn reset(&self, task_id: &TaskId) -> Result<Option<SharedLeaseState>, LeaseError> {
        let _guard = self.lock_task(task_id).await;
        let Some(current) = self.read(task_id).await? else {
            return Ok(None);
        };
        if current.is_live(self.now(), self.settings.stale_threshold) {
            return Err(LeaseError::AlreadyClaimed {
                task_id: task_id.clone(),
                owner_id: current.owner_id,
            });
        }

        let mut record = current.clone();
        record.status = LeaseStatus::Stale;
        record.retry_count = 0;

        if let WriteOutcome::Conflict { current } = self
            .write(&record, Expectation::Token(current.attempt_token))
            .await?
        {
            return Err(self.claim_conflict(task_id, current));
        }

        self.mirror_tag(&record).await;
        self.events.emit(DomainEvent::Reset {
            task_id: task_id.clone(),
        });
        Ok(Some(record))
    }

    /// Sweep path: move an overdue lease to stale.
    ///
    /// `observed` is the record as the sweeper listed it. Nothing is written
    /// unless the stored record still carries the same attempt token and is
    /// still overdue, which makes a repeated sweep a no-op.
    pub(crate) async fn mark_stale(
        &self,
        observed: &SharedLeaseState,
        sweep_id: Option<SweepId>,
    ) -> Result<Option<ReclaimedLease>, LeaseError> {
        let _guard = self.lock_task(&observed.task_id).await;
        self.mark_stale_locked(observed, sweep_id).await
    }

    async fn mark_stale_locked(
        &self,
        observed: &SharedLeaseState,
        sweep_id: Option<SweepId>,
    ) -> Result<Option<ReclaimedLease>, LeaseError> {
        let task_id = &observed.task_id;
        let now = self.now();
        let current = self.read(task_id).await?;

        let Some(state) = current.filter(|s| {
            s.attempt_token == observed.attempt_token
                && s.is_overdue(now, self.settings.stale_threshold)
        }) else {
            debug!(task = %task_id, "stale mark skipped: lease changed since it was observed");
            return Ok(None);
        };

        let age = state.heartbeat_age(now);
        let prior_owner = state.owner_id.clone();
        let stale = state.abandoned();

        if let WriteOutcome::Conflict { .. } = self
            .write(&stale, Expectation::Token(stale.attempt_token))
            .await?
        {
            return Ok(None);
        }
        let stored = self.read_back(&stale, Duration::ZERO).await?;
        if stored.as_ref() != Some(&stale) {
            debug!(task = %task_id, "stale mark lost to a concurrent renewal");
            return Ok(None);
        }

        self.mirror_tag(&stale).await;
        self.events.emit(DomainEvent::Reclaimed {
            task_id: task_id.clone(),
            prior_owner: prior_owner.clone(),
            age_secs: age.as_secs(),
            retry_count: stale.retry_count,
            sweep_id,
        });
        self.flag_if_exhausted(&stale);

        Ok(Some(ReclaimedLease {
            retry_eligible: self.settings.retry.should_retry(stale.retry_count),
            record: stale,
            prior_owner,
            age_secs: age.as_secs(),
        }))
    }

    async fn lock_task(&self, task_id: &TaskId) -> TaskGuard<'_> {
        let lock = {
            let mut locks = self
                .task_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(task_id.clone()).or_default())
        };
        TaskGuard {
            locks: &self.task_locks,
            task_id: task_id.clone(),
            held: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.task_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    async fn read(&self, task_id: &TaskId) -> Result<Option<SharedLeaseState>, LeaseError> {
        Ok(self
            .settings
            .backoff
            .retry("read", || self.store.read(task_id))
            .await?)
    }

    async fn write(
        &self,
        state: &SharedLeaseState,
        expect: Expectation,
    ) -> Result<WriteOutcome, LeaseError> {
        let outcome = self
            .settings
            .backoff
            .retry("write", || self.store.write(state, expect))
            .await?;

        // A retried write whose earlier try landed conflicts with itself.
        Ok(match outcome {
            WriteOutcome::Conflict {
                current: Some(current),
            } if current == *state => WriteOutcome::Written,
            other => other,
        })
    }

    async fn clear(
        &self,
        task_id: &TaskId,
        expect: Expectation,
    ) -> Result<WriteOutcome, LeaseError> {
        let outcome = self
            .settings
            .backoff
            .retry("clear", || self.store.clear(task_id, expect))
            .await?;

        Ok(match outcome {
            WriteOutcome::Conflict { current: None } => WriteOutcome::Written,
            other => other,
        })
    }

    /// What the store holds after writing `written`.
    ///
    /// Conditional stores already rejected a lost race, so no read is needed.
    async fn read_back(
        &self,
        written: &SharedLeaseState,
        settle: Duration,
    ) -> Result<Option<SharedLeaseState>, LeaseError> {
        if self.store.capabilities().conditional_writes {
            return Ok(Some(written.clone()));
        }
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        self.read(&written.task_id).await
    }

    async fn mirror_tag(&self, state: &SharedLeaseState) {
        let tag = StatusTag::for_state(state, self.settings.retry.max_retries);
        self.set_tag(&state.task_id, Some(tag)).await;
    }

    /// Tags only mirror the record, so a failed update is logged, not returned.
    async fn set_tag(&self, task_id: &TaskId, tag: Option<StatusTag>) {
        let result = self
            .settings
            .backoff
            .retry("set_status_tag", || self.store.set_status_tag(task_id, tag))
            .await;
        if let Err(err) = result {
            warn!(task = %task_id, tag = ?tag.map(StatusTag::label), error = %err, "status tag update failed");
        }
    }

    fn flag_if_exhausted(&self, state: &SharedLeaseState) {
        if !self.settings.retry.should_retry(state.retry_count) {
            self.events.emit(DomainEvent::NeedsAttention {
                task_id: state.task_id.clone(),
                retry_count: state.retry_count,
                max_retries: self.settings.retry.max_retries,
            });
        }
    }

    fn lost(&self, task_id: &TaskId, owner_id: &OwnerId) -> LeaseError {
        self.events.emit(DomainEvent::LostLease {
            task_id: task_id.clone(),
            owner_id: owner_id.clone(),
        });
        LeaseError::LostLease {
            task_id: task_id.clone(),
        }
    }

    fn claim_conflict(&self, task_id: &TaskId, current: Option<SharedLeaseState>) -> LeaseError {
        match current {
            Some(state) => LeaseError::AlreadyClaimed {
                task_id: task_id.clone(),
                owner_id: state.owner_id,
            },
            None => LeaseError::LostLease {
                task_id: task_id.clone(),
            },
        }
    }
}

/// タスク 1 つ分の mutex を保持する。最後の利用者がいなくなると map から消える。
struct TaskGuard<'a> {
    locks: &'a StdMutex<HashMap<TaskId, Arc<Mutex<()>>>>,
    task_id: TaskId,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // 待機中の呼び出しも Arc を持つので、count が 1 なら他に誰もいない
        if locks
            .get(&self.task_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.task_id);
        }
    }
}
