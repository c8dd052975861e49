//! Latency-simulating store wrapper.
//!
//! Wraps any `StateStore` and delays operations the way a remote tracker API
//! does. Writes are delayed *before* they are applied, so two writes issued
//! close together can land in either order. Expectations are dropped on the
//! way through: the wrapper behaves like a backend without conditional writes
//! even when the inner store has them.

use std::collections::VecDeque;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;

use crate::domain::ids::TaskId;
use crate::domain::lease::{SharedLeaseState, StatusTag};
use crate::domain::StoreError;
use crate::ports::{Expectation, StateStore, StoreCapabilities, WriteOutcome};

pub struct SimulatedLatencyStore<S> {
    inner: S,
    read_delay: Duration,
    /// Scripted per-write delays, consumed in call order.
    scripted: Mutex<VecDeque<Duration>>,
    /// Fallback jitter window once the script runs out.
    jitter: Range<Duration>,
}

impl<S: StateStore> SimulatedLatencyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_delay: Duration::ZERO,
            scripted: Mutex::new(VecDeque::new()),
            jitter: Duration::ZERO..Duration::ZERO,
        }
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Delays for the next writes, in the order the writes are issued.
    pub fn with_write_delays(self, delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            scripted: Mutex::new(delays.into_iter().collect()),
            ..self
        }
    }

    /// Random write delay in `range` for unscripted writes.
    pub fn with_write_jitter(mut self, range: Range<Duration>) -> Self {
        self.jitter = range;
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn next_write_delay(&self) -> Duration {
        if let Some(delay) = self.scripted.lock().await.pop_front() {
            return delay;
        }
        if self.jitter.is_empty() {
            self.jitter.start
        } else {
            rand::thread_rng().gen_range(self.jitter.clone())
        }
    }

    async fn pause_for_write(&self) {
        let delay = self.next_write_delay().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn pause_for_read(&self) {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
    }
}

#[async_trait]
impl<S: StateStore> StateStore for SimulatedLatencyStore<S> {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            conditional_writes: false,
        }
    }

    async fn read(&self, task_id: &TaskId) -> Result<Option<SharedLeaseState>, StoreError> {
        self.pause_for_read().await;
        self.inner.read(task_id).await
    }

    async fn write(
        &self,
        state: &SharedLeaseState,
        _expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        self.pause_for_write().await;
        self.inner.write(state, Expectation::Any).await
    }

    async fn clear(
        &self,
        task_id: &TaskId,
        _expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        self.pause_for_write().await;
        self.inner.clear(task_id, Expectation::Any).await
    }

    async fn list(&self) -> Result<Vec<SharedLeaseState>, StoreError> {
        self.pause_for_read().await;
        self.inner.list().await
    }

    async fn list_tags(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        self.pause_for_read().await;
        self.inner.list_tags(task_id).await
    }

    async fn set_status_tag(
        &self,
        task_id: &TaskId,
        tag: Option<StatusTag>,
    ) -> Result<(), StoreError> {
        self.pause_for_write().await;
        self.inner.set_status_tag(task_id, tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::{AttemptToken, InstanceId, OwnerId};
    use crate::impls::InMemoryStateStore;
    use chrono::Utc;
    use ulid::Ulid;

    fn record(agent: &str) -> SharedLeaseState {
        SharedLeaseState::claimed(
            TaskId::new("T-1"),
            OwnerId::new(InstanceId::new("w1"), agent),
            AttemptToken::from_ulid(Ulid::new()),
            Utc::now(),
            0,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_delays_reorder_concurrent_writes() {
        let store = SimulatedLatencyStore::new(InMemoryStateStore::new()).with_write_delays([
            Duration::from_millis(300),
            Duration::from_millis(100),
        ]);
        let first = record("first");
        let second = record("second");

        let (a, b) = tokio::join!(
            store.write(&first, Expectation::Absent),
            store.write(&second, Expectation::Absent),
        );
        a.unwrap();
        b.unwrap();

        // issued first, landed last
        assert_eq!(store.read(&first.task_id).await.unwrap(), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn expectations_are_not_enforced_through_the_wrapper() {
        let store = SimulatedLatencyStore::new(InMemoryStateStore::new());
        store.write(&record("a"), Expectation::Absent).await.unwrap();

        let outcome = store.write(&record("b"), Expectation::Absent).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }
}
