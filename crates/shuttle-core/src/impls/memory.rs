//! In-memory ストア
//!
//! ここの state store は真にアトミック。全操作を 1 つのロックの下で行うので
//! `Expectation` が厳密に守られる。決定的な状態機械テストの基準実装。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::ids::{InstanceId, TaskId};
use crate::domain::lease::{SharedLeaseState, StatusTag};
use crate::domain::{PresenceRecord, StoreError, WorkspaceSlot};
use crate::ports::{
    Expectation, PresenceStore, SlotStore, StateStore, StoreCapabilities, WriteOutcome,
};

#[derive(Default)]
struct InMemoryStateStoreState {
    records: BTreeMap<TaskId, SharedLeaseState>,
    tags: HashMap<TaskId, Vec<String>>,

    /// Remaining operations that will fail with `Unavailable`.
    injected_failures: u32,
    operations: u64,
}

impl InMemoryStateStoreState {
    fn begin(&mut self, op: &str) -> Result<(), StoreError> {
        self.operations += 1;
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(StoreError::Unavailable(format!("injected failure on {op}")));
        }
        Ok(())
    }
}

/// Atomic in-memory lease store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    state: Arc<Mutex<InMemoryStateStoreState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a retryable backend error.
    pub async fn inject_failures(&self, n: u32) {
        self.state.lock().await.injected_failures = n;
    }

    /// Number of operations attempted so far (failed ones included).
    pub async fn operation_count(&self) -> u64 {
        self.state.lock().await.operations
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            conditional_writes: true,
        }
    }

    async fn read(&self, task_id: &TaskId) -> Result<Option<SharedLeaseState>, StoreError> {
        let mut state = self.state.lock().await;
        state.begin("read")?;
        Ok(state.records.get(task_id).cloned())
    }

    async fn write(
        &self,
        record: &SharedLeaseState,
        expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.begin("write")?;

        let current = state.records.get(&record.task_id);
        if !expect.matches(current) {
            return Ok(WriteOutcome::Conflict {
                current: current.cloned(),
            });
        }
        state.records.insert(record.task_id.clone(), record.clone());
        Ok(WriteOutcome::Written)
    }

    async fn clear(
        &self,
        task_id: &TaskId,
        expect: Expectation,
    ) -> Result<WriteOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.begin("clear")?;

        let current = state.records.get(task_id);
        if !expect.matches(current) {
            return Ok(WriteOutcome::Conflict {
                current: current.cloned(),
            });
        }
        state.records.remove(task_id);
        Ok(WriteOutcome::Written)
    }

    async fn list(&self) -> Result<Vec<SharedLeaseState>, StoreError> {
        let mut state = self.state.lock().await;
        state.begin("list")?;
        Ok(state.records.values().cloned().collect())
    }

    async fn list_tags(&self, task_id: &TaskId) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.begin("list_tags")?;
        Ok(state.tags.get(task_id).cloned().unwrap_or_default())
    }

    async fn set_status_tag(
        &self,
        task_id: &TaskId,
        tag: Option<StatusTag>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.begin("set_status_tag")?;

        let tags = state.tags.entry(task_id.clone()).or_default();
        tags.retain(|label| !label.starts_with(StatusTag::PREFIX));
        if let Some(tag) = tag {
            tags.push(tag.label().to_string());
        }
        Ok(())
    }
}

/// In-memory presence registry.
#[derive(Clone, Default)]
pub struct InMemoryPresenceStore {
    records: Arc<Mutex<BTreeMap<InstanceId, PresenceRecord>>>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

/// In-memory slot registry.
#[derive(Clone, Default)]
pub struct InMemorySlotStore {
    slots: Arc<Mutex<Vec<WorkspaceSlot>>>,
}

impl InMemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for InMemorySlotStore {
    async fn load(&self) -> Result<Vec<WorkspaceSlot>, StoreError> {
        Ok(self.slots.lock().await.clone())
    }

    async fn save(&self, slots: &[WorkspaceSlot]) -> Result<(), StoreError> {
        *self.slots.lock().await = slots.to_vec();
        Ok(())
    }
}
