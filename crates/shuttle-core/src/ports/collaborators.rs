//! Collaborator ports - タスクを差し出す backlog と、それを実行するエンジン
//!
//! どちらもこの crate の外にある。worker が知る必要があるのは、どのタスクが
//! 候補か、そして確保した workspace の中でどう実行するかだけ。

use async_trait::async_trait;

use crate::domain::ids::TaskId;
use crate::domain::{StoreError, WorkspaceSlot};

/// Source of claimable task ids, in preference order.
#[async_trait]
pub trait Backlog: Send + Sync {
    async fn candidates(&self) -> Result<Vec<TaskId>, StoreError>;
}

/// Runs one task to completion inside its workspace.
///
/// `Err` means the attempt failed and counts against the retry ceiling.
/// The future is dropped mid-flight when the lease is lost.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task_id: &TaskId, slot: &WorkspaceSlot) -> Result<(), String>;
}

/// Fixed list of task ids.
#[derive(Debug, Clone, Default)]
pub struct StaticBacklog {
    tasks: Vec<TaskId>,
}

impl StaticBacklog {
    pub fn new(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            tasks: tasks.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Backlog for StaticBacklog {
    async fn candidates(&self) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.tasks.clone())
    }
}
