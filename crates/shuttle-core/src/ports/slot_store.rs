//! SlotStore port - host-local persistence of the workspace slot registry.

use async_trait::async_trait;

use crate::domain::{StoreError, WorkspaceSlot};

/// Whole-registry load/save. Slots are a single-host resource, so there is no
/// cross-process concurrency to guard against here.
#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn load(&self) -> Result<Vec<WorkspaceSlot>, StoreError>;

    async fn save(&self, slots: &[WorkspaceSlot]) -> Result<(), StoreError>;
}
