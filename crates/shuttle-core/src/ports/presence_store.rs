//! PresenceStore port - shared registry of instance heartbeats.

use async_trait::async_trait;

use crate::domain::{PresenceRecord, StoreError};

/// Registry of presence records, one per instance.
///
/// Eventually consistent is fine: election tolerates brief disagreement.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or replace this instance's record.
    async fn upsert(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    /// Every record, expired ones included; callers filter by TTL.
    async fn list(&self) -> Result<Vec<PresenceRecord>, StoreError>;
}
