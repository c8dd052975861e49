//! Domain model: ids, lease/presence/slot records, events, errors.

pub mod errors;
pub mod events;
pub mod ids;
pub mod lease;
pub mod outcome;
pub mod presence;
pub mod retry;
pub mod slot;

pub use self::errors::{AllocError, ErrorKind, LeaseError, StoreError};
pub use self::events::DomainEvent;
pub use self::ids::{AttemptToken, Id, IdMarker, InstanceId, OwnerId, SweepId, TaskId};
pub use self::lease::{LeaseStatus, SharedLeaseState, StatusTag};
pub use self::outcome::{ReleaseEffect, ReleaseOutcome};
pub use self::presence::{PresenceRecord, Role};
pub use self::retry::{RetryPolicy, should_retry};
pub use self::slot::{SlotStatus, WorkspaceSlot};
