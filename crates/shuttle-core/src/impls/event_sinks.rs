//! EventSink implementations.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::domain::DomainEvent;
use crate::ports::EventSink;

/// Logs every event as one structured line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        match &event {
            DomainEvent::Claimed {
                task_id,
                owner_id,
                attempt_token,
                retry_count,
            } => info!(
                task = %task_id,
                owner = %owner_id,
                token = %attempt_token,
                retry_count,
                "lease claimed"
            ),
            DomainEvent::Released {
                task_id,
                owner_id,
                outcome,
            } => info!(task = %task_id, owner = %owner_id, ?outcome, "lease released"),
            DomainEvent::Reclaimed {
                task_id,
                prior_owner,
                age_secs,
                retry_count,
                sweep_id,
            } => warn!(
                task = %task_id,
                prior_owner = %prior_owner,
                age_secs,
                retry_count,
                sweep = ?sweep_id,
                "stale lease reclaimed"
            ),
            DomainEvent::LostLease { task_id, owner_id } => {
                warn!(task = %task_id, owner = %owner_id, "lease lost to another attempt")
            }
            DomainEvent::NeedsAttention {
                task_id,
                retry_count,
                max_retries,
            } => warn!(
                task = %task_id,
                retry_count,
                max_retries,
                "task needs attention: retry ceiling reached"
            ),
            DomainEvent::Ignored { task_id, reason } => {
                info!(task = %task_id, reason = %reason, "task marked ignored")
            }
            DomainEvent::Reset { task_id } => info!(task = %task_id, "task retries reset"),
        }
    }
}

/// Keeps events in memory so tests can assert on them.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Events with the given `DomainEvent::name`.
    pub fn named(&self, name: &str) -> Vec<DomainEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.name() == name)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Sends each event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: DomainEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
