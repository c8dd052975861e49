//! EventSink port - where "reclaimed" / "needs attention" notices go.
//!
//! # Implementations
//! - `TracingEventSink`: one structured log line per event (default)
//! - `MemoryEventSink`: collects events for assertions

use crate::domain::DomainEvent;

/// Receives domain events.
///
/// Emission is fire-and-forget: a sink that cannot deliver must not fail the
/// lease operation that produced the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}
