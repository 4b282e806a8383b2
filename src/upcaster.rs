//! Schema upcasting: migrating recorded events to their current shape.
//!
//! An [`Upcaster`] is a pure per-event transform applied between the store
//! and user `handle` callbacks. [`upcast_stream`] wraps a delivered batch in
//! a lazy, order-preserving iterator that also merges additional metadata
//! (the handler runtime contributes the application name) into each event.

use serde_json::{Map, Value};

use crate::event::RecordedEvent;

/// Error produced when an event cannot be migrated to its current schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("upcast failed for event {event_number}: {message}")]
pub struct UpcastError {
    /// Number of the event that failed to migrate.
    pub event_number: u64,
    /// What went wrong.
    pub message: String,
}

impl UpcastError {
    /// Build an error for `event` with the given message.
    pub fn new(event: &RecordedEvent, message: impl Into<String>) -> Self {
        Self {
            event_number: event.event_number,
            message: message.into(),
        }
    }
}

/// Pure transform from a recorded event to its latest schema.
///
/// Implementations must preserve the event's identity (`event_number`,
/// `event_id`, stream coordinates); only the payload and metadata may
/// change.
pub trait Upcaster: Send + Sync {
    /// Migrate one event. Returning `Err` surfaces as a `handle` failure
    /// for that event, routed through the owning handler's error policy.
    fn upcast(&self, event: &RecordedEvent) -> Result<RecordedEvent, UpcastError>;
}

/// Identity upcaster: every event is already in its current schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUpcaster;

impl Upcaster for NoopUpcaster {
    fn upcast(&self, event: &RecordedEvent) -> Result<RecordedEvent, UpcastError> {
        Ok(event.clone())
    }
}

/// An upcast that failed, carrying the original event (with merged
/// metadata) so the caller can still route it through an error policy.
#[derive(Debug, Clone)]
pub struct UpcastFailure {
    /// The event as delivered, with `extra_metadata` already merged.
    pub event: RecordedEvent,
    /// The upcast error.
    pub error: UpcastError,
}

/// Lazily upcast a batch, merging `extra_metadata` into each event first.
///
/// Order and arity are preserved: the iterator yields exactly one item per
/// input event, in input order. A failing upcast yields `Err` for that
/// event and does not consume the rest of the batch.
pub fn upcast_stream<'a>(
    upcaster: &'a dyn Upcaster,
    events: Vec<RecordedEvent>,
    extra_metadata: Map<String, Value>,
) -> impl Iterator<Item = Result<RecordedEvent, UpcastFailure>> + 'a {
    events.into_iter().map(move |mut event| {
        for (key, value) in &extra_metadata {
            event.metadata.insert(key.clone(), value.clone());
        }
        match upcaster.upcast(&event) {
            Ok(upcast) => Ok(upcast),
            Err(error) => Err(UpcastFailure { event, error }),
        }
    })
}
