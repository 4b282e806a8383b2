//! Recorded events and the enriched metadata handed to handler callbacks.
//!
//! This module provides the foundational data types that the store,
//! subscription, and handler modules all depend on. No I/O occurs here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An immutable event as recorded by the event store.
///
/// `event_number` is assigned by the store and is strictly monotonic across
/// the global log; gaps are possible, reordering is not. All other fields
/// are carried verbatim from the append that produced the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Globally ordered event number assigned by the store.
    pub event_number: u64,
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Identifier of the stream the event was appended to.
    pub stream_id: String,
    /// One-based version of the event within its stream.
    pub stream_version: u64,
    /// Event type tag (e.g. "BankAccountOpened").
    pub event_type: String,
    /// JSON payload (the domain event data).
    pub payload: Value,
    /// Opaque metadata map recorded alongside the event.
    pub metadata: Map<String, Value>,
    /// Correlation ID linking the event to the request that caused it.
    pub correlation_id: Option<String>,
    /// Causation ID linking the event to the command or event that caused it.
    pub causation_id: Option<String>,
    /// Store-assigned timestamp (Unix epoch milliseconds).
    pub created_at: u64,
}

/// An event proposed for appending, before the store assigns identity.
///
/// The store fills in `event_number`, `stream_version`, `event_id`, and
/// `created_at` when the append is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Event type tag.
    pub event_type: String,
    /// JSON payload (the domain event data).
    pub payload: Value,
    /// Opaque metadata to record alongside the event.
    pub metadata: Map<String, Value>,
    /// Correlation ID, if the caller is tracking one.
    pub correlation_id: Option<String>,
    /// Causation ID, if the caller is tracking one.
    pub causation_id: Option<String>,
}

impl ProposedEvent {
    /// Create a proposed event with the given type tag and payload.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: Map::new(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Attach a metadata map.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// Enriched, typed metadata passed to user `handle` callbacks.
///
/// Carries everything the store recorded for the event plus the identity of
/// the application and handler delivering it. Built by
/// [`EventMetadata::enrich`] immediately before delegation, so user code
/// never has to dig identity fields out of the raw metadata map.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMetadata {
    /// Name of the application the handler is bound to.
    pub application: String,
    /// Name of the handler the event is being delivered to.
    pub handler_name: String,
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Globally ordered event number.
    pub event_number: u64,
    /// Identifier of the source stream.
    pub stream_id: String,
    /// One-based version of the event within its stream.
    pub stream_version: u64,
    /// Correlation ID, if recorded.
    pub correlation_id: Option<String>,
    /// Causation ID, if recorded.
    pub causation_id: Option<String>,
    /// Store-assigned timestamp (Unix epoch milliseconds).
    pub created_at: u64,
    /// The raw metadata map as recorded by the store (including any keys
    /// merged in by the upcasting stage).
    pub recorded: Map<String, Value>,
}

impl EventMetadata {
    /// Build enriched metadata for delivering `event` to a handler.
    pub fn enrich(event: &RecordedEvent, application: &str, handler_name: &str) -> Self {
        Self {
            application: application.to_string(),
            handler_name: handler_name.to_string(),
            event_id: event.event_id,
            event_number: event.event_number,
            stream_id: event.stream_id.clone(),
            stream_version: event.stream_version,
            correlation_id: event.correlation_id.clone(),
            causation_id: event.causation_id.clone(),
            created_at: event.created_at,
            recorded: event.metadata.clone(),
        }
    }
}
