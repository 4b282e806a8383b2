//! Durable event handler runtime for event-sourced CQRS applications.
//!
//! `floodgate` runs the subscriber side of an event-sourced system: each
//! [`EventHandler`] gets a long-lived agent that holds a named durable
//! subscription on the event store, receives recorded events in global
//! order, upcasts them, and delegates to user callbacks with a
//! retry/skip/stop error policy. Acked offsets feed a process-wide
//! [`ConsistencyRegistry`] so command dispatch can block until designated
//! strongly-consistent handlers have caught up with the events a command
//! produced.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`EventHandler`] | User callbacks: `handle`, `on_error`, `init`, `before_reset` |
//! | [`spawn_handler`] | Starts the agent driving one handler |
//! | [`HandlerHandle`] | Control surface: reset, stop, state queries |
//! | [`Application`] | Binding between a store, its handlers, and dispatch |
//! | [`EventStore`] | Store contract: durable subscriptions, acks, appends |
//! | [`InMemoryEventStore`] | Reference store for tests and development |
//! | [`ConsistencyRegistry`] | Offset index behind the strong-consistency barrier |
//! | [`dispatch`] | Command execution with the consistency wait call-site |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use floodgate::{
//!     Application, EventHandler, EventMetadata, HandlerError, HandlerName, HandlerOptions,
//!     InMemoryEventStore, spawn_handler,
//! };
//! use serde_json::Value;
//!
//! // 1. Define a handler.
//! struct AuditTrail;
//!
//! #[async_trait]
//! impl EventHandler for AuditTrail {
//!     async fn handle(
//!         &self,
//!         payload: &Value,
//!         metadata: &EventMetadata,
//!     ) -> Result<(), HandlerError> {
//!         println!("event {} on {}: {payload}", metadata.event_number, metadata.stream_id);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // 2. Bind an application to a store and start the handler.
//! let app = Application::builder("bank")
//!     .store(Arc::new(InMemoryEventStore::new()))
//!     .build()?;
//! let handle = spawn_handler(
//!     &app,
//!     AuditTrail,
//!     HandlerOptions::default().named(HandlerName::new("audit-trail")?),
//! )?;
//!
//! // 3. Events appended to the store now flow through `handle`, strictly
//! // in order, with acks advancing the store-owned cursor.
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod application;
mod config;
mod consistency;
mod dispatch;
mod error;
mod event;
mod handler;
mod store;
mod subscription;
mod upcaster;

pub use aggregate::{Aggregate, decode_domain_event, encode_domain_event, fold, stream_id};
pub use application::{Application, ApplicationBuilder};
pub use config::{ConfigError, Consistency, HandlerName, HandlerOptions, ResolvedConfig};
pub use consistency::{ConsistencyRegistry, ConsistencyTimeout, RegistrationGuard, RegistryError};
pub use dispatch::{
    DispatchError, DispatchOptions, Dispatched, ExecutionResult, Returning, dispatch,
};
pub use error::{ExitReason, HandlerGone, StartError};
pub use event::{EventMetadata, ProposedEvent, RecordedEvent};
pub use handler::{
    ErrorAction, EventHandler, FailureContext, HandlerError, HandlerHandle, RetryContext,
    spawn_handler,
};
pub use store::{
    EventStore, ExpectedVersion, InMemoryEventStore, StartFrom, StoreError, StreamFilter,
    SubscriberRef, SubscriptionMailbox, SubscriptionNotice,
};
pub use subscription::{BackoffConfig, Subscription};
pub use upcaster::{NoopUpcaster, UpcastError, UpcastFailure, Upcaster, upcast_stream};
