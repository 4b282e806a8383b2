//! Command dispatch: the call-site that couples aggregates to the
//! consistency registry.
//!
//! [`dispatch`] loads an aggregate by folding its stream, runs the command,
//! appends the produced events with an exact expected version, and, for
//! strongly-consistent dispatches, blocks until every registered strong
//! handler has acked past the final appended event number before returning
//! to the caller.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::aggregate::{Aggregate, encode_domain_event, fold, stream_id};
use crate::application::Application;
use crate::config::Consistency;
use crate::consistency::ConsistencyTimeout;
use crate::store::{EventStore, ExpectedVersion, StoreError};

/// Which result shape a dispatch call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Returning {
    /// Just acknowledge success.
    #[default]
    Nothing,
    /// The aggregate state after the command's events are applied.
    AggregateState,
    /// The aggregate version after the append.
    AggregateVersion,
    /// The full [`ExecutionResult`].
    ExecutionResult,
}

/// Options for a single dispatch call.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Result shape to return. Default: [`Returning::Nothing`].
    pub returning: Returning,
    /// Consistency for this dispatch; the application default applies when
    /// unset.
    pub consistency: Option<Consistency>,
    /// How long a strong dispatch waits for handlers to catch up.
    /// Default: 5 seconds.
    pub consistency_timeout: Duration,
    /// Restrict the strong-consistency wait to these handlers. All
    /// registered strong handlers are waited on when unset.
    pub handlers: Option<Vec<String>>,
    /// Metadata recorded on every produced event.
    pub metadata: Map<String, Value>,
    /// Correlation ID recorded on every produced event.
    pub correlation_id: Option<String>,
    /// Causation ID recorded on every produced event.
    pub causation_id: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            returning: Returning::Nothing,
            consistency: None,
            consistency_timeout: Duration::from_secs(5),
            handlers: None,
            metadata: Map::new(),
            correlation_id: None,
            causation_id: None,
        }
    }
}

impl DispatchOptions {
    /// Set the result shape.
    pub fn returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }

    /// Set the consistency for this dispatch.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Set the strong-consistency wait timeout.
    pub fn consistency_timeout(mut self, timeout: Duration) -> Self {
        self.consistency_timeout = timeout;
        self
    }

    /// Wait only for these handlers (intersected with the registered
    /// strong set).
    pub fn handlers(mut self, handlers: Vec<String>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Set the metadata recorded on produced events.
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the correlation ID recorded on produced events.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID recorded on produced events.
    pub fn causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// Everything a caller can learn from one successful dispatch.
#[derive(Debug, Clone)]
pub struct ExecutionResult<A: Aggregate> {
    /// The aggregate instance the command targeted.
    pub aggregate_id: String,
    /// Aggregate version after the append.
    pub aggregate_version: u64,
    /// Domain events the command produced, in order.
    pub events: Vec<A::DomainEvent>,
    /// Metadata recorded on the produced events.
    pub metadata: Map<String, Value>,
    /// Aggregate state after the command's events are applied.
    pub aggregate_state: A,
}

/// A successful dispatch, shaped per [`DispatchOptions::returning`].
#[derive(Debug)]
pub enum Dispatched<A: Aggregate> {
    /// The command was accepted ([`Returning::Nothing`]).
    Ok,
    /// The post-command aggregate state.
    State(A),
    /// The post-append aggregate version.
    Version(u64),
    /// The full execution result.
    Execution(ExecutionResult<A>),
}

/// Errors from command dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError<E: std::error::Error + Send + Sync + 'static> {
    /// The aggregate rejected the command.
    #[error(transparent)]
    Domain(E),

    /// Reading or appending the stream failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The command's events were persisted, but a strongly-consistent
    /// handler did not catch up within the timeout.
    #[error(transparent)]
    Consistency(#[from] ConsistencyTimeout),

    /// A domain event could not be encoded for the store.
    #[error("event codec error: {0}")]
    Codec(String),
}

/// Execute a command against an aggregate instance.
///
/// Reads and folds the instance's stream, runs the pure command handler,
/// appends the produced events with an exact expected version, then — when
/// the effective consistency is [`Consistency::Strong`] — waits for every
/// registered strong handler (optionally restricted by
/// [`DispatchOptions::handlers`]) to ack past the final appended event
/// number.
///
/// # Errors
///
/// [`DispatchError::Domain`] when the aggregate rejects the command,
/// [`DispatchError::Store`] on read/append failures (including version
/// conflicts from concurrent writers), and [`DispatchError::Consistency`]
/// when the strong-consistency wait times out; in the last case the events
/// are already persisted and the error reports which handlers lagged.
pub async fn dispatch<A: Aggregate>(
    application: &Application,
    instance_id: &str,
    command: A::Command,
    options: DispatchOptions,
) -> Result<Dispatched<A>, DispatchError<A::Error>> {
    let stream = stream_id::<A>(instance_id);
    let store = Arc::clone(application.store());

    let history = store.read_stream(&stream, 1).await?;
    let state: A = fold(&history);
    let version = history.len() as u64;

    let domain_events = state.handle(command).map_err(DispatchError::Domain)?;
    if domain_events.is_empty() {
        return Ok(shape(instance_id, state, version, Vec::new(), options));
    }

    let mut proposed = Vec::with_capacity(domain_events.len());
    for event in &domain_events {
        let mut item =
            encode_domain_event::<A>(event).map_err(|e| DispatchError::Codec(e.to_string()))?;
        item.metadata = options.metadata.clone();
        item.correlation_id = options.correlation_id.clone();
        item.causation_id = options.causation_id.clone();
        proposed.push(item);
    }
    let recorded = store
        .append(&stream, ExpectedVersion::Exact(version), proposed)
        .await?;
    let final_event_number = recorded.last().map(|e| e.event_number);

    let new_version = version + domain_events.len() as u64;
    let new_state = domain_events.iter().fold(state, |s, e| s.apply(e));

    let consistency = options
        .consistency
        .unwrap_or_else(|| application.default_consistency());
    if consistency == Consistency::Strong {
        if let Some(target) = final_event_number {
            let registry = application.registry();
            let mut targets = registry.list_strong(application.name());
            if let Some(requested) = &options.handlers {
                targets.retain(|name| requested.contains(name));
            }
            tracing::debug!(
                application = %application.name(),
                target_event_number = target,
                handlers = ?targets,
                "waiting for strong handlers"
            );
            registry
                .wait_for(
                    application.name(),
                    &targets,
                    target,
                    options.consistency_timeout,
                )
                .await?;
        }
    }

    Ok(shape(instance_id, new_state, new_version, domain_events, options))
}

fn shape<A: Aggregate>(
    instance_id: &str,
    state: A,
    version: u64,
    events: Vec<A::DomainEvent>,
    options: DispatchOptions,
) -> Dispatched<A> {
    match options.returning {
        Returning::Nothing => Dispatched::Ok,
        Returning::AggregateState => Dispatched::State(state),
        Returning::AggregateVersion => Dispatched::Version(version),
        Returning::ExecutionResult => Dispatched::Execution(ExecutionResult {
            aggregate_id: instance_id.to_string(),
            aggregate_version: version,
            events,
            metadata: options.metadata,
            aggregate_state: state,
        }),
    }
}
