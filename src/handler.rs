//! Handler runtime: the long-lived agent behind one event handler.
//!
//! [`spawn_handler`] resolves configuration, registers the handler with the
//! consistency registry, and spawns an agent task that owns a
//! [`Subscription`] and drives the delivery state machine: subscribe (with
//! backoff), await the store's confirmation, then process event batches
//! strictly in order, one `handle` invocation in flight at a time. Failures
//! from user code are routed through the handler's error policy
//! ([`ErrorAction`]); confirmed events are acked to the store, recorded in
//! the consistency registry, and remembered in a local high-water mark that
//! suppresses in-process redelivery.
//!
//! The agent is a single task; its state is never touched by another
//! thread. Control messages (reset, stop, state queries) arrive on an mpsc
//! channel and are answered over oneshot replies.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::application::Application;
use crate::config::{self, ConfigError, HandlerName, HandlerOptions, ResolvedConfig};
use crate::consistency::RegistrationGuard;
use crate::error::{ExitReason, HandlerGone, StartError};
use crate::event::{EventMetadata, RecordedEvent};
use crate::store::{SubscriberRef, SubscriptionNotice};
use crate::subscription::Subscription;
use crate::upcaster::{UpcastFailure, upcast_stream};

/// Opaque user-controlled context threaded verbatim across retries of one
/// failing event.
pub type RetryContext = Map<String, Value>;

/// Failures surfaced from (or on behalf of) a user `handle` callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The handler recognized the event as already processed. Treated as
    /// success: the event is acked without further delegation.
    #[error("event already seen")]
    AlreadySeen,

    /// The handler rejected the event.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked; the panic payload is captured here and a
    /// backtrace is attached to the failure context.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The event could not be migrated to its current schema.
    #[error("{0}")]
    Upcast(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// What the error policy decides to do with a failing event.
#[derive(Debug, Clone)]
pub enum ErrorAction {
    /// Re-invoke `handle` for the same event with this context.
    Retry {
        /// Context passed into the next attempt's [`FailureContext`].
        context: RetryContext,
    },
    /// Sleep, then re-invoke `handle` for the same event. The sleep is
    /// cooperative: the agent stays receptive to stop signals only.
    RetryAfter {
        /// How long to wait before the next attempt.
        delay: Duration,
        /// Context passed into the next attempt's [`FailureContext`].
        context: RetryContext,
    },
    /// Ack the event without invoking `handle` again and move on.
    Skip,
    /// Terminate the handler with this reason. The current batch is
    /// abandoned; nothing further is acked.
    Stop(String),
}

/// Everything an error policy gets to see about a failing event.
///
/// Created fresh on each failure; only `context` carries state from one
/// retry to the next, and it does so verbatim.
#[derive(Debug, Clone)]
pub struct FailureContext {
    /// Name of the application the handler is bound to.
    pub application: String,
    /// Name of the failing handler.
    pub handler_name: String,
    /// Enriched metadata for the failing event.
    pub metadata: EventMetadata,
    /// User-controlled context from the previous [`ErrorAction::Retry`],
    /// empty on the first attempt.
    pub context: RetryContext,
    /// Captured backtrace when the failure was a panic.
    pub stack_trace: Option<String>,
}

/// A user-defined event handler.
///
/// Every callback has a default, so an implementation only overrides what
/// it needs; the commonest shape is `handle` plus, for handlers that want
/// retries, `on_error`. The default error policy stops the handler on the
/// first failure.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Options the handler declares for itself; runtime overrides passed to
    /// [`spawn_handler`] are merged on top.
    fn default_options(&self) -> HandlerOptions {
        HandlerOptions::default()
    }

    /// Inspect or rewrite the merged options before validation.
    fn init_config(&self, options: HandlerOptions) -> Result<HandlerOptions, ConfigError> {
        Ok(options)
    }

    /// Invoked once the store confirms the subscription, before any event
    /// is delivered. Returning `Err` terminates the handler.
    async fn init(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Handle one event. Events arrive in strictly ascending
    /// `event_number` order, one at a time.
    async fn handle(&self, payload: &Value, metadata: &EventMetadata) -> Result<(), HandlerError> {
        let _ = (payload, metadata);
        Ok(())
    }

    /// Decide what to do about a failing event.
    async fn on_error(
        &self,
        error: HandlerError,
        event: &RecordedEvent,
        failure: &FailureContext,
    ) -> ErrorAction {
        let _ = (event, failure);
        ErrorAction::Stop(error.to_string())
    }

    /// Invoked before the durable cursor is discarded on a reset request.
    /// Returning `Err` terminates the handler instead.
    async fn before_reset(&self) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Control messages from a [`HandlerHandle`] to the agent.
enum Control {
    Reset { reply: oneshot::Sender<()> },
    LastSeen { reply: oneshot::Sender<Option<u64>> },
    Stop,
}

/// Handle to a running handler agent.
///
/// Lightweight; communicates with the agent over a bounded channel.
/// Dropping every handle shuts the agent down.
pub struct HandlerHandle {
    name: HandlerName,
    control: mpsc::Sender<Control>,
    task: tokio::task::JoinHandle<ExitReason>,
}

impl HandlerHandle {
    /// The handler's validated name.
    pub fn name(&self) -> &HandlerName {
        &self.name
    }

    /// Whether the agent is still running.
    pub fn is_alive(&self) -> bool {
        !self.control.is_closed()
    }

    /// Discard the durable cursor and resubscribe from the configured
    /// start position. Returns once the cursor is cleared and the
    /// resubscribe has begun.
    ///
    /// # Errors
    ///
    /// [`HandlerGone`] if the agent has terminated (including when the
    /// handler's `before_reset` refused the reset and stopped the agent).
    pub async fn reset(&self) -> Result<(), HandlerGone> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Reset { reply: tx })
            .await
            .map_err(|_| HandlerGone)?;
        rx.await.map_err(|_| HandlerGone)
    }

    /// The highest event number the agent has processed or skipped in this
    /// process lifetime.
    ///
    /// # Errors
    ///
    /// [`HandlerGone`] if the agent has terminated.
    pub async fn last_seen_event(&self) -> Result<Option<u64>, HandlerGone> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::LastSeen { reply: tx })
            .await
            .map_err(|_| HandlerGone)?;
        rx.await.map_err(|_| HandlerGone)
    }

    /// Ask the agent to shut down. Pair with [`join`](HandlerHandle::join)
    /// to wait for termination.
    pub async fn stop(&self) {
        let _ = self.control.send(Control::Stop).await;
    }

    /// Wait for the agent to terminate and return why it did.
    pub async fn join(self) -> ExitReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(join_error) => ExitReason::Stopped(format!("handler task failed: {join_error}")),
        }
    }
}

/// Resolve configuration, register with the consistency registry, and
/// spawn the handler agent. Must be called within a tokio runtime.
///
/// # Errors
///
/// [`StartError::Config`] for invalid options and [`StartError::Registry`]
/// when another live handler already holds the name; in both cases nothing
/// is spawned.
pub fn spawn_handler<H>(
    application: &Application,
    handler: H,
    overrides: HandlerOptions,
) -> Result<HandlerHandle, StartError>
where
    H: EventHandler,
{
    let resolved = config::resolve(application, &handler, overrides)?;
    let agent_id = Uuid::new_v4();
    let guard = application.registry().register(
        &resolved.application,
        resolved.name.as_str(),
        std::any::type_name::<H>(),
        agent_id,
        resolved.consistency,
    )?;

    tracing::info!(
        application = %resolved.application,
        handler = %resolved.name,
        consistency = %resolved.consistency,
        "starting event handler"
    );

    let (control_tx, control_rx) = mpsc::channel(16);
    let (mailbox_tx, mailbox_rx) = mpsc::channel(32);
    let subscription = Subscription::with_backoff(
        resolved.application.clone(),
        resolved.name.as_str(),
        resolved.start_from,
        resolved.subscribe_to.clone(),
        application.backoff_config().clone(),
    );
    let name = resolved.name.clone();
    let agent = Agent {
        handler,
        application: application.clone(),
        config: resolved,
        subscription,
        last_seen: None,
        control: control_rx,
        mailbox_rx,
        mailbox_tx,
        deferred: Vec::new(),
        _guard: guard,
    };
    let task = tokio::spawn(agent.run());

    Ok(HandlerHandle {
        name,
        control: control_tx,
        task,
    })
}

/// Outcome of processing one event (or one batch): keep going, stop by
/// policy, or die from an infrastructure failure.
enum Disposition {
    Continue,
    Stop(String),
    Fatal(ExitReason),
}

/// Outcome of a waiting state: re-enter the subscribe loop or terminate.
enum Flow {
    Resubscribe,
    Exit(ExitReason),
}

/// Outcome of servicing one control message.
enum ControlOutcome {
    Stay,
    Resubscribe,
    Exit(ExitReason),
}

/// The agent: exclusive owner of the handler's runtime state.
struct Agent<H> {
    handler: H,
    application: Application,
    config: ResolvedConfig,
    subscription: Subscription,
    /// Highest event number processed or skipped in this process lifetime.
    /// A local dedupe hint, not a durable cursor.
    last_seen: Option<u64>,
    control: mpsc::Receiver<Control>,
    mailbox_rx: mpsc::Receiver<SubscriptionNotice>,
    /// Kept so the mailbox can be re-handed to the store on resubscribe.
    mailbox_tx: mpsc::Sender<SubscriptionNotice>,
    /// Reset requests parked during a retry sleep.
    deferred: Vec<Control>,
    _guard: RegistrationGuard,
}

impl<H: EventHandler> Agent<H> {
    async fn run(mut self) -> ExitReason {
        loop {
            let subscriber = match self.subscribe_with_backoff().await {
                Ok(subscriber) => subscriber,
                Err(Flow::Resubscribe) => continue,
                Err(Flow::Exit(reason)) => return self.exit(reason),
            };
            match self.await_confirmation(subscriber).await {
                Ok(()) => {}
                Err(Flow::Resubscribe) => continue,
                Err(Flow::Exit(reason)) => return self.exit(reason),
            }
            match self.running(subscriber).await {
                Flow::Resubscribe => continue,
                Flow::Exit(reason) => return self.exit(reason),
            }
        }
    }

    fn exit(&self, reason: ExitReason) -> ExitReason {
        tracing::info!(
            application = %self.config.application,
            handler = %self.config.name,
            reason = %reason,
            "event handler terminating"
        );
        reason
    }

    /// Subscribe, retrying with the backoff schedule on failure. Transient
    /// subscribe failures are logged at info.
    async fn subscribe_with_backoff(&mut self) -> Result<SubscriberRef, Flow> {
        loop {
            let store = Arc::clone(self.application.store());
            match self
                .subscription
                .subscribe(store.as_ref(), &self.mailbox_tx)
                .await
            {
                Ok(subscriber) => {
                    tracing::info!(
                        application = %self.config.application,
                        handler = %self.config.name,
                        "subscribed to event store"
                    );
                    return Ok(subscriber);
                }
                Err(error) => {
                    let delay = self.subscription.next_backoff();
                    tracing::info!(
                        handler = %self.config.name,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "subscribe failed; will retry"
                    );
                    let sleep = tokio::time::sleep(delay);
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            _ = &mut sleep => break,
                            msg = self.control.recv() => match self.handle_control(msg).await {
                                ControlOutcome::Stay => {}
                                ControlOutcome::Resubscribe => return Err(Flow::Resubscribe),
                                ControlOutcome::Exit(reason) => return Err(Flow::Exit(reason)),
                            },
                        }
                    }
                }
            }
        }
    }

    /// Wait for the store's `Subscribed` confirmation for `expected`, then
    /// run the user `init` callback.
    async fn await_confirmation(&mut self, expected: SubscriberRef) -> Result<(), Flow> {
        loop {
            tokio::select! {
                notice = self.mailbox_rx.recv() => match notice {
                    Some(SubscriptionNotice::Subscribed(subscriber)) if subscriber == expected => {
                        return match self.handler.init().await {
                            Ok(()) => Ok(()),
                            Err(error) => Err(Flow::Exit(ExitReason::Stopped(error.to_string()))),
                        };
                    }
                    Some(SubscriptionNotice::Down { subscriber, reason }) if subscriber == expected => {
                        return Err(Flow::Exit(ExitReason::SubscriptionDown(reason)));
                    }
                    Some(other) => self.note_unexpected(other),
                    None => return Err(Flow::Exit(mailbox_closed())),
                },
                msg = self.control.recv() => match self.handle_control(msg).await {
                    ControlOutcome::Stay => {}
                    ControlOutcome::Resubscribe => return Err(Flow::Resubscribe),
                    ControlOutcome::Exit(reason) => return Err(Flow::Exit(reason)),
                },
            }
        }
    }

    /// Steady state: process batches and control messages until a reset,
    /// stop, or subscription death.
    async fn running(&mut self, current: SubscriberRef) -> Flow {
        loop {
            // A reset parked during a retry sleep runs now that the
            // in-flight event has resolved.
            while let Some(msg) = self.deferred.pop() {
                match self.handle_control(Some(msg)).await {
                    ControlOutcome::Stay => {}
                    ControlOutcome::Resubscribe => return Flow::Resubscribe,
                    ControlOutcome::Exit(reason) => return Flow::Exit(reason),
                }
            }
            tokio::select! {
                notice = self.mailbox_rx.recv() => match notice {
                    Some(SubscriptionNotice::Events { subscriber, events }) if subscriber == current => {
                        match self.process_batch(events).await {
                            Disposition::Continue => {}
                            Disposition::Stop(reason) => return Flow::Exit(ExitReason::Stopped(reason)),
                            Disposition::Fatal(reason) => return Flow::Exit(reason),
                        }
                    }
                    Some(SubscriptionNotice::Down { subscriber, reason }) if subscriber == current => {
                        return Flow::Exit(ExitReason::SubscriptionDown(reason));
                    }
                    Some(other) => self.note_unexpected(other),
                    None => return Flow::Exit(mailbox_closed()),
                },
                msg = self.control.recv() => match self.handle_control(msg).await {
                    ControlOutcome::Stay => {}
                    ControlOutcome::Resubscribe => return Flow::Resubscribe,
                    ControlOutcome::Exit(reason) => return Flow::Exit(reason),
                },
            }
        }
    }

    fn note_unexpected(&self, notice: SubscriptionNotice) {
        tracing::error!(
            handler = %self.config.name,
            notice = ?notice,
            "ignoring unexpected subscription notice"
        );
    }

    async fn handle_control(&mut self, msg: Option<Control>) -> ControlOutcome {
        match msg {
            None | Some(Control::Stop) => ControlOutcome::Exit(ExitReason::Shutdown),
            Some(Control::LastSeen { reply }) => {
                let _ = reply.send(self.last_seen);
                ControlOutcome::Stay
            }
            Some(Control::Reset { reply }) => match self.handler.before_reset().await {
                Ok(()) => {
                    let store = Arc::clone(self.application.store());
                    if let Err(error) = self.subscription.reset(store.as_ref()).await {
                        return ControlOutcome::Exit(ExitReason::Store(error));
                    }
                    self.last_seen = None;
                    tracing::info!(
                        handler = %self.config.name,
                        "reset: durable cursor discarded, resubscribing"
                    );
                    let _ = reply.send(());
                    ControlOutcome::Resubscribe
                }
                Err(error) => ControlOutcome::Exit(ExitReason::Stopped(error.to_string())),
            },
        }
    }

    /// Upcast a batch lazily and process it strictly in order.
    async fn process_batch(&mut self, events: Vec<RecordedEvent>) -> Disposition {
        tracing::debug!(
            handler = %self.config.name,
            count = events.len(),
            "processing event batch"
        );
        let upcaster = Arc::clone(self.application.upcaster());
        let mut extra = Map::new();
        extra.insert(
            "application".to_string(),
            Value::String(self.config.application.clone()),
        );
        for item in upcast_stream(upcaster.as_ref(), events, extra) {
            match self.process_event(item).await {
                Disposition::Continue => {}
                other => return other,
            }
        }
        Disposition::Continue
    }

    /// Deliver one event: dedupe, delegate under guard, apply the error
    /// policy, confirm receipt.
    async fn process_event(&mut self, item: Result<RecordedEvent, UpcastFailure>) -> Disposition {
        let (event, upcast_error) = match item {
            Ok(event) => (event, None),
            Err(failure) => {
                let message = failure.error.to_string();
                (failure.event, Some(HandlerError::Upcast(message)))
            }
        };

        // Already processed or skipped in this process lifetime: ack
        // without delegation so a redelivered event is not re-executed.
        if let Some(seen) = self.last_seen {
            if event.event_number <= seen {
                tracing::debug!(
                    handler = %self.config.name,
                    event_number = event.event_number,
                    "duplicate event, acking without delegation"
                );
                return self.confirm(&event).await;
            }
        }

        let metadata =
            EventMetadata::enrich(&event, &self.config.application, self.config.name.as_str());
        let mut context = RetryContext::new();
        loop {
            // An upcast failure is deterministic, so it stays sticky across
            // retries rather than re-running the transform.
            let outcome = match &upcast_error {
                Some(error) => Err((error.clone(), None)),
                None => self.delegate(&event, &metadata).await,
            };
            let (error, stack_trace) = match outcome {
                Ok(()) => return self.confirm(&event).await,
                Err((HandlerError::AlreadySeen, _)) => return self.confirm(&event).await,
                Err(pair) => pair,
            };

            let failure = FailureContext {
                application: self.config.application.clone(),
                handler_name: self.config.name.as_str().to_string(),
                metadata: metadata.clone(),
                context: context.clone(),
                stack_trace,
            };
            tracing::error!(
                handler = %self.config.name,
                event_number = event.event_number,
                error = %error,
                "event handler failed"
            );
            match self.handler.on_error(error, &event, &failure).await {
                ErrorAction::Retry { context: next } => context = next,
                ErrorAction::RetryAfter {
                    delay,
                    context: next,
                } => {
                    context = next;
                    if let Some(reason) = self.sleep_receptive(delay).await {
                        return Disposition::Fatal(reason);
                    }
                }
                ErrorAction::Skip => {
                    tracing::warn!(
                        handler = %self.config.name,
                        event_number = event.event_number,
                        "skipping event"
                    );
                    return self.confirm(&event).await;
                }
                ErrorAction::Stop(reason) => return Disposition::Stop(reason),
            }
        }
    }

    /// Invoke the user `handle` callback inside a panic guard.
    async fn delegate(
        &self,
        event: &RecordedEvent,
        metadata: &EventMetadata,
    ) -> Result<(), (HandlerError, Option<String>)> {
        let invocation = self.handler.handle(&event.payload, metadata);
        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err((error, None)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let trace = std::backtrace::Backtrace::force_capture().to_string();
                Err((HandlerError::Panicked(message), Some(trace)))
            }
        }
    }

    /// Confirm receipt: store ack, then registry ack, then advance the
    /// local high-water mark. The order is observable and relied upon.
    async fn confirm(&mut self, event: &RecordedEvent) -> Disposition {
        let store = Arc::clone(self.application.store());
        if let Err(error) = self.subscription.ack(store.as_ref(), event).await {
            tracing::error!(
                handler = %self.config.name,
                event_number = event.event_number,
                error = %error,
                "failed to ack event"
            );
            return Disposition::Fatal(ExitReason::Store(error));
        }
        self.application.registry().ack(
            &self.config.application,
            self.config.name.as_str(),
            self.config.consistency,
            event.event_number,
        );
        self.last_seen = Some(self.last_seen.unwrap_or(0).max(event.event_number));
        Disposition::Continue
    }

    /// Sleep between retries, receptive only to stop signals. Reset
    /// requests are parked until the in-flight event resolves.
    async fn sleep_receptive(&mut self, delay: Duration) -> Option<ExitReason> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                msg = self.control.recv() => match msg {
                    None | Some(Control::Stop) => return Some(ExitReason::Shutdown),
                    Some(Control::LastSeen { reply }) => {
                        let _ = reply.send(self.last_seen);
                    }
                    Some(reset @ Control::Reset { .. }) => self.deferred.push(reset),
                },
            }
        }
    }
}

fn mailbox_closed() -> ExitReason {
    ExitReason::SubscriptionDown("subscription mailbox closed".to_string())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic payload of unknown type".to_string()
    }
}
