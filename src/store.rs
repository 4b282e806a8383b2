//! Event store contract and the in-memory reference store.
//!
//! The store is an external collaborator: an append-only log with named
//! durable subscriptions and ack-based cursor advancement. [`EventStore`]
//! documents exactly the surface this crate consumes (and the append/read
//! surface command dispatch produces events through). [`InMemoryEventStore`]
//! is a complete implementation used by tests and local development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use crate::event::{ProposedEvent, RecordedEvent};

/// Where a durable subscription begins delivery when the store holds no
/// cursor for it yet.
///
/// Consulted only at first creation (and again after a [`reset`]); once a
/// cursor exists the store resumes from it and ignores this value.
///
/// [`reset`]: EventStore::reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Deliver every event from the beginning of the log.
    Origin,
    /// Deliver only events appended after the subscription is created.
    Current,
    /// Deliver starting at this event number (inclusive).
    Exact(u64),
}

/// Which streams a subscription receives events from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFilter {
    /// All streams, interleaved in global order.
    All,
    /// A single stream.
    Stream(String),
}

impl StreamFilter {
    /// Returns `true` if an event on `stream_id` passes this filter.
    pub fn matches(&self, stream_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Stream(id) => id == stream_id,
        }
    }
}

/// Expected stream version for optimistic concurrency on append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

/// Opaque identity of a store-side subscriber.
///
/// Every successful [`subscribe`](EventStore::subscribe) yields a fresh ref;
/// notices pushed into the mailbox carry it so consumers can discard
/// messages from a subscription they have since replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberRef(Uuid);

impl SubscriberRef {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Messages the store pushes into a subscriber's mailbox.
#[derive(Debug, Clone)]
pub enum SubscriptionNotice {
    /// One-shot confirmation that the subscription is live. Always the
    /// first message for a given [`SubscriberRef`].
    Subscribed(SubscriberRef),
    /// A non-empty, ordered slice of recorded events.
    Events {
        /// The subscription the batch belongs to.
        subscriber: SubscriberRef,
        /// Events in strictly ascending `event_number` order.
        events: Vec<RecordedEvent>,
    },
    /// The store-side subscriber terminated.
    Down {
        /// The subscription that terminated.
        subscriber: SubscriberRef,
        /// Why the store ended it.
        reason: String,
    },
}

/// Channel end a subscriber hands to the store to receive notices on.
pub type SubscriptionMailbox = mpsc::Sender<SubscriptionNotice>;

/// Errors returned by event store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store rejected or could not service a subscribe call.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// The subscriber ref is not (or no longer) known to the store.
    #[error("unknown subscriber")]
    UnknownSubscriber,

    /// Optimistic concurrency check failed on append.
    #[error("version conflict on stream {stream_id}: expected {expected:?}, current {current}")]
    VersionConflict {
        /// Stream the append targeted.
        stream_id: String,
        /// Version the caller expected.
        expected: ExpectedVersion,
        /// Version the stream is actually at.
        current: u64,
    },
}

/// The event store surface this crate consumes.
///
/// Subscriber side: named durable subscriptions with ack-advanced cursors,
/// asynchronous delivery into a mailbox, and a liveness `Down` notice when
/// the store-side subscriber terminates. Command side: append with
/// optimistic concurrency and ordered stream reads.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Register `mailbox` as the named durable subscriber for `filter`.
    ///
    /// `start_from` is used only when the store holds no cursor for
    /// `(application, subscription_name)`. Delivery is asynchronous: the
    /// store pushes a [`SubscriptionNotice::Subscribed`] confirmation
    /// followed by event batches. Subscribing a name that already has a
    /// live subscriber replaces it.
    async fn subscribe(
        &self,
        application: &str,
        subscription_name: &str,
        filter: StreamFilter,
        start_from: StartFrom,
        mailbox: SubscriptionMailbox,
    ) -> Result<SubscriberRef, StoreError>;

    /// Confirm receipt of `event_number`, allowing the durable cursor to
    /// advance past it and further events to be delivered.
    async fn ack(&self, subscriber: SubscriberRef, event_number: u64) -> Result<(), StoreError>;

    /// Discard the durable cursor for the named subscription. The next
    /// `subscribe` resolves its position from `start_from` again.
    async fn reset(&self, application: &str, subscription_name: &str) -> Result<(), StoreError>;

    /// Append events to a stream with optimistic concurrency control.
    ///
    /// Returns the recorded events with their assigned event numbers and
    /// stream versions.
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Read a single stream in order, starting at `from_version` (one-based,
    /// inclusive). An unknown stream reads as empty.
    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, StoreError>;
}

// --- In-memory store ---

const DEFAULT_MAX_IN_FLIGHT: usize = 128;

type SubscriptionKey = (String, String);

/// In-memory [`EventStore`] with full durable-subscription semantics.
///
/// Event numbers are one-based and contiguous across the global log.
/// Cursors advance only on ack, so events delivered but never acked are
/// redelivered after the next subscribe. Each subscriber is served by its
/// own pump task that respects an in-flight window (ack backpressure).
///
/// Carries two failure-injection knobs for exercising reconnect paths in
/// tests: [`fail_subscribes`](InMemoryEventStore::fail_subscribes) and
/// [`drop_subscriber`](InMemoryEventStore::drop_subscriber).
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    changed: Notify,
    max_in_flight: usize,
}

#[derive(Default)]
struct StoreState {
    log: Vec<RecordedEvent>,
    stream_versions: HashMap<String, u64>,
    cursors: HashMap<SubscriptionKey, u64>,
    subscribers: HashMap<SubscriberRef, SubscriberState>,
    by_name: HashMap<SubscriptionKey, SubscriberRef>,
    fail_subscribes: u32,
    subscribe_attempts: u64,
}

struct SubscriberState {
    key: SubscriptionKey,
    filter: StreamFilter,
    mailbox: SubscriptionMailbox,
    /// Next global log index to scan for this subscriber.
    next_index: usize,
    /// Events delivered but not yet acked, bounded by the in-flight window.
    delivered_unacked: usize,
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A poisoned lock only means another thread panicked mid-update of
        // plain data; the state itself is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_subscriber(&self, subscriber: SubscriberRef) {
        let mut state = self.lock();
        if let Some(sub) = state.subscribers.remove(&subscriber) {
            if state.by_name.get(&sub.key) == Some(&subscriber) {
                state.by_name.remove(&sub.key);
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Create an empty store with the default in-flight window.
    pub fn new() -> Self {
        Self::with_max_in_flight(DEFAULT_MAX_IN_FLIGHT)
    }

    /// Create an empty store that delivers at most `max_in_flight` unacked
    /// events per subscriber.
    pub fn with_max_in_flight(max_in_flight: usize) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                changed: Notify::new(),
                max_in_flight: max_in_flight.max(1),
            }),
        }
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_subscribes(&self, count: u32) {
        self.inner.lock().fail_subscribes = count;
    }

    /// Total subscribe calls seen, including injected failures.
    pub fn subscribe_attempts(&self) -> u64 {
        self.inner.lock().subscribe_attempts
    }

    /// The durable cursor (next event number to deliver) for a named
    /// subscription, if one exists.
    pub fn durable_cursor(&self, application: &str, subscription_name: &str) -> Option<u64> {
        let key = (application.to_string(), subscription_name.to_string());
        self.inner.lock().cursors.get(&key).copied()
    }

    /// The highest event number appended so far (0 when empty).
    pub fn last_event_number(&self) -> u64 {
        self.inner.lock().log.len() as u64
    }

    /// Terminate the live subscriber for a named subscription, pushing a
    /// `Down` notice with `reason` into its mailbox.
    pub async fn drop_subscriber(&self, application: &str, subscription_name: &str, reason: &str) {
        let key = (application.to_string(), subscription_name.to_string());
        let removed = {
            let mut state = self.inner.lock();
            match state.by_name.remove(&key) {
                Some(subscriber) => state
                    .subscribers
                    .remove(&subscriber)
                    .map(|sub| (subscriber, sub.mailbox)),
                None => None,
            }
        };
        self.inner.changed.notify_waiters();
        if let Some((subscriber, mailbox)) = removed {
            let _ = mailbox
                .send(SubscriptionNotice::Down {
                    subscriber,
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn subscribe(
        &self,
        application: &str,
        subscription_name: &str,
        filter: StreamFilter,
        start_from: StartFrom,
        mailbox: SubscriptionMailbox,
    ) -> Result<SubscriberRef, StoreError> {
        let subscriber = SubscriberRef::new();
        {
            let mut state = self.inner.lock();
            state.subscribe_attempts += 1;
            if state.fail_subscribes > 0 {
                state.fail_subscribes -= 1;
                return Err(StoreError::SubscribeFailed(
                    "injected subscribe failure".to_string(),
                ));
            }

            let key = (application.to_string(), subscription_name.to_string());
            let log_len = state.log.len() as u64;
            let cursor = *state.cursors.entry(key.clone()).or_insert(match start_from {
                StartFrom::Origin => 1,
                StartFrom::Current => log_len + 1,
                StartFrom::Exact(n) => n,
            });

            // Replace any previous subscriber for this name; its pump will
            // notice the removal and exit without a Down notice.
            if let Some(old) = state.by_name.insert(key.clone(), subscriber) {
                state.subscribers.remove(&old);
            }

            let next_index = (cursor.saturating_sub(1) as usize).min(state.log.len());
            state.subscribers.insert(
                subscriber,
                SubscriberState {
                    key,
                    filter,
                    mailbox,
                    next_index,
                    delivered_unacked: 0,
                },
            );
        }
        self.inner.changed.notify_waiters();
        tokio::spawn(run_pump(Arc::clone(&self.inner), subscriber));
        Ok(subscriber)
    }

    async fn ack(&self, subscriber: SubscriberRef, event_number: u64) -> Result<(), StoreError> {
        {
            let mut state = self.inner.lock();
            let StoreState {
                subscribers,
                cursors,
                ..
            } = &mut *state;
            let sub = subscribers
                .get_mut(&subscriber)
                .ok_or(StoreError::UnknownSubscriber)?;
            sub.delivered_unacked = sub.delivered_unacked.saturating_sub(1);
            let cursor = cursors.entry(sub.key.clone()).or_insert(event_number + 1);
            *cursor = (*cursor).max(event_number + 1);
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn reset(&self, application: &str, subscription_name: &str) -> Result<(), StoreError> {
        let key = (application.to_string(), subscription_name.to_string());
        self.inner.lock().cursors.remove(&key);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let recorded = {
            let mut state = self.inner.lock();
            let current = state.stream_versions.get(stream_id).copied().unwrap_or(0);
            let matches = match expected {
                ExpectedVersion::Any => true,
                ExpectedVersion::NoStream => current == 0,
                ExpectedVersion::Exact(v) => current == v,
            };
            if !matches {
                return Err(StoreError::VersionConflict {
                    stream_id: stream_id.to_string(),
                    expected,
                    current,
                });
            }

            let created_at = unix_millis();
            let mut version = current;
            let mut recorded = Vec::with_capacity(events.len());
            for proposed in events {
                version += 1;
                let event = RecordedEvent {
                    event_number: state.log.len() as u64 + 1,
                    event_id: Uuid::new_v4(),
                    stream_id: stream_id.to_string(),
                    stream_version: version,
                    event_type: proposed.event_type,
                    payload: proposed.payload,
                    metadata: proposed.metadata,
                    correlation_id: proposed.correlation_id,
                    causation_id: proposed.causation_id,
                    created_at,
                };
                state.log.push(event.clone());
                recorded.push(event);
            }
            state.stream_versions.insert(stream_id.to_string(), version);
            recorded
        };
        self.inner.changed.notify_waiters();
        Ok(recorded)
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .log
            .iter()
            .filter(|e| e.stream_id == stream_id && e.stream_version >= from_version)
            .cloned()
            .collect())
    }
}

/// Per-subscriber delivery loop.
///
/// Pushes the `Subscribed` confirmation, then batches of events from the
/// durable cursor onward, waiting whenever the in-flight window is full or
/// the log is exhausted. Exits when the subscriber is removed or its
/// mailbox is dropped (liveness toward the store).
async fn run_pump(inner: Arc<StoreInner>, subscriber: SubscriberRef) {
    enum Step {
        Exit,
        Wait,
        Deliver(Vec<RecordedEvent>, SubscriptionMailbox),
    }

    let mailbox = match inner.lock().subscribers.get(&subscriber) {
        Some(sub) => sub.mailbox.clone(),
        None => return,
    };
    if mailbox
        .send(SubscriptionNotice::Subscribed(subscriber))
        .await
        .is_err()
    {
        inner.remove_subscriber(subscriber);
        return;
    }

    loop {
        // Enable the wakeup listener before inspecting state so an append
        // or ack between the check and the await is not lost.
        let notified = inner.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let step = {
            let mut state = inner.lock();
            let StoreState {
                log, subscribers, ..
            } = &mut *state;
            match subscribers.get_mut(&subscriber) {
                None => Step::Exit,
                Some(sub) => {
                    let budget = inner.max_in_flight.saturating_sub(sub.delivered_unacked);
                    let mut batch = Vec::new();
                    while sub.next_index < log.len() && batch.len() < budget {
                        let event = &log[sub.next_index];
                        sub.next_index += 1;
                        if sub.filter.matches(&event.stream_id) {
                            batch.push(event.clone());
                        }
                    }
                    if batch.is_empty() {
                        Step::Wait
                    } else {
                        sub.delivered_unacked += batch.len();
                        Step::Deliver(batch, sub.mailbox.clone())
                    }
                }
            }
        };

        match step {
            Step::Exit => return,
            Step::Wait => notified.await,
            Step::Deliver(events, mailbox) => {
                let notice = SubscriptionNotice::Events { subscriber, events };
                if mailbox.send(notice).await.is_err() {
                    inner.remove_subscriber(subscriber);
                    return;
                }
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn proposed(event_type: &str) -> ProposedEvent {
        ProposedEvent::new(event_type, serde_json::json!({}))
    }

    async fn next_notice(rx: &mut mpsc::Receiver<SubscriptionNotice>) -> SubscriptionNotice {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a subscription notice")
            .expect("mailbox closed")
    }

    async fn expect_subscribed(rx: &mut mpsc::Receiver<SubscriptionNotice>) -> SubscriberRef {
        match next_notice(rx).await {
            SubscriptionNotice::Subscribed(subscriber) => subscriber,
            other => panic!("expected Subscribed, got: {other:?}"),
        }
    }

    async fn expect_events(rx: &mut mpsc::Receiver<SubscriptionNotice>) -> Vec<RecordedEvent> {
        match next_notice(rx).await {
            SubscriptionNotice::Events { events, .. } => events,
            other => panic!("expected Events, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_assigns_contiguous_numbers_and_versions() {
        let store = InMemoryEventStore::new();

        let first = store
            .append("account-1", ExpectedVersion::NoStream, vec![proposed("Opened")])
            .await
            .expect("append should succeed");
        let second = store
            .append(
                "account-1",
                ExpectedVersion::Exact(1),
                vec![proposed("Deposited"), proposed("Deposited")],
            )
            .await
            .expect("append should succeed");

        assert_eq!(first[0].event_number, 1);
        assert_eq!(first[0].stream_version, 1);
        assert_eq!(second[0].event_number, 2);
        assert_eq!(second[1].event_number, 3);
        assert_eq!(second[1].stream_version, 3);
    }

    #[tokio::test]
    async fn append_version_conflict() {
        let store = InMemoryEventStore::new();
        store
            .append("account-1", ExpectedVersion::Any, vec![proposed("Opened")])
            .await
            .expect("append should succeed");

        let result = store
            .append("account-1", ExpectedVersion::NoStream, vec![proposed("Opened")])
            .await;

        assert!(
            matches!(result, Err(StoreError::VersionConflict { current: 1, .. })),
            "expected VersionConflict, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn subscribe_from_origin_delivers_history_then_live() {
        let store = InMemoryEventStore::new();
        store
            .append("s-1", ExpectedVersion::Any, vec![proposed("A"), proposed("B")])
            .await
            .expect("append should succeed");

        let (tx, mut rx) = mpsc::channel(16);
        store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx)
            .await
            .expect("subscribe should succeed");

        expect_subscribed(&mut rx).await;
        let history = expect_events(&mut rx).await;
        assert_eq!(
            history.iter().map(|e| e.event_number).collect::<Vec<_>>(),
            vec![1, 2]
        );

        store
            .append("s-1", ExpectedVersion::Any, vec![proposed("C")])
            .await
            .expect("append should succeed");
        let live = expect_events(&mut rx).await;
        assert_eq!(live[0].event_number, 3);
    }

    #[tokio::test]
    async fn start_from_current_skips_history() {
        let store = InMemoryEventStore::new();
        store
            .append("s-1", ExpectedVersion::Any, vec![proposed("A")])
            .await
            .expect("append should succeed");

        let (tx, mut rx) = mpsc::channel(16);
        store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Current, tx)
            .await
            .expect("subscribe should succeed");
        expect_subscribed(&mut rx).await;

        store
            .append("s-1", ExpectedVersion::Any, vec![proposed("B")])
            .await
            .expect("append should succeed");
        let events = expect_events(&mut rx).await;
        assert_eq!(events[0].event_number, 2);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn start_from_exact_delivers_from_that_number() {
        let store = InMemoryEventStore::new();
        store
            .append(
                "s-1",
                ExpectedVersion::Any,
                vec![proposed("A"), proposed("B"), proposed("C")],
            )
            .await
            .expect("append should succeed");

        let (tx, mut rx) = mpsc::channel(16);
        store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Exact(2), tx)
            .await
            .expect("subscribe should succeed");
        expect_subscribed(&mut rx).await;

        let events = expect_events(&mut rx).await;
        assert_eq!(
            events.iter().map(|e| e.event_number).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn unacked_events_redelivered_after_resubscribe() {
        let store = InMemoryEventStore::new();
        store
            .append("s-1", ExpectedVersion::Any, vec![proposed("A"), proposed("B")])
            .await
            .expect("append should succeed");

        // First subscriber acks only event 1.
        let (tx, mut rx) = mpsc::channel(16);
        let subscriber = store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx)
            .await
            .expect("subscribe should succeed");
        expect_subscribed(&mut rx).await;
        let events = expect_events(&mut rx).await;
        assert_eq!(events.len(), 2);
        store.ack(subscriber, 1).await.expect("ack should succeed");
        assert_eq!(store.durable_cursor("app", "sub"), Some(2));
        drop(rx);

        // Second subscriber resumes from the durable cursor.
        let (tx2, mut rx2) = mpsc::channel(16);
        store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx2)
            .await
            .expect("resubscribe should succeed");
        expect_subscribed(&mut rx2).await;
        let redelivered = expect_events(&mut rx2).await;
        assert_eq!(
            redelivered.iter().map(|e| e.event_number).collect::<Vec<_>>(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn reset_discards_cursor() {
        let store = InMemoryEventStore::new();
        store
            .append("s-1", ExpectedVersion::Any, vec![proposed("A")])
            .await
            .expect("append should succeed");

        let (tx, mut rx) = mpsc::channel(16);
        let subscriber = store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx)
            .await
            .expect("subscribe should succeed");
        expect_subscribed(&mut rx).await;
        expect_events(&mut rx).await;
        store.ack(subscriber, 1).await.expect("ack should succeed");

        store.reset("app", "sub").await.expect("reset should succeed");
        assert_eq!(store.durable_cursor("app", "sub"), None);

        // Resubscribing resolves start_from afresh and redelivers.
        let (tx2, mut rx2) = mpsc::channel(16);
        store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx2)
            .await
            .expect("resubscribe should succeed");
        expect_subscribed(&mut rx2).await;
        let events = expect_events(&mut rx2).await;
        assert_eq!(events[0].event_number, 1);
    }

    #[tokio::test]
    async fn stream_filter_limits_delivery() {
        let store = InMemoryEventStore::new();
        store
            .append("wanted", ExpectedVersion::Any, vec![proposed("A")])
            .await
            .expect("append should succeed");
        store
            .append("ignored", ExpectedVersion::Any, vec![proposed("B")])
            .await
            .expect("append should succeed");
        store
            .append("wanted", ExpectedVersion::Any, vec![proposed("C")])
            .await
            .expect("append should succeed");

        let (tx, mut rx) = mpsc::channel(16);
        store
            .subscribe(
                "app",
                "sub",
                StreamFilter::Stream("wanted".to_string()),
                StartFrom::Origin,
                tx,
            )
            .await
            .expect("subscribe should succeed");
        expect_subscribed(&mut rx).await;

        let events = expect_events(&mut rx).await;
        assert_eq!(
            events.iter().map(|e| e.event_number).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[tokio::test]
    async fn in_flight_window_limits_unacked_delivery() {
        let store = InMemoryEventStore::with_max_in_flight(2);
        store
            .append(
                "s-1",
                ExpectedVersion::Any,
                vec![proposed("A"), proposed("B"), proposed("C")],
            )
            .await
            .expect("append should succeed");

        let (tx, mut rx) = mpsc::channel(16);
        let subscriber = store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx)
            .await
            .expect("subscribe should succeed");
        expect_subscribed(&mut rx).await;

        let first = expect_events(&mut rx).await;
        assert_eq!(first.len(), 2, "delivery should stop at the window");

        store.ack(subscriber, 1).await.expect("ack should succeed");
        let second = expect_events(&mut rx).await;
        assert_eq!(second[0].event_number, 3);
    }

    #[tokio::test]
    async fn fail_subscribes_injects_errors_then_recovers() {
        let store = InMemoryEventStore::new();
        store.fail_subscribes(2);

        let (tx, mut rx) = mpsc::channel(16);
        for _ in 0..2 {
            let result = store
                .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx.clone())
                .await;
            assert!(
                matches!(result, Err(StoreError::SubscribeFailed(_))),
                "expected SubscribeFailed, got: {result:?}"
            );
        }

        store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx.clone())
            .await
            .expect("third subscribe should succeed");
        expect_subscribed(&mut rx).await;
        assert_eq!(store.subscribe_attempts(), 3);
    }

    #[tokio::test]
    async fn drop_subscriber_emits_down() {
        let store = InMemoryEventStore::new();
        let (tx, mut rx) = mpsc::channel(16);
        let subscriber = store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx)
            .await
            .expect("subscribe should succeed");
        expect_subscribed(&mut rx).await;

        store.drop_subscriber("app", "sub", "store shutting down").await;

        match next_notice(&mut rx).await {
            SubscriptionNotice::Down {
                subscriber: down_ref,
                reason,
            } => {
                assert_eq!(down_ref, subscriber);
                assert_eq!(reason, "store shutting down");
            }
            other => panic!("expected Down, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_subscriber() {
        let store = InMemoryEventStore::new();
        let (tx1, mut rx1) = mpsc::channel(16);
        let old = store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx1)
            .await
            .expect("first subscribe should succeed");
        expect_subscribed(&mut rx1).await;

        let (tx2, mut rx2) = mpsc::channel(16);
        store
            .subscribe("app", "sub", StreamFilter::All, StartFrom::Origin, tx2)
            .await
            .expect("second subscribe should succeed");
        expect_subscribed(&mut rx2).await;

        // The replaced subscriber can no longer ack.
        let result = store.ack(old, 1).await;
        assert!(
            matches!(result, Err(StoreError::UnknownSubscriber)),
            "expected UnknownSubscriber, got: {result:?}"
        );

        // New events flow only to the replacement.
        store
            .append("s-1", ExpectedVersion::Any, vec![proposed("A")])
            .await
            .expect("append should succeed");
        let events = expect_events(&mut rx2).await;
        assert_eq!(events[0].event_number, 1);
    }

    #[tokio::test]
    async fn read_stream_returns_only_that_stream() {
        let store = InMemoryEventStore::new();
        store
            .append("a", ExpectedVersion::Any, vec![proposed("A1")])
            .await
            .expect("append should succeed");
        store
            .append("b", ExpectedVersion::Any, vec![proposed("B1")])
            .await
            .expect("append should succeed");
        store
            .append("a", ExpectedVersion::Any, vec![proposed("A2")])
            .await
            .expect("append should succeed");

        let events = store
            .read_stream("a", 1)
            .await
            .expect("read_stream should succeed");
        assert_eq!(
            events.iter().map(|e| e.event_type.as_str()).collect::<Vec<_>>(),
            vec!["A1", "A2"]
        );
        assert_eq!(events[1].stream_version, 2);

        let from_two = store
            .read_stream("a", 2)
            .await
            .expect("read_stream should succeed");
        assert_eq!(from_two.len(), 1);
    }
}
