//! Client-side state of a single durable subscription.
//!
//! A [`Subscription`] wraps one named durable subscription on the event
//! store: it is constructed detached, transitions to subscribed on a
//! successful [`subscribe`](Subscription::subscribe), and can be
//! [`reset`](Subscription::reset) back to detached while discarding the
//! store-side cursor. It also owns the reconnect backoff schedule used
//! between failed subscribe attempts.

use std::time::Duration;

use rand::Rng;

use crate::event::RecordedEvent;
use crate::store::{
    EventStore, StartFrom, StoreError, StreamFilter, SubscriberRef, SubscriptionMailbox,
};

/// Tuning for the resubscribe backoff schedule.
///
/// Delays start at `base`, double on every consecutive failure, and are
/// capped at `max`. Each delay gets up to `jitter` (a fraction of itself)
/// of random slack so a fleet of handlers does not reconnect in lockstep.
/// A successful subscribe resets the schedule to `base`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First retry delay. Default: 1 second.
    pub base: Duration,
    /// Upper bound for the doubling schedule. Default: 60 seconds.
    pub max: Duration,
    /// Maximum added jitter as a fraction of the delay. Default: 0.1.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

/// Bounded exponential backoff state.
#[derive(Debug, Clone)]
struct Backoff {
    config: BackoffConfig,
    next_delay: Duration,
}

impl Backoff {
    fn new(config: BackoffConfig) -> Self {
        let next_delay = config.base;
        Self { config, next_delay }
    }

    /// Returns the next delay and advances the schedule.
    fn next(&mut self) -> Duration {
        let raw = self.next_delay;
        self.next_delay = (raw * 2).min(self.config.max);
        let jitter = if self.config.jitter > 0.0 {
            raw.mul_f64(rand::rng().random_range(0.0..self.config.jitter))
        } else {
            Duration::ZERO
        };
        raw + jitter
    }

    fn reset(&mut self) {
        self.next_delay = self.config.base;
    }
}

/// Stateful handle over one named durable subscription.
///
/// Owned exclusively by a single handler agent; no I/O happens at
/// construction time.
#[derive(Debug)]
pub struct Subscription {
    application: String,
    name: String,
    start_from: StartFrom,
    filter: StreamFilter,
    subscriber: Option<SubscriberRef>,
    backoff: Backoff,
}

impl Subscription {
    /// Construct a detached subscription. No I/O.
    pub fn new(
        application: impl Into<String>,
        name: impl Into<String>,
        start_from: StartFrom,
        filter: StreamFilter,
    ) -> Self {
        Self::with_backoff(application, name, start_from, filter, BackoffConfig::default())
    }

    /// Construct a detached subscription with a custom backoff schedule.
    pub fn with_backoff(
        application: impl Into<String>,
        name: impl Into<String>,
        start_from: StartFrom,
        filter: StreamFilter,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            application: application.into(),
            name: name.into(),
            start_from,
            filter,
            subscriber: None,
            backoff: Backoff::new(backoff),
        }
    }

    /// The durable subscription name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The live subscriber ref, if currently subscribed.
    pub fn subscriber(&self) -> Option<SubscriberRef> {
        self.subscriber
    }

    /// Register with the store as the named durable subscriber.
    ///
    /// `start_from` is only consulted by the store when it has no cursor
    /// for this subscription name. On success the handle records the live
    /// subscriber ref and the backoff schedule resets to its base delay.
    ///
    /// # Errors
    ///
    /// Returns the store's failure value; the handle stays detached and the
    /// next [`next_backoff`](Subscription::next_backoff) delay applies.
    pub async fn subscribe(
        &mut self,
        store: &dyn EventStore,
        mailbox: &SubscriptionMailbox,
    ) -> Result<SubscriberRef, StoreError> {
        let subscriber = store
            .subscribe(
                &self.application,
                &self.name,
                self.filter.clone(),
                self.start_from,
                mailbox.clone(),
            )
            .await?;
        self.subscriber = Some(subscriber);
        self.backoff.reset();
        Ok(subscriber)
    }

    /// Confirm receipt of `event`, letting the store advance the durable
    /// cursor and deliver further events.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownSubscriber`] when detached or when the
    /// store has since replaced this subscriber.
    pub async fn ack(
        &self,
        store: &dyn EventStore,
        event: &RecordedEvent,
    ) -> Result<(), StoreError> {
        let subscriber = self.subscriber.ok_or(StoreError::UnknownSubscriber)?;
        store.ack(subscriber, event.event_number).await
    }

    /// Discard the store-side cursor and detach.
    ///
    /// The next [`subscribe`](Subscription::subscribe) resolves its starting
    /// position from `start_from` again.
    pub async fn reset(&mut self, store: &dyn EventStore) -> Result<(), StoreError> {
        store.reset(&self.application, &self.name).await?;
        self.subscriber = None;
        Ok(())
    }

    /// The next reconnect delay; advances the backoff schedule.
    pub fn next_backoff(&mut self) -> Duration {
        self.backoff.next()
    }
}
