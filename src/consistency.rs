//! Process-wide registry of live handlers and their acked offsets.
//!
//! Command dispatch uses this registry to block until designated
//! strongly-consistent handlers have caught up past the final event number
//! a command produced. Handlers register on start and ack after every
//! confirmed event; registration is tied to agent lifetime through a
//! drop-guard, so a dead agent (including an aborted task) unregisters
//! itself and wakes any waiters, which then treat it as unsatisfied until
//! it comes back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Consistency;

/// Key identifying a registration: `(application, handler_name)`.
type RegistrationKey = (String, String);

/// A live handler's registry record.
#[derive(Debug, Clone)]
struct Registration {
    handler_module: String,
    agent_id: Uuid,
    consistency: Consistency,
    last_acked: Option<u64>,
}

/// Errors from registry registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Another live handler already holds this name in this application.
    #[error("handler \"{name}\" is already registered for application \"{application}\"")]
    AlreadyRegistered {
        /// Application the duplicate belongs to.
        application: String,
        /// The conflicting handler name.
        name: String,
    },
}

/// Returned by [`ConsistencyRegistry::wait_for`] when the timeout elapses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timed out waiting for handlers to catch up: {pending:?}")]
pub struct ConsistencyTimeout {
    /// Handlers that had not satisfied the target when time ran out.
    pub pending: Vec<String>,
}

/// Shared index of live handlers, keyed by `(application, handler_name)`.
///
/// Offsets advance monotonically; acks from strongly-consistent handlers
/// wake any [`wait_for`](ConsistencyRegistry::wait_for) callers whose
/// target is now satisfied. Clone is cheap; all clones share one index.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    map: Mutex<HashMap<RegistrationKey, Registration>>,
    changed: Notify,
}

impl ConsistencyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RegistrationKey, Registration>> {
        self.inner
            .map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a live handler agent.
    ///
    /// The returned guard unregisters the handler when dropped, which the
    /// agent task does on every exit path. A second live registration for
    /// the same `(application, handler_name)` is rejected.
    pub fn register(
        &self,
        application: &str,
        handler_name: &str,
        handler_module: &str,
        agent_id: Uuid,
        consistency: Consistency,
    ) -> Result<RegistrationGuard, RegistryError> {
        let key = (application.to_string(), handler_name.to_string());
        {
            let mut map = self.lock();
            if map.contains_key(&key) {
                return Err(RegistryError::AlreadyRegistered {
                    application: application.to_string(),
                    name: handler_name.to_string(),
                });
            }
            map.insert(
                key.clone(),
                Registration {
                    handler_module: handler_module.to_string(),
                    agent_id,
                    consistency,
                    last_acked: None,
                },
            );
        }
        self.inner.changed.notify_waiters();
        tracing::debug!(
            application,
            handler = handler_name,
            module = handler_module,
            consistency = %consistency,
            "handler registered"
        );
        Ok(RegistrationGuard {
            registry: self.clone(),
            key,
            agent_id,
        })
    }

    /// Record that a handler has acked `event_number`.
    ///
    /// Offsets only move forward; a smaller ack is kept at the current
    /// maximum. Waiters are notified only for `strong` acks, since
    /// `eventual` handlers are never waited on.
    pub fn ack(
        &self,
        application: &str,
        handler_name: &str,
        consistency: Consistency,
        event_number: u64,
    ) {
        let key = (application.to_string(), handler_name.to_string());
        let updated = {
            let mut map = self.lock();
            match map.get_mut(&key) {
                Some(registration) => {
                    let next = registration.last_acked.unwrap_or(0).max(event_number);
                    registration.last_acked = Some(next);
                    true
                }
                None => false,
            }
        };
        if !updated {
            tracing::debug!(
                application,
                handler = handler_name,
                event_number,
                "ack for unregistered handler ignored"
            );
            return;
        }
        if consistency == Consistency::Strong {
            self.inner.changed.notify_waiters();
        }
    }

    /// The latest acked offset for a handler, if registered.
    pub fn last_acked(&self, application: &str, handler_name: &str) -> Option<u64> {
        let key = (application.to_string(), handler_name.to_string());
        self.lock().get(&key).and_then(|r| r.last_acked)
    }

    /// Names of strongly-consistent handlers currently registered for
    /// `application`, sorted for determinism.
    pub fn list_strong(&self, application: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|((app, _), registration)| {
                app == application && registration.consistency == Consistency::Strong
            })
            .map(|((_, name), _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Block until every handler in `handler_names` has acked an offset
    /// `>= target_event_number`, or `timeout` elapses.
    ///
    /// A handler counts as satisfied only while it is registered with
    /// `strong` consistency and caught up; handlers that are missing
    /// (crashed, not yet restarted) or registered `eventual` stay pending
    /// until the timeout fires.
    ///
    /// # Errors
    ///
    /// [`ConsistencyTimeout`] naming the handlers still pending.
    pub async fn wait_for(
        &self,
        application: &str,
        handler_names: &[String],
        target_event_number: u64,
        timeout: Duration,
    ) -> Result<(), ConsistencyTimeout> {
        if handler_names.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            // Enable the wakeup listener before checking so an ack between
            // the check and the await is not lost.
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let pending = self.pending(application, handler_names, target_event_number);
            if pending.is_empty() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ConsistencyTimeout { pending });
            }
        }
    }

    fn pending(&self, application: &str, handler_names: &[String], target: u64) -> Vec<String> {
        let map = self.lock();
        handler_names
            .iter()
            .filter(|name| {
                let key = (application.to_string(), (*name).clone());
                match map.get(&key) {
                    Some(registration) => {
                        registration.consistency != Consistency::Strong
                            || registration.last_acked.unwrap_or(0) < target
                    }
                    None => true,
                }
            })
            .cloned()
            .collect()
    }

    fn unregister(&self, key: &RegistrationKey, agent_id: Uuid) {
        let removed = {
            let mut map = self.lock();
            // Only remove the entry if it still belongs to this agent; a
            // restarted handler may have re-registered under the same key.
            match map.get(key) {
                Some(registration) if registration.agent_id == agent_id => {
                    map.remove(key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::debug!(
                application = %key.0,
                handler = %key.1,
                "handler unregistered"
            );
            self.inner.changed.notify_waiters();
        }
    }
}

/// Unregisters a handler when dropped.
///
/// Owned by the handler agent task, so any exit path, including an aborted
/// task, removes the registration and wakes waiters.
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: ConsistencyRegistry,
    key: RegistrationKey,
    agent_id: Uuid,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.key, self.agent_id);
    }
}
