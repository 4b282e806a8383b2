//! The application binding shared by handlers and command dispatch.
//!
//! An [`Application`] carries the process-wide collaborators a handler
//! needs: the event store, the consistency registry, the upcaster, and the
//! injected defaults (consistency mode, backoff schedule). It is cheap to
//! clone; all state lives behind `Arc`s.

use std::sync::Arc;

use crate::config::{ConfigError, Consistency};
use crate::consistency::ConsistencyRegistry;
use crate::store::EventStore;
use crate::subscription::BackoffConfig;
use crate::upcaster::{NoopUpcaster, Upcaster};

/// A named application: the binding between an event store, its handlers,
/// and its command dispatch.
#[derive(Clone)]
pub struct Application {
    inner: Arc<AppInner>,
}

struct AppInner {
    name: String,
    store: Arc<dyn EventStore>,
    registry: ConsistencyRegistry,
    upcaster: Arc<dyn Upcaster>,
    default_consistency: Consistency,
    backoff: BackoffConfig,
}

impl Application {
    /// Start building an application with the given name.
    pub fn builder(name: impl Into<String>) -> ApplicationBuilder {
        ApplicationBuilder {
            name: name.into(),
            store: None,
            registry: None,
            upcaster: None,
            default_consistency: Consistency::Eventual,
            backoff: BackoffConfig::default(),
        }
    }

    /// The application name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The event store this application reads from and appends to.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// The consistency registry coordinating handlers and dispatch.
    pub fn registry(&self) -> &ConsistencyRegistry {
        &self.inner.registry
    }

    /// The schema upcaster applied to every delivered event.
    pub fn upcaster(&self) -> &Arc<dyn Upcaster> {
        &self.inner.upcaster
    }

    /// The consistency mode handlers fall back to when they declare none.
    pub fn default_consistency(&self) -> Consistency {
        self.inner.default_consistency
    }

    /// The resubscribe backoff schedule handlers run with.
    pub fn backoff_config(&self) -> &BackoffConfig {
        &self.inner.backoff
    }
}

/// Builder for [`Application`]. The event store is the only required piece.
pub struct ApplicationBuilder {
    name: String,
    store: Option<Arc<dyn EventStore>>,
    registry: Option<ConsistencyRegistry>,
    upcaster: Option<Arc<dyn Upcaster>>,
    default_consistency: Consistency,
    backoff: BackoffConfig,
}

impl ApplicationBuilder {
    /// Set the event store.
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing consistency registry (e.g. across applications in
    /// one process). A fresh one is created otherwise.
    pub fn registry(mut self, registry: ConsistencyRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the schema upcaster. Defaults to the identity transform.
    pub fn upcaster(mut self, upcaster: Arc<dyn Upcaster>) -> Self {
        self.upcaster = Some(upcaster);
        self
    }

    /// Set the consistency mode handlers default to. Defaults to
    /// [`Consistency::Eventual`].
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.default_consistency = consistency;
        self
    }

    /// Tune the resubscribe backoff schedule.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build the application.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingStore`] if no event store was provided.
    pub fn build(self) -> Result<Application, ConfigError> {
        let store = self.store.ok_or(ConfigError::MissingStore)?;
        Ok(Application {
            inner: Arc::new(AppInner {
                name: self.name,
                store,
                registry: self.registry.unwrap_or_default(),
                upcaster: self.upcaster.unwrap_or_else(|| Arc::new(NoopUpcaster)),
                default_consistency: self.default_consistency,
                backoff: self.backoff,
            }),
        })
    }
}
