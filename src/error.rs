//! Crate-level error types shared across the runtime.

use crate::config::ConfigError;
use crate::consistency::RegistryError;
use crate::store::StoreError;

/// Error returned when a handler cannot be started.
///
/// Both variants surface before the agent task is spawned; a handler that
/// fails to start never touches the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// The option bag, declared defaults, or `init_config` hook produced an
    /// invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another live handler already holds this name in this application.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a handler agent terminated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExitReason {
    /// Orderly shutdown: a stop request, or every control handle dropped.
    #[error("handler shut down")]
    Shutdown,

    /// A user callback asked the runtime to stop.
    #[error("handler stopped: {0}")]
    Stopped(String),

    /// The store-side subscriber terminated.
    #[error("subscription terminated: {0}")]
    SubscriptionDown(String),

    /// An event store operation failed irrecoverably.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// The handler agent behind a handle has already terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event handler is no longer running")]
pub struct HandlerGone;
