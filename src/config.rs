//! Handler configuration: names, options, and the resolver.
//!
//! Options flow in three layers: the handler's declared defaults
//! ([`EventHandler::default_options`]), runtime overrides merged on top,
//! and the user `init_config` hook which sees the merged bag before
//! validation. [`resolve`] enforces the final invariants and yields the
//! concrete configuration the runtime runs with.
//!
//! [`EventHandler::default_options`]: crate::handler::EventHandler::default_options

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::application::Application;
use crate::handler::EventHandler;
use crate::store::{StartFrom, StreamFilter};

/// Whether command dispatch blocks on this handler catching up to the
/// command's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Dispatch never waits for this handler.
    #[default]
    Eventual,
    /// Dispatch may block until this handler has acked past the command's
    /// final event number.
    Strong,
}

impl FromStr for Consistency {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eventual" => Ok(Self::Eventual),
            "strong" => Ok(Self::Strong),
            other => Err(ConfigError::InvalidOption {
                option: "consistency".to_string(),
                message: format!("expected \"eventual\" or \"strong\", got \"{other}\""),
            }),
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eventual => f.write_str("eventual"),
            Self::Strong => f.write_str("strong"),
        }
    }
}

/// A validated handler name.
///
/// The name doubles as the durable subscription name, so it must be stable
/// across restarts: renaming a handler creates a new subscription and
/// replays history from its configured start position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerName(String);

impl HandlerName {
    /// Validate a plain string name. Must be non-empty after trimming.
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        Ok(Self(name))
    }

    /// Deterministically stringify a structured identifier by joining its
    /// segments with `.` (e.g. `["billing", "invoices"]` becomes
    /// `"billing.invoices"`).
    pub fn scoped<I, S>(segments: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(".");
        Self::new(joined)
    }

    /// The normalized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised while resolving handler or application configuration.
///
/// All of these surface at construction time; a misconfigured handler never
/// reaches agent start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No handler name was declared or supplied.
    #[error("handler name is required")]
    MissingName,

    /// The name normalized to an empty string.
    #[error("handler name must be non-empty")]
    EmptyName,

    /// An option key the runtime does not recognize.
    #[error("unrecognized handler option: {0}")]
    UnknownOption(String),

    /// An option value of the wrong shape.
    #[error("invalid value for option \"{option}\": {message}")]
    InvalidOption {
        /// Which option was malformed.
        option: String,
        /// What was wrong with it.
        message: String,
    },

    /// An application was built without an event store.
    #[error("application requires an event store")]
    MissingStore,

    /// The user `init_config` hook rejected the configuration.
    #[error("configuration rejected: {0}")]
    Rejected(String),
}

/// A handler's declared options before resolution.
///
/// Every field is optional so declared defaults and runtime overrides can
/// be merged field-by-field; unset fields fall back to `Origin` / `All` /
/// the application's default consistency during [`resolve`].
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Handler name (doubles as the durable subscription name).
    pub name: Option<HandlerName>,
    /// Where delivery starts when the store holds no cursor yet.
    pub start_from: Option<StartFrom>,
    /// Which streams to subscribe to.
    pub subscribe_to: Option<StreamFilter>,
    /// Consistency mode for command-dispatch coordination.
    pub consistency: Option<Consistency>,
}

impl HandlerOptions {
    /// Set the handler name.
    pub fn named(mut self, name: HandlerName) -> Self {
        self.name = Some(name);
        self
    }

    /// Set the start position.
    pub fn start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = Some(start_from);
        self
    }

    /// Set the stream filter.
    pub fn subscribe_to(mut self, filter: StreamFilter) -> Self {
        self.subscribe_to = Some(filter);
        self
    }

    /// Set the consistency mode.
    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    /// Overlay `overrides` on top of these options; set fields in
    /// `overrides` win.
    pub fn merge(self, overrides: HandlerOptions) -> Self {
        Self {
            name: overrides.name.or(self.name),
            start_from: overrides.start_from.or(self.start_from),
            subscribe_to: overrides.subscribe_to.or(self.subscribe_to),
            consistency: overrides.consistency.or(self.consistency),
        }
    }

    /// Parse an untyped option bag, rejecting unknown keys.
    ///
    /// Recognized keys: `name` (string, or array of strings joined
    /// deterministically), `start_from` (`"origin"`, `"current"`, or a
    /// non-negative integer), `subscribe_to` (`"all"` or a stream id), and
    /// `consistency` (`"eventual"` or `"strong"`).
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownOption`] for an unrecognized key,
    /// [`ConfigError::InvalidOption`] for a malformed value.
    pub fn from_map(map: HashMap<String, Value>) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "name" => options.name = Some(parse_name(&value)?),
                "start_from" => options.start_from = Some(parse_start_from(&value)?),
                "subscribe_to" => options.subscribe_to = Some(parse_subscribe_to(&value)?),
                "consistency" => {
                    let text = value.as_str().ok_or_else(|| ConfigError::InvalidOption {
                        option: "consistency".to_string(),
                        message: format!("expected a string, got {value}"),
                    })?;
                    options.consistency = Some(text.parse()?);
                }
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
        }
        Ok(options)
    }
}

fn parse_name(value: &Value) -> Result<HandlerName, ConfigError> {
    match value {
        Value::String(s) => HandlerName::new(s.clone()),
        Value::Array(parts) => {
            let segments: Vec<&str> = parts
                .iter()
                .map(|part| {
                    part.as_str().ok_or_else(|| ConfigError::InvalidOption {
                        option: "name".to_string(),
                        message: format!("name segments must be strings, got {part}"),
                    })
                })
                .collect::<Result<_, _>>()?;
            HandlerName::scoped(segments)
        }
        other => Err(ConfigError::InvalidOption {
            option: "name".to_string(),
            message: format!("expected a string or array of strings, got {other}"),
        }),
    }
}

fn parse_start_from(value: &Value) -> Result<StartFrom, ConfigError> {
    match value {
        Value::String(s) if s == "origin" => Ok(StartFrom::Origin),
        Value::String(s) if s == "current" => Ok(StartFrom::Current),
        Value::Number(n) => n
            .as_u64()
            .map(StartFrom::Exact)
            .ok_or_else(|| ConfigError::InvalidOption {
                option: "start_from".to_string(),
                message: format!("expected a non-negative integer, got {n}"),
            }),
        other => Err(ConfigError::InvalidOption {
            option: "start_from".to_string(),
            message: format!("expected \"origin\", \"current\", or an event number, got {other}"),
        }),
    }
}

fn parse_subscribe_to(value: &Value) -> Result<StreamFilter, ConfigError> {
    match value {
        Value::String(s) if s == "all" => Ok(StreamFilter::All),
        Value::String(s) => Ok(StreamFilter::Stream(s.clone())),
        other => Err(ConfigError::InvalidOption {
            option: "subscribe_to".to_string(),
            message: format!("expected \"all\" or a stream id, got {other}"),
        }),
    }
}

/// The fully validated configuration a handler agent runs with.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Name of the application the handler is bound to.
    pub application: String,
    /// Validated handler name.
    pub name: HandlerName,
    /// Resolved start position.
    pub start_from: StartFrom,
    /// Resolved stream filter.
    pub subscribe_to: StreamFilter,
    /// Resolved consistency mode.
    pub consistency: Consistency,
}

/// Merge declared defaults with `overrides`, run the handler's
/// `init_config` hook, and validate.
///
/// # Errors
///
/// Any [`ConfigError`] from the hook or from validation; construction
/// fails fast and no agent is spawned.
pub fn resolve<H>(
    application: &Application,
    handler: &H,
    overrides: HandlerOptions,
) -> Result<ResolvedConfig, ConfigError>
where
    H: EventHandler + ?Sized,
{
    let merged = handler.default_options().merge(overrides);
    let options = handler.init_config(merged)?;
    let name = options.name.ok_or(ConfigError::MissingName)?;
    Ok(ResolvedConfig {
        application: application.name().to_string(),
        name,
        start_from: options.start_from.unwrap_or(StartFrom::Origin),
        subscribe_to: options.subscribe_to.unwrap_or(StreamFilter::All),
        consistency: options
            .consistency
            .unwrap_or_else(|| application.default_consistency()),
    })
}
