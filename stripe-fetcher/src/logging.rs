//! Process-wide log verbosity.
//!
//! Connection parameters carry a `log_level` that adjusts how chatty the
//! fetcher is. The adjustment goes through [`LogControl`] so callers (and
//! tests) decide what "process-wide" means for them.

use parking_lot::Mutex;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LogLevel;

/// Target whose directive is rewritten by [`TracingLogControl`].
pub const LOG_TARGET: &str = "stripe_fetcher";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid filter directive: {0}")]
    InvalidDirective(String),

    #[error("Failed to reload log filter: {0}")]
    Reload(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Install(String)
}

/// Applies a log level. Implementations must be idempotent.
pub trait LogControl: Send + Sync {
    fn apply(&self, level: LogLevel) -> Result<(), LoggingError>;
}

/// Ignores level changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogControl;

impl LogControl for NoopLogControl {
    fn apply(&self, _level: LogLevel) -> Result<(), LoggingError> {
        Ok(())
    }
}

/// Rewrites the fetcher directive of a reloadable `EnvFilter`.
pub struct TracingLogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    base_directives: String,
    current: Mutex<Option<LogLevel>>
}

impl TracingLogControl {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>, base_directives: impl Into<String>) -> Self {
        Self {
            handle,
            base_directives: base_directives.into(),
            current: Mutex::new(None)
        }
    }

    /// Level most recently applied, if any.
    pub fn current(&self) -> Option<LogLevel> {
        *self.current.lock()
    }

    fn build_filter(&self, level: LogLevel) -> Result<EnvFilter, LoggingError> {
        let directive = format!("{LOG_TARGET}={}", filter_level(level));
        let directives = if self.base_directives.is_empty() {
            directive
        } else {
            format!("{},{directive}", self.base_directives)
        };

        EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidDirective(e.to_string()))
    }
}

impl LogControl for TracingLogControl {
    fn apply(&self, level: LogLevel) -> Result<(), LoggingError> {
        let mut current = self.current.lock();
        if *current == Some(level) {
            return Ok(());
        }

        let filter = self.build_filter(level)?;
        self.handle
            .reload(filter)
            .map_err(|e| LoggingError::Reload(e.to_string()))?;
        *current = Some(level);

        Ok(())
    }
}

fn filter_level(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        LogLevel::Error | LogLevel::Critical => "error"
    }
}

/// Installs the global subscriber with a reloadable filter.
///
/// Base directives come from `RUST_LOG` when set, otherwise `info`.
pub fn init_tracing(initial: LogLevel) -> Result<TracingLogControl, LoggingError> {
    let base = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_string());
    let initial_filter = EnvFilter::try_new(&base)
        .map_err(|e| LoggingError::InvalidDirective(e.to_string()))?;

    let (filter, handle) = reload::Layer::new(initial_filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    let control = TracingLogControl::new(handle, base);
    control.apply(initial)?;
    Ok(control)
}
