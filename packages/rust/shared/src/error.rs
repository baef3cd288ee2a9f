//! Error types for eventstream-router.
//!
//! Library crates use [`RouterError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all router operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to the event feed.
    #[error("network error: {0}")]
    Network(String),

    /// The event feed answered with "too many requests".
    #[error("rate limited by event feed")]
    RateLimited { retry_after: Option<Duration> },

    /// Wire payload or manifest parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A route failed to load, initialize, or process an event.
    #[error("route {route}: {message}")]
    Route { route: String, message: String },

    /// Checkpoint store read/write error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Contract validation error (invalid route, bad locator, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Failure that escapes the connector/dispatcher pipeline.
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a route-scoped error.
    pub fn route(route: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Route {
            route: route.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");

        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn error_display_formatting() {
        let err = RouterError::config("missing stream url");
        assert_eq!(err.to_string(), "config error: missing stream url");

        let err = RouterError::route("afd-watch", "worker timed out");
        assert_eq!(err.to_string(), "route afd-watch: worker timed out");

        let err = RouterError::RateLimited { retry_after: None };
        assert!(err.to_string().contains("rate limited"));
    }
}
