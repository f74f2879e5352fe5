//! Error types for TenderScout.
//!
//! Library crates use [`TenderScoutError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all TenderScout operations.
#[derive(Debug, thiserror::Error)]
pub enum TenderScoutError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Structured output or HTML could not be parsed.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A completion, search, or knowledge provider failed.
    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    /// The marketplace portal blocked the scraper. Fatal for the current item.
    #[error("blocked by portal: {0}")]
    Blocked(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invalid input, bad state).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The surrounding job was aborted before the item started.
    #[error("job cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TenderScoutError>;

impl TenderScoutError {
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

    /// Create a provider error tagged with the provider name.
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
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

    /// Whether this error must abort the current item instead of being
    /// absorbed by a stage fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = TenderScoutError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = TenderScoutError::provider("openrouter", "HTTP 429");
        assert_eq!(err.to_string(), "provider error (openrouter): HTTP 429");
    }

    #[test]
    fn only_blocked_is_fatal() {
        assert!(TenderScoutError::Blocked("captcha".into()).is_fatal());
        assert!(!TenderScoutError::Network("timeout".into()).is_fatal());
        assert!(!TenderScoutError::parse("no json").is_fatal());
        assert!(!TenderScoutError::Cancelled.is_fatal());
    }
}
