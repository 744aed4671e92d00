//! Provider Error Types
//!
//! Design Decision: Dedicated error types for the provider bridge
//!
//! Rationale: Providers have failure modes of their own (a child that never
//! acknowledges the handshake, a frame that does not parse, a remote service
//! that refuses the token) which the registry folds into a capability failure
//! for the calling step. Keeping them separate from `MasterpieceError` lets
//! the bridge decide which ones degrade the provider.
//!
//! Error Handling Strategy:
//! - StartupFailed: provider left `degraded`, child terminated
//! - Unavailable: fail fast, no round-trip attempted
//! - Protocol: provider degraded and child terminated (framing is lost)
//! - Execution: the remote capability reported a failure; provider stays ready

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Spawn failed, the handshake timed out, or the child exited early
    #[error("Provider '{provider}' failed to start: {reason}")]
    StartupFailed { provider: String, reason: String },

    /// Provider is not ready (never started, degraded, stopped, unreachable)
    #[error("Provider '{provider}' unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    /// Malformed, mismatched or missing response frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The capability ran on the provider and reported a failure
    ///
    /// For HTTP providers this is a non-2xx response with its payload.
    #[error("Provider '{provider}' execution error: {message}")]
    Execution { provider: String, message: String },

    /// Configuration file or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    pub(crate) fn unavailable(provider: &str, reason: impl Into<String>) -> Self {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn startup(provider: &str, reason: impl Into<String>) -> Self {
        ProviderError::StartupFailed {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with ProviderError
pub type Result<T> = std::result::Result<T, ProviderError>;
