//! Error types for cachepilot-gateway.

use std::time::Duration;

use thiserror::Error;

use crate::security::{AuthRejection, RateLimitScope, ValidationError};

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or unsafe input. The message is safe to return verbatim.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Missing or invalid credential.
    #[error("{0}")]
    Auth(AuthRejection),

    /// Authenticated key lacks the required permission scope.
    #[error("permission denied: requires scope '{scope}'")]
    Forbidden { scope: String },

    /// Address- or key-scoped rate limit exhausted.
    #[error("{scope} rate limit exceeded, retry after {}s", retry_after.as_secs())]
    RateLimited {
        scope: RateLimitScope,
        retry_after: Duration,
    },

    /// Address is serving an escalation block.
    #[error("address temporarily blocked, retry after {}s", retry_after.as_secs())]
    AddressBlocked { retry_after: Duration },

    /// Requested resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Attempted use of a command outside the whitelist. This is a defect.
    #[error("command '{0}' is not allowed")]
    CommandNotAllowed(String),

    /// The privileged tool did not finish in time and was killed.
    #[error("command '{command}' timed out after {}s", timeout.as_secs())]
    SubprocessTimeout { command: String, timeout: Duration },

    /// The privileged tool exited with a non-zero status.
    #[error("command '{command}' failed with exit code {exit_code:?}")]
    SubprocessFailure {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The configured tool path is missing or not executable.
    #[error("CLI executable unavailable: {0}")]
    ToolUnavailable(String),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential store persistence failure.
    #[error("credential store error: {0}")]
    Credentials(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// Anything else that should never reach a caller verbatim.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::config::ConfigError> for GatewayError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl GatewayError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Auth(AuthRejection::MissingKey) => "missing_key",
            Self::Auth(AuthRejection::InvalidKey) => "invalid_key",
            Self::Forbidden { .. } => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::RateLimited {
                scope: RateLimitScope::Key,
                ..
            } => "key_rate_limited",
            Self::RateLimited { .. } => "too_many_requests",
            Self::AddressBlocked { .. } => "address_blocked",
            Self::SubprocessTimeout { .. } => "command_timeout",
            Self::SubprocessFailure { .. } => "command_failed",
            Self::CommandNotAllowed(_)
            | Self::ToolUnavailable(_)
            | Self::Config(_)
            | Self::Credentials(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::LockPoisoned
            | Self::Internal(_) => "internal_server_error",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::Forbidden { .. } => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited { .. } | Self::AddressBlocked { .. } => 429,
            Self::SubprocessFailure { .. } => 502,
            Self::SubprocessTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Whether the message may be returned to the caller as-is.
    ///
    /// Internal errors may carry paths or OS detail and are replaced by a
    /// generic message unless the server runs in debug mode. Subprocess
    /// failures never include stderr in their message.
    pub fn is_client_safe(&self) -> bool {
        self.status_code() < 500
            || matches!(
                self,
                Self::SubprocessTimeout { .. } | Self::SubprocessFailure { .. }
            )
    }

    /// Retry hint for rate-limit style rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::AddressBlocked { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }
}

impl From<AuthRejection> for GatewayError {
    fn from(rejection: AuthRejection) -> Self {
        Self::Auth(rejection)
    }
}

/// Convenience Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
