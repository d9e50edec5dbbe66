//! Gateway error types.
//!
//! # Error Handling Philosophy
//!
//! Errors should be:
//! 1. **Actionable**: carry the HTTP status and raw body so a caller can diagnose
//! 2. **Specific**: distinguish a rejected schema from a rejected credential
//! 3. **Recoverable**: transient errors (rate limits, network) are retried
//!    locally up to a bound; structural errors surface immediately
//!
//! A failure is always a normal error value. One provider's failure carries no
//! shared state, so it can never affect adapters for other providers.

use std::time::Duration;
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur in gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or missing credential (HTTP 401/403).
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Rate limited or out of credit (HTTP 429/402). Retryable.
    #[error("Rate limited (HTTP {status}): {message}")]
    RateLimited {
        status: u16,
        /// Server-requested wait from a `Retry-After` header, if present.
        retry_after: Option<Duration>,
        message: String,
    },

    /// Request schema rejected by the provider (HTTP 400).
    #[error("Bad request (HTTP {status}): {message}")]
    BadRequest { status: u16, message: String },

    /// A 200 response missing the fields we expect.
    #[error("Invalid response shape: {0}")]
    InvalidResponseShape(String),

    /// The caller's tool executor failed. Always propagated.
    #[error("Tool execution failed for '{name}': {message}")]
    ToolExecution { name: String, message: String },

    /// Fatal stream transport failure. Malformed individual SSE lines are
    /// logged and skipped, never raised.
    #[error("Stream decode error: {0}")]
    StreamDecode(String),

    /// Missing key, unknown service id, or other configuration problem.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error.
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout error.
    #[error("Request timed out")]
    Timeout,

    /// Feature not supported by this provider.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Other 4xx/5xx response, carrying status and raw body text.
    #[error("API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_connect() {
            GatewayError::Network(format!("Connection failed: {}", err))
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

impl GatewayError {
    /// Map an HTTP error status and body text to the matching variant.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => GatewayError::Auth(body),
            402 | 429 => GatewayError::RateLimited {
                status,
                retry_after,
                message: body,
            },
            400 => GatewayError::BadRequest {
                status,
                message: body,
            },
            _ => GatewayError::Api { status, body },
        }
    }

    /// Whether the local retry policy may re-issue the request.
    ///
    /// Only rate-limit/credit responses and transient transport failures
    /// qualify; schema and credential errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. } | GatewayError::Network(_) | GatewayError::Timeout
        )
    }

    /// Server-requested retry delay, when the response carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this is a 400 whose body indicates the model rejects the
    /// system role, which triggers the one-shot system-to-user rewrite.
    pub fn is_system_role_rejection(&self) -> bool {
        match self {
            GatewayError::BadRequest { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("system")
                    && (lower.contains("role")
                        || lower.contains("not supported")
                        || lower.contains("unsupported")
                        || lower.contains("does not support"))
            }
            _ => false,
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::RateLimited { status, .. }
            | GatewayError::BadRequest { status, .. }
            | GatewayError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
