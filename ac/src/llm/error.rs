//! Invoker error types

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an [`super::LlmInvoker`]
///
/// Structured variants carry what the retry engine needs directly; the
/// classifier only falls back to message inspection for `Api` and `Other`.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Empty completion")]
    Empty,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl InvokeError {
    /// The provider-suggested delay, when one was parseable
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
