//! Task outcomes and the error taxonomy

use serde::{Deserialize, Serialize};

/// Abstract failure kind, carried on outcomes and driving retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Timeout,
    EmptyOutput,
    TransientUnavailable,
    ValidationFailure,
    CapacityUnavailable,
    WorkflowOwnedByOther,
    Cancelled,
    InternalError,
}

impl ErrorKind {
    /// Whether the retry engine may attempt this kind again
    pub fn is_retryable(self) -> bool {
        match self {
            Self::RateLimited | Self::Timeout | Self::EmptyOutput | Self::TransientUnavailable => true,
            Self::ValidationFailure
            | Self::CapacityUnavailable
            | Self::WorkflowOwnedByOther
            | Self::Cancelled
            | Self::InternalError => false,
        }
    }

    /// Rate-limited errors draw from their own, larger retry budget
    pub fn uses_rate_limit_budget(self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::EmptyOutput => "empty_output",
            Self::TransientUnavailable => "transient_unavailable",
            Self::ValidationFailure => "validation_failure",
            Self::CapacityUnavailable => "capacity_unavailable",
            Self::WorkflowOwnedByOther => "workflow_owned_by_other",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Final disposition of one delegated work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure(ErrorKind),
    Partial(ErrorKind),
    Cancelled,
    TimedOut,
}

impl TaskOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// The failure kind, if the outcome carries one
    pub fn kind(self) -> Option<ErrorKind> {
        match self {
            Self::Failure(k) | Self::Partial(k) => Some(k),
            Self::Cancelled => Some(ErrorKind::Cancelled),
            Self::TimedOut => Some(ErrorKind::Timeout),
            Self::Success => None,
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(k) => write!(f, "failure({})", k),
            Self::Partial(k) => write!(f, "partial({})", k),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}
