//! Runtime error surface

use thiserror::Error;

use crate::domain::ErrorKind;
use crate::ledger::{DenyReason, RuntimeSnapshot};

/// Errors surfaced by the delegation and workflow APIs
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("capacity wait timed out after {waited_ms}ms ({queued} queued)", queued = .snapshot.queued)]
    CapacityTimeout {
        waited_ms: u64,
        snapshot: Box<RuntimeSnapshot>,
    },

    #[error("evicted from admission queue ({evictions} total evictions)", evictions = .snapshot.queue_evictions)]
    CapacityEvicted { snapshot: Box<RuntimeSnapshot> },

    #[error("admission denied: {reasons:?}")]
    CapacityDenied {
        reasons: Vec<DenyReason>,
        snapshot: Box<RuntimeSnapshot>,
    },

    #[error("workflow {workflow_id} is owned by {instance_id} (pid {pid})")]
    WorkflowOwnedByOther {
        workflow_id: String,
        instance_id: String,
        pid: u32,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("validation failure: {0}")]
    Validation(String),

    #[error(transparent)]
    State(#[from] workstate::StateError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// The abstract failure kind this error surfaces as
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityTimeout { .. } | Self::CapacityEvicted { .. } | Self::CapacityDenied { .. } => {
                ErrorKind::CapacityUnavailable
            }
            Self::WorkflowOwnedByOther { .. } => ErrorKind::WorkflowOwnedByOther,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Validation(_) => ErrorKind::ValidationFailure,
            Self::State(_) | Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Process exit code for the CLI surface
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ValidationFailure => 65,
            ErrorKind::CapacityUnavailable => 73,
            ErrorKind::WorkflowOwnedByOther => 75,
            ErrorKind::Cancelled => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_exit_codes() {
        let err = RuntimeError::WorkflowOwnedByOther {
            workflow_id: "wf".to_string(),
            instance_id: "host:1:2".to_string(),
            pid: 1,
        };
        assert_eq!(err.kind(), ErrorKind::WorkflowOwnedByOther);
        assert_eq!(err.exit_code(), 75);

        assert_eq!(RuntimeError::Cancelled.exit_code(), 130);
        assert_eq!(RuntimeError::Validation("bad".to_string()).exit_code(), 65);
        assert_eq!(RuntimeError::Internal("boom".to_string()).exit_code(), 1);
    }
}
