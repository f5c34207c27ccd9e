//! Per-call options for the delegation API

use tokio_util::sync::CancellationToken;

use super::{Priority, QueueClass};

/// Options accepted by every delegation entry point
///
/// Team-level fields (`parallelism`, `member_parallelism`,
/// `communication_rounds`, `max_retry_rounds`) are ignored by single
/// sub-agent calls. Negative parallelism values are normalized to 1 at the
/// point of use; zero means "run nothing".
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Workflow this call belongs to; ownership is enforced when set
    pub workflow_id: Option<String>,

    /// Scheduling priority
    pub priority: Priority,

    /// Admission class
    pub queue_class: QueueClass,

    /// Identity used for queue fair-sharing; defaults to the tool name
    pub tenant_key: Option<String>,

    /// Max time to wait for capacity; `None` uses the configured default
    pub capacity_wait_ms: Option<u64>,

    /// Cancellation signal; a child token is derived per work unit
    pub cancel: Option<CancellationToken>,

    /// Team-level parallelism (how many teams at once)
    pub parallelism: Option<i64>,

    /// Member-level parallelism within one team
    pub member_parallelism: Option<i64>,

    /// Communication rounds between the initial phase and the judge
    pub communication_rounds: Option<u32>,

    /// Retries of degraded outputs within a communication round
    pub max_retry_rounds: Option<u32>,
}

impl RunOptions {
    /// The cancel token for this call, or a fresh never-cancelled one
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone().unwrap_or_default()
    }

    /// Normalize a requested parallelism: negatives become 1, zero stays 0
    pub fn normalize_parallelism(requested: i64) -> usize {
        if requested < 0 { 1 } else { requested as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_parallelism() {
        assert_eq!(RunOptions::normalize_parallelism(-5), 1);
        assert_eq!(RunOptions::normalize_parallelism(-1), 1);
        assert_eq!(RunOptions::normalize_parallelism(0), 0);
        assert_eq!(RunOptions::normalize_parallelism(1), 1);
        assert_eq!(RunOptions::normalize_parallelism(8), 8);
    }

    #[test]
    fn test_default_cancel_token_is_live() {
        let opts = RunOptions::default();
        assert!(!opts.cancel_token().is_cancelled());
    }

    #[test]
    fn test_supplied_cancel_token_is_used() {
        let token = CancellationToken::new();
        token.cancel();
        let opts = RunOptions {
            cancel: Some(token),
            ..Default::default()
        };
        assert!(opts.cancel_token().is_cancelled());
    }
}
