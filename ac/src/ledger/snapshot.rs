//! Observable runtime state

use serde::Serialize;
use uuid::Uuid;

use crate::config::RuntimeLimits;

/// Why an admission attempt was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Request slots exhausted
    RequestsExhausted,
    /// LLM call slots exhausted
    LlmExhausted,
    /// The learned per-model concurrency cap is full
    ModelConcurrency,
    /// The independent orchestration cap is full
    OrchestrationsExhausted,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequestsExhausted => "requests_exhausted",
            Self::LlmExhausted => "llm_exhausted",
            Self::ModelConcurrency => "model_concurrency",
            Self::OrchestrationsExhausted => "orchestrations_exhausted",
        };
        write!(f, "{}", s)
    }
}

/// Consumed capacity broken down by caller category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActiveCounts {
    pub subagent_requests: u32,
    pub subagent_agents: u32,
    pub team_runs: u32,
    pub team_members: u32,
}

/// One reservation as seen by observers
#[derive(Debug, Clone, Serialize)]
pub struct ReservationView {
    pub id: Uuid,
    pub tool_name: String,
    pub additional_requests: u32,
    pub additional_llm: u32,
    pub created_at_ms: u64,
    pub heartbeat_at_ms: u64,
    pub expires_at_ms: u64,
    pub consumed: bool,
}

/// Point-in-time view of the whole ledger
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub active_requests: u32,
    pub active_llm: u32,
    pub reserved_requests: u32,
    pub reserved_llm: u32,
    pub active: ActiveCounts,
    pub reservations: Vec<ReservationView>,
    pub active_orchestrations: u32,
    pub queued: usize,
    pub queued_tools: Vec<String>,
    pub queue_evictions: u64,
    pub limits: RuntimeLimits,
}

impl RuntimeSnapshot {
    /// Free request slots at the instant of the snapshot
    pub fn free_requests(&self) -> u32 {
        self.limits
            .max_total_active_requests
            .saturating_sub(self.active_requests + self.reserved_requests)
    }

    /// Free LLM slots at the instant of the snapshot
    pub fn free_llm(&self) -> u32 {
        self.limits
            .max_total_active_llm
            .saturating_sub(self.active_llm + self.reserved_llm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> RuntimeSnapshot {
        RuntimeSnapshot {
            active_requests: 3,
            active_llm: 2,
            reserved_requests: 1,
            reserved_llm: 1,
            active: ActiveCounts::default(),
            reservations: vec![],
            active_orchestrations: 0,
            queued: 0,
            queued_tools: vec![],
            queue_evictions: 0,
            limits: RuntimeLimits::default(),
        }
    }

    #[test]
    fn test_free_slots() {
        let s = snapshot();
        assert_eq!(s.free_requests(), 16 - 4);
        assert_eq!(s.free_llm(), 8 - 3);
    }

    #[test]
    fn test_free_slots_saturate() {
        let mut s = snapshot();
        s.active_llm = 100;
        assert_eq!(s.free_llm(), 0);
    }
}
