//! Capacity reservations

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A grant of future resource recorded in the ledger
///
/// Held from creation; `consumed_at_ms` marks the moment the worker
/// actually started drawing the resource. A consumed reservation still
/// holds its slots until release. Reservations not heartbeated past
/// `expires_at_ms` are reclaimed by the sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityReservation {
    pub id: Uuid,
    pub tool_name: String,
    pub additional_requests: u32,
    pub additional_llm: u32,
    pub created_at_ms: u64,
    pub heartbeat_at_ms: u64,
    pub expires_at_ms: u64,
    pub consumed_at_ms: Option<u64>,
}

impl CapacityReservation {
    pub(crate) fn new(tool_name: &str, additional_requests: u32, additional_llm: u32, expiry_ms: u64) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::now_v7(),
            tool_name: tool_name.to_string(),
            additional_requests,
            additional_llm,
            created_at_ms: now,
            heartbeat_at_ms: now,
            expires_at_ms: now + expiry_ms,
            consumed_at_ms: None,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at_ms.is_some()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_reservation_is_held() {
        let r = CapacityReservation::new("subagent_run", 1, 2, 300_000);
        assert!(!r.is_consumed());
        assert_eq!(r.additional_requests, 1);
        assert_eq!(r.additional_llm, 2);
        assert_eq!(r.heartbeat_at_ms, r.created_at_ms);
        assert_eq!(r.expires_at_ms, r.created_at_ms + 300_000);
    }

    #[test]
    fn test_expiry() {
        let r = CapacityReservation::new("subagent_run", 1, 1, 1_000);
        assert!(!r.is_expired(r.created_at_ms));
        assert!(!r.is_expired(r.created_at_ms + 1_000));
        assert!(r.is_expired(r.created_at_ms + 1_001));
    }

    #[test]
    fn test_unique_ids() {
        let a = CapacityReservation::new("t", 1, 1, 1);
        let b = CapacityReservation::new("t", 1, 1, 1);
        assert_ne!(a.id, b.id);
    }
}
