//! Instance registration records

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::InstanceId;
use crate::ledger::now_ms;

/// One process's entry in the shared registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub instance_id: String,
    pub hostname: String,
    pub pid: u32,
    pub start_ms: u64,
    /// Epoch ms of the last refresh; staleness means death
    pub heartbeat_ms: u64,
    /// In-flight LLM calls per provider
    pub active_models: HashMap<String, u32>,
    /// Slots currently stolen from peers, per provider
    pub stolen_slots: HashMap<String, u32>,
}

impl InstanceRegistration {
    pub fn new(id: &InstanceId) -> Self {
        Self {
            instance_id: id.to_string(),
            hostname: id.hostname.clone(),
            pid: id.pid,
            start_ms: id.start_ms,
            heartbeat_ms: now_ms(),
            active_models: HashMap::new(),
            stolen_slots: HashMap::new(),
        }
    }

    pub fn active_for(&self, provider: &str) -> u32 {
        self.active_models.get(provider).copied().unwrap_or(0)
    }

    pub fn is_live(&self, now: u64, dead_after_ms: u64) -> bool {
        now.saturating_sub(self.heartbeat_ms) <= dead_after_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_window() {
        let id = InstanceId {
            hostname: "h".to_string(),
            pid: 1,
            start_ms: 0,
        };
        let mut reg = InstanceRegistration::new(&id);
        reg.heartbeat_ms = 10_000;

        assert!(reg.is_live(10_000, 30_000));
        assert!(reg.is_live(40_000, 30_000));
        assert!(!reg.is_live(40_001, 30_000));
    }

    #[test]
    fn test_active_for_unknown_provider() {
        let id = InstanceId {
            hostname: "h".to_string(),
            pid: 1,
            start_ms: 0,
        };
        let reg = InstanceRegistration::new(&id);
        assert_eq!(reg.active_for("anthropic"), 0);
    }

    #[test]
    fn test_serde_round_trip() {
        let id = InstanceId {
            hostname: "h".to_string(),
            pid: 7,
            start_ms: 123,
        };
        let mut reg = InstanceRegistration::new(&id);
        reg.active_models.insert("anthropic".to_string(), 3);

        let json = serde_json::to_string(&reg).unwrap();
        let back: InstanceRegistration = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, "h:7:123");
        assert_eq!(back.active_for("anthropic"), 3);
    }
}
