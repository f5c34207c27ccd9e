//! Ownership records

use serde::{Deserialize, Serialize};

use crate::domain::InstanceId;
use crate::ledger::now_ms;

/// One workflow's ownership entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub workflow_id: String,
    pub owner_instance_id: String,
    pub owner_pid: u32,
    pub claimed_at_ms: u64,
}

impl OwnershipRecord {
    pub fn new(workflow_id: &str, owner: &InstanceId) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            owner_instance_id: owner.to_string(),
            owner_pid: owner.pid,
            claimed_at_ms: now_ms(),
        }
    }

    pub fn owned_by(&self, instance: &InstanceId) -> bool {
        self.owner_instance_id == instance.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_identity() {
        let me = InstanceId {
            hostname: "h".to_string(),
            pid: 42,
            start_ms: 9,
        };
        let other = InstanceId {
            hostname: "h".to_string(),
            pid: 43,
            start_ms: 9,
        };

        let record = OwnershipRecord::new("wf-1", &me);
        assert!(record.owned_by(&me));
        assert!(!record.owned_by(&other));
        assert_eq!(record.owner_pid, 42);
    }

    #[test]
    fn test_serde_round_trip() {
        let me = InstanceId {
            hostname: "h".to_string(),
            pid: 42,
            start_ms: 9,
        };
        let record = OwnershipRecord::new("wf-1", &me);
        let json = serde_json::to_string(&record).unwrap();
        let back: OwnershipRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workflow_id, "wf-1");
        assert_eq!(back.owner_instance_id, "h:42:9");
    }
}
