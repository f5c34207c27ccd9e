//! Ownership manager

use std::sync::Arc;

use eyre::Result;
use tracing::{debug, info, warn};
use workstate::{FileLock, StateLayout, read_json, remove_file_if_exists, write_json_atomic};

use crate::coordinator::InstanceCoordinator;
use crate::domain::InstanceId;

use super::record::OwnershipRecord;

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This instance now owns the workflow; carries the previous owner
    /// when the claim was a transfer from a dead instance
    Claimed { transferred_from: Option<String> },
    /// This instance already owned it
    AlreadyOwned,
    /// A live peer owns it
    OwnedBy { instance_id: String, pid: u32 },
}

/// Result of an ownership check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipStatus {
    Owned,
    NotOwned,
    OwnedByOther { instance_id: String, pid: u32 },
}

/// Per-workflow exclusive locks across instances
pub struct OwnershipManager {
    layout: StateLayout,
    me: InstanceId,
    coordinator: Arc<InstanceCoordinator>,
    auto_claim: bool,
}

impl OwnershipManager {
    pub fn new(layout: StateLayout, me: InstanceId, coordinator: Arc<InstanceCoordinator>, auto_claim: bool) -> Self {
        Self {
            layout,
            me,
            coordinator,
            auto_claim,
        }
    }

    fn claims_lock(&self) -> Result<FileLock> {
        Ok(FileLock::acquire(&self.layout.ownership_dir().join(".claims.lock"))?)
    }

    /// Is the recorded owner still alive?
    ///
    /// Live-set membership is authoritative. The pid probe only applies to
    /// a same-host owner that is NOT in the live set: a stale registration
    /// with a running pid still counts as dead only once both agree.
    fn owner_is_live(&self, record: &OwnershipRecord) -> bool {
        if self.coordinator.is_instance_live(&record.owner_instance_id) {
            return true;
        }
        if let Some(owner) = InstanceId::parse(&record.owner_instance_id)
            && owner.hostname == self.me.hostname
        {
            return owner.pid_alive() && owner.pid != self.me.pid;
        }
        false
    }

    /// Claim the workflow for this instance
    pub fn claim(&self, workflow_id: &str) -> Result<ClaimOutcome> {
        let _lock = self.claims_lock()?;
        let path = self.layout.ownership_file(workflow_id);

        match read_json::<OwnershipRecord>(&path)? {
            None => {
                write_json_atomic(&path, &OwnershipRecord::new(workflow_id, &self.me))?;
                info!(workflow_id, "workflow claimed");
                Ok(ClaimOutcome::Claimed { transferred_from: None })
            }
            Some(record) if record.owned_by(&self.me) => Ok(ClaimOutcome::AlreadyOwned),
            Some(record) if self.owner_is_live(&record) => Ok(ClaimOutcome::OwnedBy {
                instance_id: record.owner_instance_id,
                pid: record.owner_pid,
            }),
            Some(record) if self.auto_claim => {
                warn!(
                    workflow_id,
                    previous = %record.owner_instance_id,
                    "owner dead, transferring workflow ownership"
                );
                write_json_atomic(&path, &OwnershipRecord::new(workflow_id, &self.me))?;
                Ok(ClaimOutcome::Claimed {
                    transferred_from: Some(record.owner_instance_id),
                })
            }
            Some(record) => Ok(ClaimOutcome::OwnedBy {
                instance_id: record.owner_instance_id,
                pid: record.owner_pid,
            }),
        }
    }

    /// Release a workflow this instance owns; releasing something not
    /// owned is a no-op
    pub fn release(&self, workflow_id: &str) -> Result<bool> {
        let _lock = self.claims_lock()?;
        let path = self.layout.ownership_file(workflow_id);

        match read_json::<OwnershipRecord>(&path)? {
            Some(record) if record.owned_by(&self.me) => {
                remove_file_if_exists(&path)?;
                info!(workflow_id, "workflow released");
                Ok(true)
            }
            Some(record) => {
                debug!(workflow_id, owner = %record.owner_instance_id, "release skipped, not the owner");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Current ownership from this instance's point of view
    pub fn check(&self, workflow_id: &str) -> Result<OwnershipStatus> {
        let path = self.layout.ownership_file(workflow_id);
        match read_json::<OwnershipRecord>(&path)? {
            None => Ok(OwnershipStatus::NotOwned),
            Some(record) if record.owned_by(&self.me) => Ok(OwnershipStatus::Owned),
            Some(record) => Ok(OwnershipStatus::OwnedByOther {
                instance_id: record.owner_instance_id,
                pid: record.owner_pid,
            }),
        }
    }

    /// Take ownership unconditionally; returns the displaced owner, if any
    pub fn force_claim(&self, workflow_id: &str) -> Result<Option<String>> {
        let _lock = self.claims_lock()?;
        let path = self.layout.ownership_file(workflow_id);

        let previous = read_json::<OwnershipRecord>(&path)?
            .filter(|r| !r.owned_by(&self.me))
            .map(|r| r.owner_instance_id);

        write_json_atomic(&path, &OwnershipRecord::new(workflow_id, &self.me))?;
        warn!(workflow_id, ?previous, "workflow force-claimed");
        Ok(previous)
    }

    /// Every workflow currently owned by anyone
    pub fn list(&self) -> Result<Vec<OwnershipRecord>> {
        let mut records = Vec::new();
        for file in workstate::list_json_files(&self.layout.ownership_dir())? {
            if let Some(record) = read_json::<OwnershipRecord>(&file)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(records)
    }
}
