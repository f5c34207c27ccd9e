//! Shared state directory layout
//!
//! One workspace-relative root holds everything cooperating instances
//! exchange:
//!
//! ```text
//! <root>/
//!   ownership/<workflow_id>.json        one record per owned workflow
//!   coordinator/instances/<id>.json     peer registrations
//!   audit/audit.log.jsonl               append-only audit events
//!   teams/runs/<run_id>.json            per-run team results
//!   subagents/runs/<run_id>.json        per-run sub-agent results
//! ```

use std::path::{Path, PathBuf};

use crate::error::StateError;

/// Owns every path under the shared state root
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Layout rooted at the given directory (not created yet)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state root itself
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create every directory in the layout
    pub fn ensure(&self) -> Result<(), StateError> {
        for dir in [
            self.ownership_dir(),
            self.instances_dir(),
            self.audit_dir(),
            self.team_runs_dir(),
            self.subagent_runs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn ownership_dir(&self) -> PathBuf {
        self.root.join("ownership")
    }

    /// `ownership/<workflow_id>.json`
    pub fn ownership_file(&self, workflow_id: &str) -> PathBuf {
        self.ownership_dir().join(format!("{}.json", sanitize(workflow_id)))
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("coordinator").join("instances")
    }

    /// `coordinator/instances/<instance_id>.json`
    pub fn instance_file(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(format!("{}.json", sanitize(instance_id)))
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    /// `audit/audit.log.jsonl`
    pub fn audit_file(&self) -> PathBuf {
        self.audit_dir().join("audit.log.jsonl")
    }

    /// `audit/audit-<date>.log.jsonl`, the archive target
    pub fn audit_archive_file(&self, date: &str) -> PathBuf {
        self.audit_dir().join(format!("audit-{}.log.jsonl", sanitize(date)))
    }

    pub fn team_runs_dir(&self) -> PathBuf {
        self.root.join("teams").join("runs")
    }

    /// `teams/runs/<run_id>.json`
    pub fn team_run_file(&self, run_id: &str) -> PathBuf {
        self.team_runs_dir().join(format!("{}.json", sanitize(run_id)))
    }

    pub fn subagent_runs_dir(&self) -> PathBuf {
        self.root.join("subagents").join("runs")
    }

    /// `subagents/runs/<run_id>.json`
    pub fn subagent_run_file(&self, run_id: &str) -> PathBuf {
        self.subagent_runs_dir().join(format!("{}.json", sanitize(run_id)))
    }
}

/// Keep ids filesystem-safe: anything outside [A-Za-z0-9._-] becomes '_'
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
