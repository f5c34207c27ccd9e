//! Team definitions and results

use serde::{Deserialize, Serialize};

use crate::domain::TaskOutcome;
use crate::subagent::{MemberDiagnostics, NormalizedOutput, SubAgentDefinition};

use super::uncertainty::{FinalJudgment, UncertaintyProxy};

/// One role inside a team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDefinition {
    pub id: String,
    pub role: String,
    #[serde(rename = "system-prompt", default)]
    pub system_prompt: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl MemberDefinition {
    pub fn new(id: &str, role: &str) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            system_prompt: String::new(),
            enabled: true,
        }
    }
}

/// A named collection of member roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamDefinition {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    pub members: Vec<MemberDefinition>,
}

impl TeamDefinition {
    pub fn new(id: &str, provider: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: MemberDefinition) -> Self {
        self.members.push(member);
        self
    }

    pub fn enabled_members(&self) -> impl Iterator<Item = &MemberDefinition> {
        self.members.iter().filter(|m| m.enabled)
    }

    /// The sub-agent a member runs as
    pub fn agent_for(&self, member: &MemberDefinition) -> SubAgentDefinition {
        SubAgentDefinition {
            id: format!("{}/{}", self.id, member.id),
            role: member.role.clone(),
            system_prompt: member.system_prompt.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            max_tokens: 8_192,
        }
    }
}

/// Final status of one member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Completed,
    Failed,
}

/// One member's contribution to the team result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMemberResult {
    pub member_id: String,
    pub role: String,
    /// Canonical labeled rendering of the member's final output
    pub output: String,
    pub status: MemberStatus,
    pub latency_ms: u64,
    pub diagnostics: MemberDiagnostics,
    pub outcome: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized: Option<NormalizedOutput>,
}

impl TeamMemberResult {
    pub fn completed(&self) -> bool {
        self.status == MemberStatus::Completed
    }
}

/// Outcome of a whole team run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRunResult {
    pub run_id: String,
    pub team_id: String,
    pub members: Vec<TeamMemberResult>,
    pub uncertainty: UncertaintyProxy,
    pub judgment: FinalJudgment,
    /// Human-readable aggregate account of the run
    pub narrative: String,
    /// Member parallelism actually applied after admission
    pub applied_member_parallelism: u32,
    pub communication_rounds_run: u32,
    pub latency_ms: u64,
}
