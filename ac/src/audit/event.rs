//! Audit event records

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    InstanceRegistered,
    InstanceUnregistered,
    ReservationGranted,
    ReservationExpired,
    ReservationReleased,
    QueueEvicted,
    SubagentStart,
    SubagentSuccess,
    SubagentFailure,
    TeamStart,
    TeamComplete,
    TeamMemberRetry,
    WorkflowClaimed,
    WorkflowReleased,
    WorkflowOwnershipTransferred,
    RateLimitObserved,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde's snake_case name without the quotes
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// One immutable audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp_iso: String,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub actor: String,
    pub details: serde_json::Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, actor: &str) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            timestamp_iso: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            action,
            tool_id: None,
            tool_name: None,
            actor: actor.to_string(),
            details: serde_json::json!({}),
            success: true,
            error_message: None,
        }
    }

    pub fn with_tool(mut self, tool_id: &str, tool_name: &str) -> Self {
        self.tool_id = Some(tool_id.to_string());
        self.tool_name = Some(tool_name.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn failed(mut self, error_message: &str) -> Self {
        self.success = false;
        self.error_message = Some(error_message.to_string());
        self
    }
}
