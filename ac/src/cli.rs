//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// AgentCore - agent runtime core for delegated LLM work
#[derive(Parser)]
#[command(
    name = "agentcore",
    about = "Admission, scheduling, and coordination for delegated LLM work",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Show live instances and recent runs
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List registered instances in the shared workspace
    Instances {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the effective runtime limits
    Limits {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Read the audit log
    Audit {
        /// Filter by action kind (e.g. reservation_expired)
        #[arg(long)]
        action: Option<String>,

        /// Filter by actor instance id
        #[arg(long)]
        actor: Option<String>,

        /// Filter by tool id
        #[arg(long)]
        tool: Option<String>,

        /// Inclusive ISO-8601 lower bound
        #[arg(long)]
        since: Option<String>,

        /// Exclusive ISO-8601 upper bound
        #[arg(long)]
        until: Option<String>,

        /// Only failed events
        #[arg(long)]
        failed: bool,

        /// Max events to show (most recent)
        #[arg(short, long, default_value = "50")]
        limit: usize,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Workflow ownership operations
    Workflow {
        #[command(subcommand)]
        op: WorkflowOp,
    },
}

/// Workflow ownership subcommands
#[derive(Subcommand)]
pub enum WorkflowOp {
    /// Claim a workflow for this host
    Claim { workflow_id: String },

    /// Release a workflow owned by this host
    Release { workflow_id: String },

    /// Check who owns a workflow
    Check { workflow_id: String },

    /// Take ownership unconditionally
    ForceClaim { workflow_id: String },

    /// List all owned workflows
    List,
}

/// Output format for status commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let cli = Cli::try_parse_from(["ac", "status", "--format", "json"]).unwrap();
        match cli.command {
            Command::Status { format } => assert_eq!(format, OutputFormat::Json),
            _ => panic!("expected status"),
        }
    }

    #[test]
    fn test_parse_workflow_claim() {
        let cli = Cli::try_parse_from(["ac", "workflow", "claim", "wf-1"]).unwrap();
        match cli.command {
            Command::Workflow {
                op: WorkflowOp::Claim { workflow_id },
            } => assert_eq!(workflow_id, "wf-1"),
            _ => panic!("expected workflow claim"),
        }
    }

    #[test]
    fn test_parse_audit_filters() {
        let cli = Cli::try_parse_from(["ac", "audit", "--action", "queue_evicted", "--failed", "--limit", "5"]).unwrap();
        match cli.command {
            Command::Audit {
                action,
                failed,
                limit,
                ..
            } => {
                assert_eq!(action.as_deref(), Some("queue_evicted"));
                assert!(failed);
                assert_eq!(limit, 5);
            }
            _ => panic!("expected audit"),
        }
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(Cli::try_parse_from(["ac", "status", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_missing_subcommand_rejected() {
        assert!(Cli::try_parse_from(["ac"]).is_err());
    }
}
