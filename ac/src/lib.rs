//! AgentCore - admission, scheduling, and coordination for delegated LLM work
//!
//! AgentCore governs how LLM-backed work units (sub-agents and team
//! members) are admitted, queued, reserved, executed, aggregated, and
//! retired across one or more cooperating host processes sharing a
//! workspace. The LLM call itself is an injected capability; everything
//! around it, admission control against hard caps, priority queueing with
//! fair sharing, adaptive rate learning from 429s, retry budgets, team
//! fan-out with a deterministic judge, cross-instance fair shares, and
//! crash-safe audit logging, lives here.
//!
//! # Modules
//!
//! - [`ledger`] - capacity counters, reservations, and the pending queue
//! - [`ratelimit`] - learned per-model concurrency caps
//! - [`retry`] - error classification and backoff budgets
//! - [`pool`] - bounded-parallelism batch execution
//! - [`coordinator`] - shared-directory peer registry and work stealing
//! - [`ownership`] - per-workflow exclusive locks across instances
//! - [`subagent`] - single delegated runs and output normalization
//! - [`team`] - phased team orchestration and the final judgment
//! - [`audit`] - append-only JSONL event log
//! - [`dispatch`] - the assembled runtime and its delegation API

pub mod audit;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod llm;
pub mod monitor;
pub mod ownership;
pub mod pool;
pub mod ratelimit;
pub mod retry;
pub mod subagent;
pub mod sweeper;
pub mod team;

// Re-export commonly used types
pub use audit::{AuditAction, AuditEvent, AuditFilter, AuditLog};
pub use config::{RuntimeConfig, RuntimeLimits};
pub use coordinator::{InstanceCoordinator, InstanceRegistration};
pub use dispatch::{AgentRuntime, LoopDriver, LoopRunResult, LoopStop};
pub use domain::{ErrorKind, InstanceId, Priority, QueueClass, RunOptions, TaskOutcome};
pub use error::RuntimeError;
pub use ledger::{CapacityLedger, CapacityReservation, ReserveOutcome, RuntimeSnapshot, WaitOutcome};
pub use llm::{FnInvoker, InvokeError, InvokeRequest, InvokeResponse, LlmInvoker, UsageMetrics};
pub use monitor::{LiveMonitor, MemberState, MonitorEvent};
pub use ownership::{ClaimOutcome, OwnershipManager, OwnershipStatus};
pub use ratelimit::AdaptiveRateController;
pub use subagent::{NormalizedOutput, SubAgentDefinition, SubAgentRunResult, SubAgentRunner};
pub use team::{
    CollapseSignal, FinalJudgment, MemberDefinition, TeamDefinition, TeamOrchestrator, TeamRunResult,
    UncertaintyProxy, Verdict,
};
