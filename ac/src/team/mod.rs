//! Team orchestration
//!
//! A team is a named set of member roles executed together for one task:
//! an initial parallel phase, optional communication rounds where members
//! see and cite each other, and a final deterministic judgment over the
//! collected outputs.

mod orchestrator;
mod parallelism;
mod types;
mod uncertainty;

pub use orchestrator::TeamOrchestrator;
pub use parallelism::{parallelism_candidates, resolve_parallelism, AppliedParallelism};
pub use types::{MemberDefinition, MemberStatus, TeamDefinition, TeamMemberResult, TeamRunResult};
pub use uncertainty::{CollapseSignal, FinalJudgment, UncertaintyProxy, Verdict, assess};
