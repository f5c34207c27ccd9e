//! Dispatch glue
//!
//! Assembles the runtime out of explicit capability objects and routes
//! every delegated call through ownership → coordinator → rate controller
//! → ledger → worker pool. No module-global state: embedders construct an
//! [`AgentRuntime`] and tests inject whatever invoker they like.

mod gate;
mod runtime;

pub use gate::{ModelGate, ObservedInvoker};
pub use runtime::{AgentRuntime, InstanceStatus, LoopDriver, LoopRunResult, LoopStop};
