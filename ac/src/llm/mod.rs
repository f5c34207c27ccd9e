//! LLM invocation capability
//!
//! The runtime never talks to a provider itself. Callers inject an
//! [`LlmInvoker`]; the runtime hands it a prompt and a cancellation signal
//! and gets back text plus usage metrics. [`FnInvoker`] adapts a plain
//! closure, which is how embedders and every test wire one in.

mod error;
mod invoker;

pub use error::InvokeError;
pub use invoker::{FnInvoker, InvokeRequest, InvokeResponse, LlmInvoker, UsageMetrics};
