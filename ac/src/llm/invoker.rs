//! The invoker trait and its closure adapter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::InvokeError;

/// One prompt handed to the provider
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Provider key used for fair-share and rate adaptation
    pub provider: String,

    /// Model key within the provider
    pub model: String,

    /// System prompt, already assembled by the caller
    pub system_prompt: String,

    /// The task prompt
    pub prompt: String,

    /// Token budget hint for the provider
    pub max_tokens: u32,
}

impl InvokeRequest {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            system_prompt: String::new(),
            prompt: prompt.into(),
            max_tokens: 8_192,
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }
}

/// Usage metrics reported by the provider
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct UsageMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
}

/// A completed invocation
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub text: String,
    pub usage: UsageMetrics,
}

impl InvokeResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: UsageMetrics::default(),
        }
    }
}

/// The injected LLM capability
///
/// Implementations must observe the cancel token promptly; the runtime
/// treats a completed-but-cancelled call as cancelled.
#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest, cancel: &CancellationToken) -> Result<InvokeResponse, InvokeError>;
}

type InvokeFn = dyn Fn(&InvokeRequest) -> Result<InvokeResponse, InvokeError> + Send + Sync;

/// Closure-backed invoker for embedding and tests
///
/// The closure runs per call; an optional artificial latency makes
/// concurrency observable in tests. Cancellation is checked before and
/// during the simulated latency.
pub struct FnInvoker {
    f: Arc<InvokeFn>,
    latency: Duration,
}

impl FnInvoker {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&InvokeRequest) -> Result<InvokeResponse, InvokeError> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            latency: Duration::ZERO,
        }
    }

    /// Fixed response for every call
    pub fn always(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(InvokeResponse::text(text.clone())))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl LlmInvoker for FnInvoker {
    async fn invoke(&self, request: InvokeRequest, cancel: &CancellationToken) -> Result<InvokeResponse, InvokeError> {
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }

        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        (self.f)(&request)
    }
}
