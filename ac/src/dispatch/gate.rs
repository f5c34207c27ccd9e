//! Admission adapters binding the rate controller and coordinator
//!
//! `ModelGate` is the per-(provider, model) admission check the ledger
//! consults before granting an LLM slot: learned concurrency cap first,
//! then the cross-instance fair share. `ObservedInvoker` closes the loop
//! by feeding 429s and successes back into the controller.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coordinator::InstanceCoordinator;
use crate::domain::ErrorKind;
use crate::ledger::AdmissionGate;
use crate::llm::{InvokeError, InvokeRequest, InvokeResponse, LlmInvoker};
use crate::ratelimit::AdaptiveRateController;
use crate::retry::classify;

/// One (provider, model) admission gate
pub struct ModelGate {
    controller: Arc<AdaptiveRateController>,
    coordinator: Arc<InstanceCoordinator>,
    provider: String,
    model: String,
}

impl ModelGate {
    pub fn new(
        controller: Arc<AdaptiveRateController>,
        coordinator: Arc<InstanceCoordinator>,
        provider: &str,
        model: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            coordinator,
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

impl AdmissionGate for ModelGate {
    fn try_acquire(&self) -> bool {
        if !self.coordinator.can_start_model(&self.provider, &self.model) {
            debug!(provider = %self.provider, "fair share exhausted");
            return false;
        }
        if !self.controller.try_begin(&self.provider, &self.model) {
            debug!(provider = %self.provider, model = %self.model, "learned cap full");
            return false;
        }
        self.coordinator.model_started(&self.provider);
        true
    }

    fn release(&self) {
        self.controller.finish(&self.provider, &self.model);
        self.coordinator.model_finished(&self.provider);
    }
}

/// Invoker decorator reporting outcomes to the adaptive controller
pub struct ObservedInvoker {
    inner: Arc<dyn LlmInvoker>,
    controller: Arc<AdaptiveRateController>,
}

impl ObservedInvoker {
    pub fn new(inner: Arc<dyn LlmInvoker>, controller: Arc<AdaptiveRateController>) -> Arc<Self> {
        Arc::new(Self { inner, controller })
    }
}

#[async_trait]
impl LlmInvoker for ObservedInvoker {
    async fn invoke(&self, request: InvokeRequest, cancel: &CancellationToken) -> Result<InvokeResponse, InvokeError> {
        let provider = request.provider.clone();
        let model = request.model.clone();
        let result = self.inner.invoke(request, cancel).await;
        match &result {
            Ok(_) => self.controller.record_success(&provider, &model),
            Err(error) if classify(error) == ErrorKind::RateLimited => {
                self.controller.record_429(&provider, &model);
            }
            Err(_) => {}
        }
        result
    }
}
