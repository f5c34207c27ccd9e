//! Sub-agent runner
//!
//! Executes one delegated task under an already-granted reservation:
//! consume, heartbeat while working, invoke through retry/backoff,
//! normalize the output, audit, release. The reservation is released on
//! every path, including cancellation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditLog};
use crate::domain::{ErrorKind, TaskOutcome};
use crate::ledger::{CapacityLedger, CapacityReservation};
use crate::llm::{InvokeError, InvokeRequest, LlmInvoker};
use crate::monitor::{LiveMonitor, MonitorEvent};
use crate::retry::{RetryFailure, RetryPolicies, execute_with_retry};

use super::definition::SubAgentDefinition;
use super::output::NormalizedOutput;

const SECTION_INSTRUCTION: &str = "Answer in labeled sections: SUMMARY:, CLAIM:, EVIDENCE: (one item per '- ' line), \
     RESULT:, NEXT_STEP:, CONFIDENCE: (0 to 1).";
const REINFORCED_INSTRUCTION: &str = "Your previous answer was unusable. You MUST answer in exactly the labeled sections \
     SUMMARY:, CLAIM:, EVIDENCE:, RESULT:, NEXT_STEP:, CONFIDENCE:, and RESULT must not be empty.";

/// Outcome of one sub-agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentRunResult {
    pub run_id: String,
    pub definition_id: String,
    pub outcome: TaskOutcome,
    pub output: Option<NormalizedOutput>,
    pub latency_ms: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Executes delegated tasks against the injected invoker
pub struct SubAgentRunner {
    invoker: Arc<dyn LlmInvoker>,
    ledger: Arc<CapacityLedger>,
    audit: Arc<AuditLog>,
    monitor: Arc<LiveMonitor>,
    policies: RetryPolicies,
    actor: String,
    min_output_chars: usize,
    heartbeat_interval: Duration,
}

impl SubAgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoker: Arc<dyn LlmInvoker>,
        ledger: Arc<CapacityLedger>,
        audit: Arc<AuditLog>,
        monitor: Arc<LiveMonitor>,
        policies: RetryPolicies,
        actor: String,
        min_output_chars: usize,
        reservation_expiry: Duration,
    ) -> Self {
        Self {
            invoker,
            ledger,
            audit,
            monitor,
            policies,
            actor,
            min_output_chars,
            heartbeat_interval: (reservation_expiry / 2).max(Duration::from_millis(50)),
        }
    }

    /// Invoke with retries and normalize, with no reservation handling.
    /// Used directly for work already covered by a bulk reservation.
    pub async fn invoke_normalized(
        &self,
        definition: &SubAgentDefinition,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> (Result<NormalizedOutput, RetryFailure>, u64, u32) {
        let started = Instant::now();
        let min_chars = self.min_output_chars;

        let result = execute_with_retry(
            |attempt| {
                let instruction = if attempt > 1 { REINFORCED_INSTRUCTION } else { SECTION_INSTRUCTION };
                let request = InvokeRequest {
                    provider: definition.provider.clone(),
                    model: definition.model.clone(),
                    system_prompt: format!("{}\n\n{}", definition.system_prompt, instruction),
                    prompt: prompt.to_string(),
                    max_tokens: definition.max_tokens,
                };
                let invoker = self.invoker.clone();
                let cancel = cancel.clone();
                async move {
                    let response = invoker.invoke(request, &cancel).await?;
                    if response.text.trim().len() < min_chars {
                        return Err(InvokeError::Empty);
                    }
                    Ok((response.text, attempt))
                }
            },
            &self.policies,
            cancel,
        )
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok((text, attempts)) => (Ok(NormalizedOutput::parse(&text)), latency_ms, attempts),
            Err(failure) => {
                let attempts = failure.attempts;
                (Err(failure), latency_ms, attempts)
            }
        }
    }

    /// Full single-task flow under a granted reservation
    pub async fn execute_under_reservation(
        &self,
        definition: &SubAgentDefinition,
        task: &str,
        reservation: CapacityReservation,
        cancel: &CancellationToken,
    ) -> SubAgentRunResult {
        let run_id = Uuid::now_v7().to_string();
        debug!(%run_id, definition = %definition.id, "sub-agent starting");

        self.audit
            .record(
                AuditEvent::new(AuditAction::SubagentStart, &self.actor)
                    .with_tool(&run_id, "subagent_run")
                    .with_details(serde_json::json!({
                        "definition": definition.id,
                        "provider": definition.provider,
                        "model": definition.model,
                    })),
            )
            .await;

        self.ledger.consume(reservation.id).await;

        // Keep the reservation alive while the call runs
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = {
            let ledger = self.ledger.clone();
            let id = reservation.id;
            let stop = heartbeat_cancel.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if !ledger.heartbeat(id).await {
                        return;
                    }
                }
            })
        };

        let (parsed, latency_ms, attempts) = self.invoke_normalized(definition, task, cancel).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat.await;

        let result = match parsed {
            Ok(output) => {
                info!(%run_id, latency_ms, attempts, degraded = output.degraded, "sub-agent succeeded");
                self.audit
                    .record(
                        AuditEvent::new(AuditAction::SubagentSuccess, &self.actor)
                            .with_tool(&run_id, "subagent_run")
                            .with_details(serde_json::json!({
                                "latency_ms": latency_ms,
                                "attempts": attempts,
                                "degraded": output.degraded,
                            })),
                    )
                    .await;
                SubAgentRunResult {
                    run_id: run_id.clone(),
                    definition_id: definition.id.clone(),
                    outcome: TaskOutcome::Success,
                    output: Some(output),
                    latency_ms,
                    attempts,
                    error: None,
                }
            }
            Err(failure) => {
                let outcome = outcome_for(&failure);
                warn!(%run_id, kind = %failure.kind, attempts, "sub-agent failed");
                self.audit
                    .record(
                        AuditEvent::new(AuditAction::SubagentFailure, &self.actor)
                            .with_tool(&run_id, "subagent_run")
                            .with_details(serde_json::json!({
                                "kind": failure.kind.to_string(),
                                "attempts": attempts,
                            }))
                            .failed(&failure.last_error.to_string()),
                    )
                    .await;
                SubAgentRunResult {
                    run_id: run_id.clone(),
                    definition_id: definition.id.clone(),
                    outcome,
                    output: None,
                    latency_ms,
                    attempts,
                    error: Some(failure.last_error.to_string()),
                }
            }
        };

        self.ledger.release(reservation.id).await;
        self.monitor.emit(MonitorEvent::SubagentFinished {
            run_id,
            outcome: result.outcome,
        });
        result
    }
}

fn outcome_for(failure: &RetryFailure) -> TaskOutcome {
    match failure.kind {
        ErrorKind::Cancelled => TaskOutcome::Cancelled,
        ErrorKind::Timeout => TaskOutcome::TimedOut,
        kind => TaskOutcome::Failure(kind),
    }
}
