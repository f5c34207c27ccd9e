//! The assembled runtime

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::{Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use workstate::{StateLayout, list_json_files, read_json, write_json_atomic};

use crate::audit::{AuditAction, AuditEvent, AuditFilter, AuditLog};
use crate::config::RuntimeConfig;
use crate::coordinator::{InstanceCoordinator, PeerView};
use crate::domain::{InstanceId, RunOptions};
use crate::error::RuntimeError;
use crate::ledger::{AdmissionGate, CapacityLedger, ReserveRequest, RuntimeSnapshot, WaitOutcome};
use crate::llm::LlmInvoker;
use crate::monitor::{LiveMonitor, MonitorEvent};
use crate::ownership::{ClaimOutcome, OwnershipManager, OwnershipRecord, OwnershipStatus};
use crate::pool::{self, PoolTaskResult};
use crate::ratelimit::{AdaptiveRateController, ModelLimitView};
use crate::retry::RetryPolicies;
use crate::subagent::{SubAgentDefinition, SubAgentRunResult, SubAgentRunner};
use crate::sweeper::ReservationSweeper;
use crate::team::{TeamDefinition, TeamOrchestrator, TeamRunResult};

use super::gate::{ModelGate, ObservedInvoker};

/// Live peers and per-provider fair shares, for introspection
#[derive(Debug, Serialize)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub peers: Vec<PeerView>,
    pub fair_shares: HashMap<String, u32>,
}

/// Drives a repeated task-step loop: each step is one sub-agent call,
/// and the driver decides the next step from the previous result
pub trait LoopDriver: Send {
    fn next_step(&mut self, previous: Option<&SubAgentRunResult>) -> Option<(SubAgentDefinition, String)>;
}

/// Why a loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStop {
    DriverDone,
    Cancelled,
}

/// Outcome of a task-step loop
#[derive(Debug, Serialize)]
pub struct LoopRunResult {
    pub iterations: u32,
    pub results: Vec<SubAgentRunResult>,
    pub stopped_by: LoopStop,
}

/// The runtime: every capability wired together for one process
pub struct AgentRuntime {
    config: RuntimeConfig,
    layout: StateLayout,
    instance: InstanceId,
    ledger: Arc<CapacityLedger>,
    coordinator: Arc<InstanceCoordinator>,
    controller: Arc<AdaptiveRateController>,
    audit: Arc<AuditLog>,
    monitor: Arc<LiveMonitor>,
    ownership: Arc<OwnershipManager>,
    runner: Arc<SubAgentRunner>,
    orchestrator: TeamOrchestrator,
    root_cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentRuntime {
    /// Build and start the runtime: state directories, instance
    /// registration, sweeper, and coordinator refresh
    pub async fn start(config: RuntimeConfig, invoker: Arc<dyn LlmInvoker>) -> Result<Arc<Self>> {
        let layout = StateLayout::new(&config.state_dir);
        layout.ensure().context("failed to create state directories")?;

        let instance = InstanceId::local();
        let actor = instance.to_string();
        info!(instance = %actor, "runtime starting");

        let ledger = Arc::new(CapacityLedger::new(
            config.limits.clone(),
            &config.queue,
            &config.reservation,
        ));
        let audit = Arc::new(AuditLog::new(layout.audit_file()));
        let monitor = Arc::new(LiveMonitor::new(config.limits.clone()));
        let controller = Arc::new(AdaptiveRateController::new(
            config.adaptive.clone(),
            config.coordinator.provider_limits.clone(),
        ));

        let coordinator = Arc::new(InstanceCoordinator::new(
            layout.clone(),
            instance.clone(),
            &config.coordinator,
        ));
        coordinator.register_instance();
        coordinator.refresh_peers();
        audit.record(AuditEvent::new(AuditAction::InstanceRegistered, &actor)).await;

        let ownership = Arc::new(OwnershipManager::new(
            layout.clone(),
            instance.clone(),
            coordinator.clone(),
            config.workflow.auto_claim,
        ));

        let observed = ObservedInvoker::new(invoker, controller.clone());
        let runner = Arc::new(SubAgentRunner::new(
            observed,
            ledger.clone(),
            audit.clone(),
            monitor.clone(),
            RetryPolicies::from_config(&config.retry),
            actor.clone(),
            config.team.min_output_chars,
            Duration::from_millis(config.reservation.expiry_ms),
        ));
        let orchestrator = TeamOrchestrator::new(
            runner.clone(),
            ledger.clone(),
            audit.clone(),
            monitor.clone(),
            config.team.clone(),
            config.limits.clone(),
            actor.clone(),
        );

        let root_cancel = CancellationToken::new();
        let sweeper = ReservationSweeper::spawn(
            ledger.clone(),
            audit.clone(),
            monitor.clone(),
            actor.clone(),
            Duration::from_millis(config.reservation.sweep_interval_ms),
            root_cancel.child_token(),
        );
        let refresh = coordinator.spawn_refresh(
            Duration::from_millis(config.coordinator.refresh_ms),
            root_cancel.child_token(),
        );

        Ok(Arc::new(Self {
            config,
            layout,
            instance,
            ledger,
            coordinator,
            controller,
            audit,
            monitor,
            ownership,
            runner,
            orchestrator,
            root_cancel,
            background: Mutex::new(vec![sweeper, refresh]),
        }))
    }

    /// Stop background tasks, clear counters, unregister the instance
    pub async fn shutdown(&self) {
        info!(instance = %self.instance, "runtime shutting down");
        self.root_cancel.cancel();
        let handles: Vec<_> = self.background.lock().expect("background lock poisoned").drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.controller.shutdown();
        self.coordinator.clear_all_active_models();
        self.coordinator.unregister();
        self.audit
            .record(AuditEvent::new(AuditAction::InstanceUnregistered, &self.instance.to_string()))
            .await;
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    pub fn monitor(&self) -> &Arc<LiveMonitor> {
        &self.monitor
    }

    fn actor(&self) -> String {
        self.instance.to_string()
    }

    /// Ownership check every workflow-scoped call passes before admission.
    /// Fails with `workflow_owned_by_other` and is never retried.
    fn ensure_workflow_ownership(&self, options: &RunOptions) -> Result<(), RuntimeError> {
        let Some(workflow_id) = &options.workflow_id else {
            return Ok(());
        };
        match self.ownership.claim(workflow_id).map_err(|e| RuntimeError::Internal(e.to_string()))? {
            ClaimOutcome::AlreadyOwned => Ok(()),
            ClaimOutcome::Claimed { transferred_from } => {
                let action = if transferred_from.is_some() {
                    AuditAction::WorkflowOwnershipTransferred
                } else {
                    AuditAction::WorkflowClaimed
                };
                let event = AuditEvent::new(action, &self.actor())
                    .with_tool(workflow_id, "workflow")
                    .with_details(serde_json::json!({ "previous_owner": transferred_from }));
                let audit = self.audit.clone();
                tokio::spawn(async move { audit.record(event).await });
                Ok(())
            }
            ClaimOutcome::OwnedBy { instance_id, pid } => Err(RuntimeError::WorkflowOwnedByOther {
                workflow_id: workflow_id.clone(),
                instance_id,
                pid,
            }),
        }
    }

    fn wait_and_poll(&self, options: &RunOptions) -> (Duration, Duration) {
        (
            Duration::from_millis(options.capacity_wait_ms.unwrap_or(self.config.limits.capacity_wait_ms)),
            Duration::from_millis(self.config.limits.capacity_poll_ms.max(1)),
        )
    }

    /// Run a single delegated task
    pub async fn subagent_run(
        &self,
        definition: &SubAgentDefinition,
        task: &str,
        options: &RunOptions,
    ) -> Result<SubAgentRunResult, RuntimeError> {
        self.ensure_workflow_ownership(options)?;

        // Child of the caller's signal: cancelling the caller cancels this
        // work unit, never the reverse
        let cancel = options.cancel_token().child_token();
        let gate = ModelGate::new(
            self.controller.clone(),
            self.coordinator.clone(),
            &definition.provider,
            &definition.model,
        );
        let (max_wait, poll) = self.wait_and_poll(options);

        let request = ReserveRequest::new("subagent_run", 1, 1)
            .with_priority(options.priority)
            .with_class(options.queue_class)
            .with_tenant(options.tenant_key.as_deref().unwrap_or(&definition.id));

        let reservation = match self
            .ledger
            .reserve_or_wait(&request, max_wait, poll, &cancel, Some(gate.clone() as Arc<dyn AdmissionGate>))
            .await
        {
            WaitOutcome::Granted(reservation) => reservation,
            WaitOutcome::TimedOut { waited, snapshot } => {
                return Err(RuntimeError::CapacityTimeout {
                    waited_ms: waited.as_millis() as u64,
                    snapshot,
                });
            }
            WaitOutcome::Evicted { snapshot } => {
                self.monitor.emit(MonitorEvent::QueueEvicted {
                    tool_name: "subagent_run".to_string(),
                });
                self.audit
                    .record(
                        AuditEvent::new(AuditAction::QueueEvicted, &self.actor())
                            .with_tool(&definition.id, "subagent_run")
                            .failed("evicted from admission queue"),
                    )
                    .await;
                return Err(RuntimeError::CapacityEvicted { snapshot });
            }
            WaitOutcome::Cancelled => return Err(RuntimeError::Cancelled),
        };

        self.monitor.emit(MonitorEvent::ReservationGranted {
            tool_name: "subagent_run".to_string(),
        });

        let result = self
            .runner
            .execute_under_reservation(definition, task, reservation, &cancel)
            .await;
        gate.release();

        self.persist_subagent_run(&result);
        self.monitor.publish(self.ledger.snapshot().await);
        Ok(result)
    }

    /// Fan a batch of tasks out with bounded per-request parallelism
    pub async fn subagent_run_parallel(
        self: &Arc<Self>,
        items: Vec<(SubAgentDefinition, String)>,
        options: &RunOptions,
    ) -> Vec<Result<SubAgentRunResult, RuntimeError>> {
        let cancel = options.cancel_token();
        let max_parallel = options
            .parallelism
            .map(RunOptions::normalize_parallelism)
            .unwrap_or(self.config.limits.max_parallel_subagents_per_request as usize)
            .min(self.config.limits.max_parallel_subagents_per_request as usize);

        let tasks: Vec<_> = items
            .into_iter()
            .map(|(definition, task)| {
                let runtime = Arc::clone(self);
                let options = RunOptions {
                    cancel: Some(cancel.clone()),
                    ..options.clone()
                };
                move || async move { runtime.subagent_run(&definition, &task, &options).await }
            })
            .collect();

        pool::run_tasks(tasks, max_parallel, &cancel)
            .await
            .into_iter()
            .map(|result| match result {
                PoolTaskResult::Completed(result) => result,
                PoolTaskResult::Cancelled => Err(RuntimeError::Cancelled),
            })
            .collect()
    }

    /// Run one team
    pub async fn team_run(
        &self,
        team: &TeamDefinition,
        task: &str,
        options: &RunOptions,
    ) -> Result<TeamRunResult, RuntimeError> {
        self.ensure_workflow_ownership(options)?;
        let gate = ModelGate::new(
            self.controller.clone(),
            self.coordinator.clone(),
            &team.provider,
            &team.model,
        );

        let result = self
            .orchestrator
            .run(team, task, options, Some(gate.clone() as Arc<dyn AdmissionGate>))
            .await?;
        gate.release();

        self.persist_team_run(&result);
        self.monitor.publish(self.ledger.snapshot().await);
        Ok(result)
    }

    /// Run several teams under one admission decision
    pub async fn team_run_parallel(
        &self,
        items: &[(&TeamDefinition, &str)],
        options: &RunOptions,
    ) -> Result<Vec<TeamRunResult>, RuntimeError> {
        self.ensure_workflow_ownership(options)?;
        let Some((first_team, _)) = items.first() else {
            return Ok(Vec::new());
        };
        let gate = ModelGate::new(
            self.controller.clone(),
            self.coordinator.clone(),
            &first_team.provider,
            &first_team.model,
        );

        let results = self
            .orchestrator
            .run_batch(items, options, Some(gate.clone() as Arc<dyn AdmissionGate>))
            .await?;
        gate.release();

        for result in &results {
            self.persist_team_run(result);
        }
        self.monitor.publish(self.ledger.snapshot().await);
        Ok(results)
    }

    /// Repeated task-step loop; the driver decides each next step
    pub async fn loop_run(
        &self,
        driver: &mut dyn LoopDriver,
        options: &RunOptions,
    ) -> Result<LoopRunResult, RuntimeError> {
        self.ensure_workflow_ownership(options)?;
        let cancel = options.cancel_token();

        let mut results: Vec<SubAgentRunResult> = Vec::new();
        let mut stopped_by = LoopStop::DriverDone;

        while let Some((definition, task)) = driver.next_step(results.last()) {
            if cancel.is_cancelled() {
                stopped_by = LoopStop::Cancelled;
                break;
            }
            let result = self.subagent_run(&definition, &task, options).await?;
            results.push(result);
        }
        if cancel.is_cancelled() {
            stopped_by = LoopStop::Cancelled;
        }

        Ok(LoopRunResult {
            iterations: results.len() as u32,
            results,
            stopped_by,
        })
    }

    // === Introspection ===

    pub async fn runtime_snapshot(&self) -> RuntimeSnapshot {
        let snapshot = self.ledger.snapshot().await;
        self.monitor.publish(snapshot.clone());
        snapshot
    }

    /// Human-readable summary of recent sub-agent runs
    pub fn subagent_status(&self) -> String {
        self.runs_status(&self.layout.subagent_runs_dir(), |value| {
            let outcome = value
                .get("outcome")
                .and_then(|o| o.get("outcome"))
                .and_then(|o| o.as_str())
                .unwrap_or("unknown");
            let id = value.get("run_id").and_then(|v| v.as_str()).unwrap_or("?");
            let latency = value.get("latency_ms").and_then(|v| v.as_u64()).unwrap_or(0);
            format!("{id}  {outcome}  {latency}ms")
        })
    }

    /// Human-readable summary of recent team runs
    pub fn team_status(&self) -> String {
        self.runs_status(&self.layout.team_runs_dir(), |value| {
            let id = value.get("run_id").and_then(|v| v.as_str()).unwrap_or("?");
            let verdict = value
                .get("judgment")
                .and_then(|j| j.get("verdict"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let members = value.get("members").and_then(|m| m.as_array()).map(|m| m.len()).unwrap_or(0);
            format!("{id}  {verdict}  {members} member(s)")
        })
    }

    fn runs_status(&self, dir: &std::path::Path, line: impl Fn(&serde_json::Value) -> String) -> String {
        // Run ids are time-ordered, so the lexicographic tail is the
        // most recent
        let files = list_json_files(dir).unwrap_or_default();
        let recent = files.iter().rev().take(10);

        let mut lines = Vec::new();
        for file in recent {
            if let Ok(Some(value)) = read_json::<serde_json::Value>(file) {
                lines.push(line(&value));
            }
        }
        if lines.is_empty() {
            "no runs recorded".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// Live peers and this instance's fair share per configured provider
    pub fn instance_status(&self) -> InstanceStatus {
        let fair_shares = self
            .config
            .coordinator
            .provider_limits
            .keys()
            .filter_map(|provider| {
                self.coordinator
                    .fair_share_for(provider)
                    .map(|share| (provider.clone(), share))
            })
            .collect();
        InstanceStatus {
            instance_id: self.instance.to_string(),
            peers: self.coordinator.peer_views(),
            fair_shares,
        }
    }

    /// Current adaptive caps per (provider, model)
    pub fn model_limits(&self) -> Vec<ModelLimitView> {
        self.controller.limits()
    }

    pub async fn audit_read(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        self.audit.read(filter).await
    }

    // === Workflow API ===

    pub async fn workflow_claim(&self, workflow_id: &str) -> Result<(), RuntimeError> {
        match self.ownership.claim(workflow_id).map_err(|e| RuntimeError::Internal(e.to_string()))? {
            ClaimOutcome::Claimed { transferred_from } => {
                let action = if transferred_from.is_some() {
                    AuditAction::WorkflowOwnershipTransferred
                } else {
                    AuditAction::WorkflowClaimed
                };
                self.audit
                    .record(
                        AuditEvent::new(action, &self.actor())
                            .with_tool(workflow_id, "workflow")
                            .with_details(serde_json::json!({ "previous_owner": transferred_from })),
                    )
                    .await;
                Ok(())
            }
            ClaimOutcome::AlreadyOwned => Ok(()),
            ClaimOutcome::OwnedBy { instance_id, pid } => Err(RuntimeError::WorkflowOwnedByOther {
                workflow_id: workflow_id.to_string(),
                instance_id,
                pid,
            }),
        }
    }

    pub async fn workflow_release(&self, workflow_id: &str) -> Result<bool, RuntimeError> {
        let released = self
            .ownership
            .release(workflow_id)
            .map_err(|e| RuntimeError::Internal(e.to_string()))?;
        if released {
            self.audit
                .record(AuditEvent::new(AuditAction::WorkflowReleased, &self.actor()).with_tool(workflow_id, "workflow"))
                .await;
        }
        Ok(released)
    }

    pub async fn workflow_force_claim(&self, workflow_id: &str) -> Result<Option<String>, RuntimeError> {
        let previous = self
            .ownership
            .force_claim(workflow_id)
            .map_err(|e| RuntimeError::Internal(e.to_string()))?;
        self.audit
            .record(
                AuditEvent::new(AuditAction::WorkflowClaimed, &self.actor())
                    .with_tool(workflow_id, "workflow")
                    .with_details(serde_json::json!({ "forced": true, "previous_owner": previous })),
            )
            .await;
        Ok(previous)
    }

    pub fn workflow_check(&self, workflow_id: &str) -> Result<OwnershipStatus, RuntimeError> {
        self.ownership
            .check(workflow_id)
            .map_err(|e| RuntimeError::Internal(e.to_string()))
    }

    pub fn workflow_list(&self) -> Result<Vec<OwnershipRecord>, RuntimeError> {
        self.ownership.list().map_err(|e| RuntimeError::Internal(e.to_string()))
    }

    // === Persistence ===

    fn persist_subagent_run(&self, result: &SubAgentRunResult) {
        let path = self.layout.subagent_run_file(&result.run_id);
        if let Err(e) = write_json_atomic(&path, result) {
            warn!(error = %e, "failed to persist sub-agent run record");
        }
    }

    fn persist_team_run(&self, result: &TeamRunResult) {
        let path = self.layout.team_run_file(&result.run_id);
        if let Err(e) = write_json_atomic(&path, result) {
            warn!(error = %e, "failed to persist team run record");
        }
    }
}
