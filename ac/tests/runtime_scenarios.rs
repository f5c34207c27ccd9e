//! End-to-end scenarios through the public runtime API

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use agentcore::audit::{AuditAction, AuditFilter};
use agentcore::config::RuntimeConfig;
use agentcore::dispatch::AgentRuntime;
use agentcore::domain::{RunOptions, TaskOutcome};
use agentcore::llm::{FnInvoker, InvokeResponse};
use agentcore::ownership::OwnershipStatus;
use agentcore::subagent::SubAgentDefinition;
use agentcore::team::{MemberDefinition, TeamDefinition, Verdict};

const GOOD: &str = "\
SUMMARY: finished
CLAIM: the work holds up
EVIDENCE:
- ran the checks
RESULT:
Everything verified.
NEXT_STEP: proceed
CONFIDENCE: 0.9
";

fn config_in(dir: &std::path::Path) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.state_dir = dir.join("state");
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.team.communication_rounds = 0;
    config.team.min_output_chars = 8;
    config
}

fn definition(id: &str) -> SubAgentDefinition {
    SubAgentDefinition::new(id, "Do the work", "anthropic", "sonnet")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_under_pressure_runs_all_four() {
    let temp = tempdir().unwrap();
    let mut config = config_in(temp.path());
    config.limits.max_total_active_llm = 2;
    config.limits.max_total_active_requests = 8;

    let current = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let (current_in, peak_in) = (current.clone(), peak.clone());
    let invoker = FnInvoker::new(move |_| {
        let now = current_in.fetch_add(1, Ordering::SeqCst) + 1;
        peak_in.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(40));
        current_in.fetch_sub(1, Ordering::SeqCst);
        Ok(InvokeResponse::text(GOOD))
    });

    let runtime = AgentRuntime::start(config, Arc::new(invoker)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let runtime = runtime.clone();
        handles.push(tokio::spawn(async move {
            let options = RunOptions {
                capacity_wait_ms: Some(10_000),
                ..Default::default()
            };
            runtime.subagent_run(&definition(&format!("w{i}")), "task", &options).await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.outcome, TaskOutcome::Success);
    }

    // Two slots meant at most two in flight, and nothing was evicted
    assert!(peak.load(Ordering::SeqCst) <= 2);
    let snapshot = runtime.runtime_snapshot().await;
    assert_eq!(snapshot.queue_evictions, 0);
    assert_eq!(snapshot.active_llm, 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn ownership_transfer_after_owner_death() {
    let temp = tempdir().unwrap();

    // First instance: claims the workflow, then "dies" (no heartbeat)
    let mut config1 = config_in(temp.path());
    config1.coordinator.dead_after_ms = 100;
    config1.coordinator.refresh_ms = 3_600_000;
    let instance1 = AgentRuntime::start(config1.clone(), Arc::new(FnInvoker::always(GOOD)))
        .await
        .unwrap();
    instance1.workflow_claim("wf-handoff").await.unwrap();
    let dead_owner = instance1.instance_id().to_string();

    // Stop the background tasks without unregistering, like a crash
    // (the registration record stays behind with a stale heartbeat)
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second instance with auto-claim takes over via a team run
    let instance2 = AgentRuntime::start(config1, Arc::new(FnInvoker::always(GOOD)))
        .await
        .unwrap();

    let team = TeamDefinition::new("handoff", "anthropic", "sonnet")
        .with_member(MemberDefinition::new("a", "Worker"));
    let options = RunOptions {
        workflow_id: Some("wf-handoff".to_string()),
        ..Default::default()
    };
    let result = instance2.team_run(&team, "continue the work", &options).await.unwrap();
    assert_eq!(result.judgment.verdict, Verdict::Trusted);

    assert_eq!(instance2.workflow_check("wf-handoff").unwrap(), OwnershipStatus::Owned);

    // The transfer is in the audit log with the prior owner's id
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = instance2
        .audit_read(&AuditFilter {
            action: Some(AuditAction::WorkflowOwnershipTransferred),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].details["previous_owner"], dead_owner);

    instance2.shutdown().await;
    instance1.shutdown().await;
}

#[tokio::test]
async fn cancellation_mid_flight_leaks_nothing() {
    let temp = tempdir().unwrap();
    let mut config = config_in(temp.path());
    config.reservation.sweep_interval_ms = 50;

    let invoker = FnInvoker::always(GOOD).with_latency(Duration::from_secs(60));
    let runtime = AgentRuntime::start(config, Arc::new(invoker)).await.unwrap();

    let cancel = CancellationToken::new();
    let team = TeamDefinition::new("big", "anthropic", "sonnet")
        .with_member(MemberDefinition::new("m1", "r"))
        .with_member(MemberDefinition::new("m2", "r"))
        .with_member(MemberDefinition::new("m3", "r"))
        .with_member(MemberDefinition::new("m4", "r"));
    let options = RunOptions {
        cancel: Some(cancel.clone()),
        ..Default::default()
    };

    let run = {
        let runtime = runtime.clone();
        let team = team.clone();
        tokio::spawn(async move { runtime.team_run(&team, "work", &options).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.members.len(), 4);
    assert!(result.members.iter().all(|m| m.outcome == TaskOutcome::Cancelled));

    // All reservations released promptly, no counter leak
    let snapshot = runtime.runtime_snapshot().await;
    assert_eq!(snapshot.active_llm, 0);
    assert_eq!(snapshot.active_requests, 0);
    assert_eq!(snapshot.reserved_llm, 0);
    assert_eq!(snapshot.reserved_requests, 0);
    assert_eq!(snapshot.active_orchestrations, 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn audit_survives_process_boundaries() {
    let temp = tempdir().unwrap();

    {
        let runtime = AgentRuntime::start(config_in(temp.path()), Arc::new(FnInvoker::always(GOOD)))
            .await
            .unwrap();
        runtime
            .subagent_run(&definition("w"), "task", &RunOptions::default())
            .await
            .unwrap();
        runtime.shutdown().await;
    }

    // A fresh runtime over the same state dir sees the history
    let runtime = AgentRuntime::start(config_in(temp.path()), Arc::new(FnInvoker::always(GOOD)))
        .await
        .unwrap();
    let events = runtime
        .audit_read(&AuditFilter {
            action: Some(AuditAction::SubagentSuccess),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    let status = runtime.subagent_status();
    assert!(status.contains("success"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn two_instances_share_one_workspace() {
    let temp = tempdir().unwrap();
    let mut config = config_in(temp.path());
    config.coordinator.provider_limits.insert("anthropic".to_string(), 8);
    config.coordinator.refresh_ms = 30;

    let instance1 = AgentRuntime::start(config.clone(), Arc::new(FnInvoker::always(GOOD)))
        .await
        .unwrap();
    let instance2 = AgentRuntime::start(config, Arc::new(FnInvoker::always(GOOD)))
        .await
        .unwrap();

    // Let the refresh cycles observe each other
    tokio::time::sleep(Duration::from_millis(150)).await;

    let status = instance1.instance_status();
    assert_eq!(status.peers.len(), 2);
    // ceil(8/2) = 4 each
    assert_eq!(status.fair_shares.get("anthropic").copied(), Some(4));

    instance2.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // After the peer unregisters, the share returns to the full limit
    let status = instance1.instance_status();
    assert_eq!(status.fair_shares.get("anthropic").copied(), Some(8));

    instance1.shutdown().await;
}
