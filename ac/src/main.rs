//! AgentCore CLI entry point
//!
//! Introspection and workflow operations against the shared workspace
//! state directory. Delegation itself is a library concern; embedders
//! construct an `AgentRuntime` with their own invoker.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use workstate::{StateLayout, list_json_files, read_json};

use agentcore::audit::{AuditAction, AuditFilter, AuditLog};
use agentcore::cli::{Cli, Command, OutputFormat, WorkflowOp};
use agentcore::config::RuntimeConfig;
use agentcore::coordinator::{InstanceCoordinator, InstanceRegistration};
use agentcore::domain::InstanceId;
use agentcore::error::RuntimeError;
use agentcore::ledger::now_ms;
use agentcore::ownership::{ClaimOutcome, OwnershipManager, OwnershipStatus};

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(64);
        }
        Err(e) => {
            // Help and version output
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    setup_logging(cli.verbose);

    let config = match RuntimeConfig::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            return ExitCode::from(65);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    match runtime.block_on(run_command(cli.command, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red());
            let code = e
                .downcast_ref::<RuntimeError>()
                .map(|re| re.exit_code())
                .unwrap_or(1);
            ExitCode::from(code.clamp(0, 255) as u8)
        }
    }
}

async fn run_command(command: Command, config: RuntimeConfig) -> Result<()> {
    let layout = StateLayout::new(&config.state_dir);

    match command {
        Command::Status { format } => {
            let instances = read_instances(&layout)?;
            match format {
                OutputFormat::Json => {
                    let runs = recent_runs(&layout)?;
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "instances": instances,
                            "recent_runs": runs,
                        }))?
                    );
                }
                OutputFormat::Text => {
                    println!("{}", "Instances".bold());
                    print_instances(&instances, &config);
                    println!();
                    println!("{}", "Recent runs".bold());
                    for line in recent_runs(&layout)? {
                        println!("  {line}");
                    }
                }
            }
        }

        Command::Instances { format } => {
            let instances = read_instances(&layout)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&instances)?),
                OutputFormat::Text => print_instances(&instances, &config),
            }
        }

        Command::Limits { format } => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config.limits)?),
            OutputFormat::Text => {
                println!("limits version:        {}", config.limits.limits_version);
                println!("total active LLM:      {}", config.limits.max_total_active_llm);
                println!("total active requests: {}", config.limits.max_total_active_requests);
                println!("subagents/request:     {}", config.limits.max_parallel_subagents_per_request);
                println!("teams/request:         {}", config.limits.max_parallel_teams_per_request);
                println!("members/team:          {}", config.limits.max_parallel_members_per_team);
                println!("orchestrations:        {}", config.limits.max_concurrent_orchestrations);
                println!("capacity wait:         {}ms", config.limits.capacity_wait_ms);
                println!("capacity poll:         {}ms", config.limits.capacity_poll_ms);
            }
        },

        Command::Audit {
            action,
            actor,
            tool,
            since,
            until,
            failed,
            limit,
            format,
        } => {
            let action = action
                .map(|s| {
                    serde_json::from_str::<AuditAction>(&format!("\"{s}\""))
                        .map_err(|_| eyre::eyre!("unknown audit action: {s}"))
                })
                .transpose()?;
            let filter = AuditFilter {
                tool_id: tool,
                action,
                actor,
                since,
                until,
                success: if failed { Some(false) } else { None },
                limit: Some(limit),
            };

            let log = AuditLog::new(layout.audit_file());
            let events = log.read(&filter).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
                OutputFormat::Text => {
                    for event in events {
                        let status = if event.success { "ok".green() } else { "failed".red() };
                        println!(
                            "{}  {}  {}  {}  {}",
                            event.timestamp_iso,
                            event.action,
                            event.actor,
                            status,
                            event.error_message.as_deref().unwrap_or(""),
                        );
                    }
                }
            }
        }

        Command::Workflow { op } => run_workflow_op(op, &layout, &config).await?,
    }

    Ok(())
}

async fn run_workflow_op(op: WorkflowOp, layout: &StateLayout, config: &RuntimeConfig) -> Result<()> {
    // Host-scoped identity: successive CLI invocations on one host agree
    let me = InstanceId::host_scoped();
    let coordinator = Arc::new(InstanceCoordinator::new(layout.clone(), me.clone(), &config.coordinator));
    coordinator.refresh_peers();
    let ownership = OwnershipManager::new(layout.clone(), me.clone(), coordinator, config.workflow.auto_claim);
    let audit = AuditLog::new(layout.audit_file());
    let actor = me.to_string();

    match op {
        WorkflowOp::Claim { workflow_id } => match ownership.claim(&workflow_id)? {
            ClaimOutcome::Claimed { transferred_from } => {
                let action = if transferred_from.is_some() {
                    AuditAction::WorkflowOwnershipTransferred
                } else {
                    AuditAction::WorkflowClaimed
                };
                audit
                    .record(
                        agentcore::audit::AuditEvent::new(action, &actor)
                            .with_tool(&workflow_id, "workflow")
                            .with_details(serde_json::json!({ "previous_owner": transferred_from })),
                    )
                    .await;
                println!("claimed {workflow_id}");
            }
            ClaimOutcome::AlreadyOwned => println!("already owned: {workflow_id}"),
            ClaimOutcome::OwnedBy { instance_id, pid } => {
                return Err(RuntimeError::WorkflowOwnedByOther {
                    workflow_id,
                    instance_id,
                    pid,
                }
                .into());
            }
        },

        WorkflowOp::Release { workflow_id } => {
            if ownership.release(&workflow_id)? {
                audit
                    .record(
                        agentcore::audit::AuditEvent::new(AuditAction::WorkflowReleased, &actor)
                            .with_tool(&workflow_id, "workflow"),
                    )
                    .await;
                println!("released {workflow_id}");
            } else {
                println!("not owned: {workflow_id}");
            }
        }

        WorkflowOp::Check { workflow_id } => match ownership.check(&workflow_id)? {
            OwnershipStatus::Owned => println!("{workflow_id}: owned by this host"),
            OwnershipStatus::NotOwned => println!("{workflow_id}: unowned"),
            OwnershipStatus::OwnedByOther { instance_id, pid } => {
                return Err(RuntimeError::WorkflowOwnedByOther {
                    workflow_id,
                    instance_id,
                    pid,
                }
                .into());
            }
        },

        WorkflowOp::ForceClaim { workflow_id } => {
            let previous = ownership.force_claim(&workflow_id)?;
            audit
                .record(
                    agentcore::audit::AuditEvent::new(AuditAction::WorkflowClaimed, &actor)
                        .with_tool(&workflow_id, "workflow")
                        .with_details(serde_json::json!({ "forced": true, "previous_owner": previous })),
                )
                .await;
            match previous {
                Some(previous) => println!("claimed {workflow_id} (displaced {previous})"),
                None => println!("claimed {workflow_id}"),
            }
        }

        WorkflowOp::List => {
            for record in ownership.list()? {
                let marker = if record.owned_by(&me) { "*" } else { " " };
                println!("{marker} {}  {}", record.workflow_id, record.owner_instance_id);
            }
        }
    }
    Ok(())
}

fn read_instances(layout: &StateLayout) -> Result<Vec<InstanceRegistration>> {
    let mut instances = Vec::new();
    for file in list_json_files(&layout.instances_dir())? {
        if let Some(registration) = read_json::<InstanceRegistration>(&file).context("unreadable registration")? {
            instances.push(registration);
        }
    }
    instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    Ok(instances)
}

fn print_instances(instances: &[InstanceRegistration], config: &RuntimeConfig) {
    if instances.is_empty() {
        println!("  no registered instances");
        return;
    }
    let now = now_ms();
    for instance in instances {
        let age_ms = now.saturating_sub(instance.heartbeat_ms);
        let live = age_ms <= config.coordinator.dead_after_ms;
        let marker = if live { "live".green() } else { "dead".red() };
        let load: Vec<String> = instance
            .active_models
            .iter()
            .map(|(provider, count)| format!("{provider}={count}"))
            .collect();
        println!(
            "  {}  {}  heartbeat {}s ago  [{}]",
            instance.instance_id,
            marker,
            age_ms / 1000,
            load.join(", "),
        );
    }
}

fn recent_runs(layout: &StateLayout) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for (dir, kind) in [(layout.subagent_runs_dir(), "subagent"), (layout.team_runs_dir(), "team")] {
        let files = list_json_files(&dir)?;
        for file in files.iter().rev().take(5) {
            if let Some(value) = read_json::<serde_json::Value>(file)? {
                let id = value.get("run_id").and_then(|v| v.as_str()).unwrap_or("?");
                let detail = value
                    .get("judgment")
                    .and_then(|j| j.get("verdict"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .or_else(|| {
                        value
                            .get("outcome")
                            .and_then(|o| o.get("outcome"))
                            .and_then(|o| o.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "unknown".to_string());
                lines.push(format!("{kind}  {id}  {detail}"));
            }
        }
    }
    if lines.is_empty() {
        lines.push("no runs recorded".to_string());
    }
    Ok(lines)
}
