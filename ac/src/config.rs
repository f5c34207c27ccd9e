//! Runtime configuration types and loading
//!
//! Configuration layers, later wins:
//! 1. compiled defaults
//! 2. YAML file (explicit `--config` path, else `.agentcore.yml` in the
//!    working directory, else the user config dir)
//! 3. `AGENTCORE_*` environment variables
//!
//! The `stable-runtime-profile` flag applies a conservative preset before
//! the env layer, so explicit env values still win over the preset.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Hard caps for the capacity ledger, immutable per run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLimits {
    /// Max concurrent LLM calls across the whole process
    #[serde(rename = "max-total-active-llm")]
    pub max_total_active_llm: u32,

    /// Max concurrent delegated requests across the whole process
    #[serde(rename = "max-total-active-requests")]
    pub max_total_active_requests: u32,

    /// Sub-agent fan-out allowed within one delegated request
    #[serde(rename = "max-parallel-subagents-per-request")]
    pub max_parallel_subagents_per_request: u32,

    /// Team fan-out allowed within one delegated request
    #[serde(rename = "max-parallel-teams-per-request")]
    pub max_parallel_teams_per_request: u32,

    /// Member fan-out allowed within one team
    #[serde(rename = "max-parallel-members-per-team")]
    pub max_parallel_members_per_team: u32,

    /// Independent cap on concurrently running team orchestrations
    #[serde(rename = "max-concurrent-orchestrations")]
    pub max_concurrent_orchestrations: u32,

    /// Default bound on waiting for capacity
    #[serde(rename = "capacity-wait-ms")]
    pub capacity_wait_ms: u64,

    /// Poll interval while waiting for capacity
    #[serde(rename = "capacity-poll-ms")]
    pub capacity_poll_ms: u64,

    /// Change-tracking tag carried into every snapshot
    #[serde(rename = "limits-version")]
    pub limits_version: String,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_total_active_llm: 8,
            max_total_active_requests: 16,
            max_parallel_subagents_per_request: 4,
            max_parallel_teams_per_request: 2,
            max_parallel_members_per_team: 4,
            max_concurrent_orchestrations: 4,
            capacity_wait_ms: 60_000,
            capacity_poll_ms: 250,
            limits_version: "v1".to_string(),
        }
    }
}

/// Pending-queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue length above which the worst entry is evicted
    #[serde(rename = "max-length")]
    pub max_length: usize,

    /// Effective-age credit granted each time an entry is skipped
    #[serde(rename = "skip-boost-ms")]
    pub skip_boost_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_length: 64,
            skip_boost_ms: 2_000,
        }
    }
}

/// Reservation lifecycle tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Reservations not released within this window are reclaimed
    #[serde(rename = "expiry-ms")]
    pub expiry_ms: u64,

    /// Sweeper wake interval
    #[serde(rename = "sweep-interval-ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 300_000,
            sweep_interval_ms: 30_000,
        }
    }
}

/// Cross-instance coordination tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Background refresh interval for peer state
    #[serde(rename = "refresh-ms")]
    pub refresh_ms: u64,

    /// Peers silent for longer than this are considered dead
    #[serde(rename = "dead-after-ms")]
    pub dead_after_ms: u64,

    /// Global concurrency limit per provider, shared across instances
    #[serde(rename = "provider-limits")]
    pub provider_limits: HashMap<String, u32>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_ms: 2_000,
            dead_after_ms: 30_000,
            provider_limits: HashMap::new(),
        }
    }
}

/// Adaptive rate controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Observations older than this are forgotten
    #[serde(rename = "decay-ms")]
    pub decay_ms: u64,

    /// Consecutive clean successes required before additive increase
    #[serde(rename = "success-threshold")]
    pub success_threshold: u32,

    /// Ceiling used when the provider declares no limit
    #[serde(rename = "default-ceiling")]
    pub default_ceiling: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            decay_ms: 480_000,
            success_threshold: 5,
            default_ceiling: 8,
        }
    }
}

/// Retry/backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts for ordinary retryable errors
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initial-delay-ms")]
    pub initial_delay_ms: u64,

    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    pub multiplier: f64,

    /// Attempts when the error is rate_limited
    #[serde(rename = "rate-limit-max-attempts")]
    pub rate_limit_max_attempts: u32,

    /// Delay cap for rate-limited retries
    #[serde(rename = "rate-limit-max-delay-ms")]
    pub rate_limit_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 15_000,
            multiplier: 2.0,
            rate_limit_max_attempts: 6,
            rate_limit_max_delay_ms: 90_000,
        }
    }
}

/// Team orchestration defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    /// Communication rounds between initial phase and judge
    #[serde(rename = "communication-rounds")]
    pub communication_rounds: u32,

    /// Retries of degraded outputs inside a communication round
    #[serde(rename = "max-retry-rounds")]
    pub max_retry_rounds: u32,

    /// Per-member retry budget for retryable failures
    #[serde(rename = "member-retry-budget")]
    pub member_retry_budget: u32,

    /// Minimum output length before a result counts as empty
    #[serde(rename = "min-output-chars")]
    pub min_output_chars: usize,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            communication_rounds: 2,
            max_retry_rounds: 2,
            member_retry_budget: 1,
            min_output_chars: 16,
        }
    }
}

/// Workflow ownership behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Transfer ownership from dead instances automatically
    #[serde(rename = "auto-claim")]
    pub auto_claim: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { auto_claim: true }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub limits: RuntimeLimits,
    pub queue: QueueConfig,
    pub reservation: ReservationConfig,
    pub coordinator: CoordinatorConfig,
    pub adaptive: AdaptiveConfig,
    pub retry: RetryConfig,
    pub team: TeamConfig,
    pub workflow: WorkflowConfig,

    /// Workspace-relative shared state directory
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,

    /// Conservative preset: sequential teams, no communication rounds
    #[serde(rename = "stable-runtime-profile")]
    pub stable_runtime_profile: bool,
}

impl RuntimeConfig {
    /// Load configuration with the fallback chain, then apply env overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_file_layer(config_path)?;

        if config.state_dir.as_os_str().is_empty() {
            config.state_dir = PathBuf::from(".agentcore");
        }

        if config.stable_runtime_profile {
            config.apply_stable_profile();
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn load_file_layer(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".agentcore.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentcore").join("agentcore.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Conservative preset: halve concurrency, run teams sequentially,
    /// skip communication rounds
    pub fn apply_stable_profile(&mut self) {
        self.limits.max_total_active_llm = (self.limits.max_total_active_llm / 2).max(1);
        self.limits.max_total_active_requests = (self.limits.max_total_active_requests / 2).max(1);
        self.limits.max_parallel_teams_per_request = 1;
        self.limits.max_concurrent_orchestrations = (self.limits.max_concurrent_orchestrations / 2).max(1);
        self.team.communication_rounds = 0;
        self.team.max_retry_rounds = 0;
        self.limits.limits_version = format!("{}-stable", self.limits.limits_version);
    }

    /// Apply `AGENTCORE_*` environment overrides; env always wins
    pub fn apply_env_overrides(&mut self) {
        env_override_u32("AGENTCORE_MAX_TOTAL_ACTIVE_LLM", &mut self.limits.max_total_active_llm);
        env_override_u32(
            "AGENTCORE_MAX_TOTAL_ACTIVE_REQUESTS",
            &mut self.limits.max_total_active_requests,
        );
        env_override_u32(
            "AGENTCORE_MAX_PARALLEL_SUBAGENTS",
            &mut self.limits.max_parallel_subagents_per_request,
        );
        env_override_u32(
            "AGENTCORE_MAX_PARALLEL_TEAMS",
            &mut self.limits.max_parallel_teams_per_request,
        );
        env_override_u32(
            "AGENTCORE_MAX_PARALLEL_MEMBERS",
            &mut self.limits.max_parallel_members_per_team,
        );
        env_override_u32(
            "AGENTCORE_MAX_CONCURRENT_ORCHESTRATIONS",
            &mut self.limits.max_concurrent_orchestrations,
        );
        env_override_u64("AGENTCORE_CAPACITY_WAIT_MS", &mut self.limits.capacity_wait_ms);
        env_override_u64("AGENTCORE_CAPACITY_POLL_MS", &mut self.limits.capacity_poll_ms);
        env_override_u32(
            "AGENTCORE_RATE_LIMIT_MAX_ATTEMPTS",
            &mut self.retry.rate_limit_max_attempts,
        );
        env_override_u64("AGENTCORE_ADAPTIVE_DECAY_MS", &mut self.adaptive.decay_ms);
        env_override_u32(
            "AGENTCORE_ADAPTIVE_SUCCESS_THRESHOLD",
            &mut self.adaptive.success_threshold,
        );

        if let Ok(v) = std::env::var("AGENTCORE_STATE_DIR")
            && !v.is_empty()
        {
            self.state_dir = PathBuf::from(v);
        }
    }
}

fn env_override_u32(name: &str, target: &mut u32) {
    if let Ok(v) = std::env::var(name)
        && let Ok(parsed) = v.trim().parse()
    {
        *target = parsed;
    }
}

fn env_override_u64(name: &str, target: &mut u64) {
    if let Ok(v) = std::env::var(name)
        && let Ok(parsed) = v.trim().parse()
    {
        *target = parsed;
    }
}
