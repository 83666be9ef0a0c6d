use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::ResourceLimits;

/// Top-level Strata configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// MOISE organization. Without one every step is allowed.
    #[serde(default)]
    pub organization: Option<OrganizationSpec>,
}

/// What to do with a step whose branch fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Mark the branch failed. Siblings keep running.
    #[default]
    Fail,
    /// Re-attempt the failed step up to `max_retries` times.
    Retry,
}

/// What to do with a step the MOISE gate denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDenialPolicy {
    /// Record the step as skipped and move on.
    #[default]
    Skip,
    /// Fail the step.
    Fail,
    /// Log the denial and execute anyway.
    Proceed,
}

/// Per-run execution settings. Copied into every run's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub recovery_strategy: RecoveryStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: usize,
    #[serde(default)]
    pub on_gate_denied: GateDenialPolicy,
    #[serde(default = "default_strategy")]
    pub default_strategy: String,
    /// Agent identity presented to the MOISE gate.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            recovery_strategy: RecoveryStrategy::default(),
            max_retries: default_max_retries(),
            max_node_visits: default_max_node_visits(),
            on_gate_denied: GateDenialPolicy::default(),
            default_strategy: default_strategy(),
            agent_id: None,
            team_id: None,
            limits: ResourceLimits::default(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_max_node_visits() -> usize { 5 }
fn default_strategy() -> String { "deterministic".to_string() }

/// Behaviour when the telemetry buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Refuse the incoming event.
    #[default]
    DropNewest,
    /// Evict the oldest buffered event.
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default = "default_true")]
    pub drop_on_overload: bool,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    #[serde(default = "default_overhead_threshold_ms")]
    pub overhead_threshold_ms: f64,
    #[serde(default)]
    pub sampling: SamplingConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_buffer_size: default_max_buffer_size(),
            drop_on_overload: true,
            backpressure: BackpressurePolicy::default(),
            overhead_threshold_ms: default_overhead_threshold_ms(),
            sampling: SamplingConfig::default(),
        }
    }
}

fn default_true() -> bool { true }
fn default_batch_size() -> usize { 50 }
fn default_flush_interval_ms() -> u64 { 1000 }
fn default_max_buffer_size() -> usize { 1000 }
fn default_overhead_threshold_ms() -> f64 { 5.0 }

/// Sampling rate per event category, each in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_rate")]
    pub performance: f64,
    #[serde(default = "default_rate")]
    pub health: f64,
    #[serde(default = "default_rate")]
    pub business: f64,
    #[serde(default = "default_rate")]
    pub safety: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            performance: default_rate(),
            health: default_rate(),
            business: default_rate(),
            safety: default_rate(),
        }
    }
}

fn default_rate() -> f64 { 1.0 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            recent_capacity: default_recent_capacity(),
        }
    }
}

fn default_recent_capacity() -> usize { 500 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl StorageConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(rest) = self.path.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(&self.path)
    }
}

fn default_storage_path() -> String { "~/.strata/strata.db".to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long tier3 waits for in-flight steps.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_drain_timeout_ms() -> u64 { 5000 }

/// How much finished work stays in memory once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Terminal runs kept live for status queries and waiters. Older ones
    /// are answered from persistence.
    #[serde(default = "default_finished_runs")]
    pub finished_runs: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            finished_runs: default_finished_runs(),
        }
    }
}

fn default_finished_runs() -> usize { 256 }

/// MOISE+ style organization: roles, their permissions, and team membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationSpec {
    #[serde(default)]
    pub roles: HashMap<String, RoleSpec>,
    #[serde(default)]
    pub teams: HashMap<String, TeamSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Strategy names the role may run. `*` allows all.
    #[serde(default)]
    pub strategies: Vec<String>,
    /// Tool names the role may invoke. `*` allows all.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub prohibited_strategies: Vec<String>,
    #[serde(default)]
    pub prohibited_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamSpec {
    /// agent id -> role names
    #[serde(default)]
    pub members: HashMap<String, Vec<String>>,
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrataError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| StrataError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.telemetry;
        for (name, rate) in [
            ("performance", t.sampling.performance),
            ("health", t.sampling.health),
            ("business", t.sampling.business),
            ("safety", t.sampling.safety),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(StrataError::Validation(format!(
                    "telemetry.sampling.{} = {} is outside [0, 1]",
                    name, rate
                )));
            }
        }
        if t.batch_size == 0 {
            return Err(StrataError::Validation(
                "telemetry.batch_size must be at least 1".into(),
            ));
        }
        if t.max_buffer_size < t.batch_size {
            return Err(StrataError::Validation(format!(
                "telemetry.max_buffer_size ({}) is smaller than batch_size ({})",
                t.max_buffer_size, t.batch_size
            )));
        }
        if self.execution.max_node_visits == 0 {
            return Err(StrataError::Validation(
                "execution.max_node_visits must be at least 1".into(),
            ));
        }
        if self.retention.finished_runs == 0 {
            return Err(StrataError::Validation(
                "retention.finished_runs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // keep unset references verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
