use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::traits::Tool;

/// Variable and blackboard maps. Values are plain JSON trees.
pub type VarMap = HashMap<String, Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Unique run identifier.
    RunId
);
string_id!(
    /// Unique swarm identifier.
    SwarmId
);
string_id!(
    /// Unique branch identifier.
    BranchId
);

/// The three cooperating responsibility layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tier1 => write!(f, "tier1"),
            Self::Tier2 => write!(f, "tier2"),
            Self::Tier3 => write!(f, "tier3"),
        }
    }
}

// ── Routine graph ───────────────────────────────────────────────

/// A routine graph as handed to the engine. The `definition` is only
/// interpreted by the navigator registered for `graph_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub graph_type: String,
    #[serde(default)]
    pub definition: Value,
    /// Strategy used for nodes that do not name one, and for fallback runs.
    #[serde(default)]
    pub default_strategy: Option<String>,
}

/// Position within a routine graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    routine_id: String,
    node_id: String,
}

impl Location {
    pub fn new(routine_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            routine_id: routine_id.into(),
            node_id: node_id.into(),
        }
    }

    pub fn routine_id(&self) -> &str {
        &self.routine_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.routine_id, self.node_id)
    }
}

/// Node roles a navigator can report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    #[default]
    Task,
    ExclusiveGateway,
    ParallelGateway,
    Join,
    End,
}

impl NodeKind {
    /// Whether the node runs a strategy when visited.
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Task)
    }
}

/// Variable names flowing into and out of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoNames {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// What a navigator knows about a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInfo {
    pub node_id: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    /// Variable names passed into the node.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output keys the node is declared to produce.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Static input merged under the resolved variables.
    #[serde(default)]
    pub config: Value,
}

// ── Context ─────────────────────────────────────────────────────

/// A named variable scope. Scopes are ordered outermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

/// Non-owning link from a run back to the swarm that seeded it.
///
/// Only the swarm id and a snapshot of its goal and budget are kept; the run
/// never holds the swarm itself and may diverge from its live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentLink {
    pub swarm_id: SwarmId,
    pub goal: String,
    pub resources: SwarmResources,
    /// Read-mostly knowledge shared by the swarm at seeding time.
    #[serde(default)]
    pub shared_knowledge: Vec<Value>,
}

/// Mutable state a run or a branch operates on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub variables: VarMap,
    pub blackboard: VarMap,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub parent: Option<ParentLink>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(variables: VarMap) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    /// Full structural copy: every nested object and array is duplicated, so
    /// mutations on the copy can never be observed through `self`.
    ///
    /// Context values are JSON trees, which rules out shared handles and
    /// function values. Timestamps are stored as RFC 3339 strings.
    pub fn isolated_copy(&self) -> Self {
        Self {
            variables: self.variables.clone(),
            blackboard: self.blackboard.clone(),
            scopes: self.scopes.clone(),
            parent: self.parent.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn push_scope(&mut self, name: impl Into<String>) -> &Scope {
        let parent_id = self.scopes.last().map(|s| s.id.clone());
        self.scopes.push(Scope {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            parent_id,
        });
        // just pushed
        &self.scopes[self.scopes.len() - 1]
    }

    pub fn pop_scope(&mut self) -> Option<Scope> {
        self.scopes.pop()
    }
}

// ── Resources ───────────────────────────────────────────────────

/// Canonical resource usage shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub tokens: u64,
    pub credits: u64,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

const TOKEN_KEYS: &[&str] = &[
    "tokens",
    "tokensUsed",
    "tokens_used",
    "totalTokens",
    "total_tokens",
];
const CREDIT_KEYS: &[&str] = &["credits", "creditsUsed", "credits_used", "cost", "cost_credits"];
const DURATION_KEYS: &[&str] = &[
    "duration",
    "durationMs",
    "duration_ms",
    "elapsed_ms",
    "timeMs",
    "time",
];

impl ResourceUsage {
    pub fn new(tokens: u64, credits: u64, duration_ms: u64) -> Self {
        Self {
            tokens,
            credits,
            duration_ms,
        }
    }

    /// Normalize a strategy's native usage report into the canonical shape.
    ///
    /// Unknown or missing fields count as zero. Numeric strings are accepted.
    pub fn normalize(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::default();
        };

        let tokens = first_number(obj, TOKEN_KEYS).unwrap_or_else(|| {
            let input = read_number(obj.get("input_tokens")).unwrap_or(0);
            let output = read_number(obj.get("output_tokens")).unwrap_or(0);
            input + output
        });

        Self {
            tokens,
            credits: first_number(obj, CREDIT_KEYS).unwrap_or(0),
            duration_ms: first_number(obj, DURATION_KEYS).unwrap_or(0),
        }
    }

    /// Add another usage report into this one.
    pub fn accumulate(&mut self, other: &ResourceUsage) {
        self.tokens = self.tokens.saturating_add(other.tokens);
        self.credits = self.credits.saturating_add(other.credits);
        self.duration_ms = self.duration_ms.saturating_add(other.duration_ms);
    }

    pub fn is_zero(&self) -> bool {
        self.tokens == 0 && self.credits == 0 && self.duration_ms == 0
    }
}

fn first_number(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| read_number(obj.get(*k)))
}

fn read_number(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f.round() as u64)
            })
        }
        _ => None,
    }
}

/// Optional per-run budgets. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_credits: Option<u64>,
    #[serde(default)]
    pub max_time_ms: Option<u64>,
}

impl ResourceLimits {
    /// Describe the first limit exceeded by `usage` after `elapsed_ms` of wall time.
    pub fn exceeded(&self, usage: &ResourceUsage, elapsed_ms: u64) -> Option<String> {
        if let Some(max) = self.max_credits {
            if usage.credits > max {
                return Some(format!("credits {} > max {}", usage.credits, max));
            }
        }
        if let Some(max) = self.max_tokens {
            if usage.tokens > max {
                return Some(format!("tokens {} > max {}", usage.tokens, max));
            }
        }
        if let Some(max) = self.max_time_ms {
            if elapsed_ms > max {
                return Some(format!("elapsed {}ms > max {}ms", elapsed_ms, max));
            }
        }
        None
    }
}

// ── Run lifecycle ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Uninitialized,
    Loading,
    Ready,
    Running,
    Paused,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Allowed transitions. Terminal states have none.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() || *self == next {
            return false;
        }
        match next {
            Failed | Cancelled => true,
            Loading => *self == Uninitialized,
            Ready => *self == Loading,
            Running => matches!(self, Ready | Paused | Suspended),
            Paused | Suspended => *self == Running,
            Completed => matches!(self, Running | Ready),
            Uninitialized => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Loading => "LOADING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress counters exposed in status queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub current_step: Option<String>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub percent_complete: f64,
}

/// Tier2 working state for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub routine_id: String,
    pub user_id: String,
    pub context: RunContext,
    pub current_location: Option<Location>,
    /// Accumulated step outputs.
    pub outputs: VarMap,
    pub resource_usage: ResourceUsage,
    /// Completed step ids, each at most once, in completion order.
    pub completed_steps: Vec<String>,
    pub inputs: VarMap,
    pub config: ExecutionConfig,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        run_id: RunId,
        routine_id: impl Into<String>,
        user_id: impl Into<String>,
        inputs: VarMap,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            run_id,
            routine_id: routine_id.into(),
            user_id: user_id.into(),
            context: RunContext::with_variables(inputs.clone()),
            current_location: None,
            outputs: VarMap::new(),
            resource_usage: ResourceUsage::default(),
            completed_steps: Vec::new(),
            inputs,
            config,
            started_at: Utc::now(),
        }
    }

    /// Record a completed step id. Returns false if it was already recorded.
    pub fn mark_step_completed(&mut self, step_id: &str) -> bool {
        if self.completed_steps.iter().any(|s| s == step_id) {
            return false;
        }
        self.completed_steps.push(step_id.to_string());
        true
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// One execution instance of a routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub routine_id: String,
    pub user_id: String,
    #[serde(default)]
    pub swarm_id: Option<SwarmId>,
    pub state: RunState,
    pub execution: ExecutionContext,
    pub progress: RunProgress,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(execution: ExecutionContext) -> Self {
        let now = Utc::now();
        Self {
            id: execution.run_id.clone(),
            routine_id: execution.routine_id.clone(),
            user_id: execution.user_id.clone(),
            swarm_id: execution.context.parent.as_ref().map(|p| p.swarm_id.clone()),
            state: RunState::Uninitialized,
            execution,
            progress: RunProgress::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.execution.context
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.execution.config.limits
    }

    pub fn usage(&self) -> &ResourceUsage {
        &self.execution.resource_usage
    }
}

// ── Steps ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Capability set of an execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Conversational,
    Reasoning,
    Deterministic,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversational => "conversational",
            Self::Reasoning => "reasoning",
            Self::Deterministic => "deterministic",
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conversational" => Ok(Self::Conversational),
            "reasoning" => Ok(Self::Reasoning),
            "deterministic" => Ok(Self::Deterministic),
            other => Err(format!("unknown strategy kind: {}", other)),
        }
    }
}

/// Request to execute one step in tier3.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
    pub step_id: String,
    pub run_id: RunId,
    pub strategy: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl StepInput {
    pub fn new(
        run_id: RunId,
        step_id: impl Into<String>,
        strategy: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            run_id,
            strategy: strategy.into(),
            tool_name: None,
            input,
            agent_id: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_name = Some(tool.into());
        self
    }
}

/// Outcome of one step. Failures are carried here, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub strategy: String,
    pub success: bool,
    /// Not executed, e.g. denied by the organization gate.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub output: Value,
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(
        step_id: impl Into<String>,
        strategy: impl Into<String>,
        output: Value,
        resource_usage: ResourceUsage,
    ) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            strategy: strategy.into(),
            success: true,
            skipped: false,
            output,
            resource_usage,
            error: None,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn failure(
        step_id: impl Into<String>,
        strategy: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            strategy: strategy.into(),
            success: false,
            skipped: false,
            output: Value::Null,
            resource_usage: ResourceUsage::default(),
            error: Some(error.into()),
            started_at: now,
            completed_at: now,
        }
    }

    pub fn skipped(
        step_id: impl Into<String>,
        strategy: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            skipped: true,
            ..Self::failure(step_id, strategy, reason)
        }
    }

    pub fn status(&self) -> StepStatus {
        if self.skipped {
            StepStatus::Skipped
        } else if self.success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        }
    }

    /// Output as key/value pairs. Non-object outputs land under `result`.
    pub fn output_entries(&self) -> VarMap {
        match &self.output {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Value::Null => VarMap::new(),
            other => VarMap::from([("result".to_string(), other.clone())]),
        }
    }
}

// ── Branches ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BranchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for BranchState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown branch state: {}", other)),
        }
    }
}

/// An isolated execution path spawned at a gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: BranchId,
    pub run_id: RunId,
    pub parent_step_id: String,
    /// Steps in program order. Filled from the navigator when empty.
    pub steps: Vec<Location>,
    pub state: BranchState,
    pub parallel: bool,
    pub index: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of planning a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub total_steps: usize,
    pub parallel_opportunities: Vec<ParallelOpportunity>,
    /// True when the graph format could not be analyzed.
    pub fallback: bool,
}

/// A gateway with more than one viable outgoing path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelOpportunity {
    pub location: Location,
    pub branch_count: usize,
}

// ── Persistence records ─────────────────────────────────────────

/// Persisted run status set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistedRunStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl From<RunState> for PersistedRunStatus {
    fn from(state: RunState) -> Self {
        match state {
            RunState::Uninitialized | RunState::Loading | RunState::Ready => Self::Scheduled,
            RunState::Running | RunState::Paused | RunState::Suspended => Self::InProgress,
            RunState::Completed => Self::Completed,
            RunState::Failed => Self::Failed,
            RunState::Cancelled => Self::Cancelled,
        }
    }
}

impl PersistedRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::str::FromStr for PersistedRunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(Self::Scheduled),
            "InProgress" => Ok(Self::InProgress),
            "Completed" => Ok(Self::Completed),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Persisted step status set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistedStepStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl From<StepStatus> for PersistedStepStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Pending | StepStatus::Running => Self::InProgress,
            StepStatus::Completed => Self::Completed,
            StepStatus::Failed => Self::Failed,
            StepStatus::Skipped => Self::Skipped,
        }
    }
}

impl PersistedStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
        }
    }
}

/// Initial run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub routine_id: String,
    pub user_id: String,
    #[serde(default)]
    pub swarm_id: Option<SwarmId>,
    pub inputs: VarMap,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step execution as recorded by persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub state: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
}

/// Row returned by history and swarm listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub routine_id: String,
    pub user_id: String,
    #[serde(default)]
    pub swarm_id: Option<SwarmId>,
    pub status: PersistedRunStatus,
    #[serde(default)]
    pub outputs: VarMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything persistence knows about a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRun {
    pub record: RunRecord,
    pub status: PersistedRunStatus,
    #[serde(default)]
    pub outputs: VarMap,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl StoredRun {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.record.id.clone(),
            routine_id: self.record.routine_id.clone(),
            user_id: self.record.user_id.clone(),
            swarm_id: self.record.swarm_id.clone(),
            status: self.status,
            outputs: self.outputs.clone(),
            created_at: self.record.created_at,
            updated_at: self.record.updated_at,
        }
    }
}

// ── Swarms ──────────────────────────────────────────────────────

/// Budget and consumption of a swarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmResources {
    pub max_credits: u64,
    #[serde(default)]
    pub credits_used: u64,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub max_time_ms: Option<u64>,
}

impl SwarmResources {
    pub fn credits_remaining(&self) -> u64 {
        self.max_credits.saturating_sub(self.credits_used)
    }
}

/// Coordination flags of a swarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmCoordination {
    #[serde(default)]
    pub shared_learning: bool,
    #[serde(default)]
    pub collaborative_proposals: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmState {
    Active,
    Completed,
    Failed,
    Stopped,
}

impl SwarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::str::FromStr for SwarmState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown swarm state: {}", other)),
        }
    }
}

/// Goal and resource envelope spawning child runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swarm {
    pub id: SwarmId,
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    pub goal: String,
    pub resources: SwarmResources,
    #[serde(default)]
    pub blackboard: VarMap,
    #[serde(default)]
    pub shared_knowledge: Vec<Value>,
    #[serde(default)]
    pub coordination: SwarmCoordination,
    #[serde(default)]
    pub child_runs: Vec<RunId>,
    pub state: SwarmState,
    pub created_at: DateTime<Utc>,
}

// ── Tools, strategies, models ───────────────────────────────────

/// Result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: Value::String(message.into()),
            is_error: true,
        }
    }
}

/// Context handed to tool executions.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub step_id: String,
}

/// Input handed to an execution strategy.
#[derive(Clone)]
pub struct StrategyInput {
    pub step_id: String,
    pub run_id: RunId,
    pub input: Value,
    /// Resolved tool, when the step names one.
    pub tool: Option<Arc<dyn Tool>>,
}

impl fmt::Debug for StrategyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyInput")
            .field("step_id", &self.step_id)
            .field("run_id", &self.run_id)
            .field("input", &self.input)
            .field("tool", &self.tool.as_ref().map(|t| t.name().to_string()))
            .finish()
    }
}

/// What a strategy returns. `resource_usage` keeps the strategy's native field names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutput {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub resource_usage: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl StrategyOutput {
    pub fn ok(output: Value, resource_usage: Value) -> Self {
        Self {
            success: true,
            output,
            resource_usage,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            resource_usage: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// One prompt to a model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    /// Usage in the backend's own field names.
    #[serde(default)]
    pub usage: Value,
}

// ── Tier communication ──────────────────────────────────────────

/// Typed cross-tier request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierRequest {
    ExecuteStep(StepInput),
    GetMetrics,
}

/// Uniform envelope answering a [`TierRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TierResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Per-tier counters reported by system metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierMetrics {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}
