use futures::future::BoxFuture;

use crate::error::Result;
use crate::event::EngineEvent;
use crate::types::*;

/// Tool: deterministic unit of work invoked by the deterministic strategy.
pub trait Tool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Execution strategy: one way of running a step.
pub trait ExecutionStrategy: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> StrategyKind;

    fn execute(&self, input: StrategyInput) -> BoxFuture<'_, Result<StrategyOutput>>;
}

/// Model backend used by the conversational and reasoning strategies.
pub trait ModelClient: Send + Sync + 'static {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>>;
}

/// Interprets one routine graph format.
///
/// Navigation is pure: methods read the routine definition and never mutate it.
pub trait Navigator: Send + Sync + 'static {
    /// Graph type string this navigator is registered under.
    fn graph_type(&self) -> &str;

    /// Whether the routine's definition is well-formed for this navigator.
    fn can_navigate(&self, routine: &Routine) -> bool;

    fn get_all_start_locations(&self, routine: &Routine) -> Result<Vec<Location>>;

    /// Locations reachable from `location`, with edge conditions evaluated
    /// against `variables`.
    fn get_next_locations(
        &self,
        routine: &Routine,
        location: &Location,
        variables: &VarMap,
    ) -> Result<Vec<Location>>;

    /// All structural successors, ignoring conditions. Used for planning.
    fn get_successors(&self, routine: &Routine, location: &Location) -> Result<Vec<Location>>;

    fn get_io_names_passed_into_node(
        &self,
        routine: &Routine,
        location: &Location,
    ) -> Result<IoNames>;

    /// One ordered step list per branch leaving a parallel gateway. Empty for
    /// any other node.
    fn get_parallel_branches(
        &self,
        routine: &Routine,
        location: &Location,
    ) -> Result<Vec<Vec<Location>>>;

    fn get_step_info(&self, routine: &Routine, location: &Location) -> Result<StepInfo>;

    fn is_end_location(&self, routine: &Routine, location: &Location) -> bool;
}

/// Runs a single step of a run. Branches execute every step through this.
///
/// `context` is the caller's own context (a branch's isolated copy inside a
/// branch), so a step may write to it without affecting siblings.
pub trait StepExecutor: Send + Sync + 'static {
    fn execute_at<'a>(
        &'a self,
        run_id: &'a RunId,
        routine: &'a Routine,
        location: &'a Location,
        context: &'a mut RunContext,
    ) -> BoxFuture<'a, StepResult>;
}

/// Best-effort persistence of branch records.
pub trait BranchStore: Send + Sync + 'static {
    fn save_branch(&self, branch: &Branch) -> BoxFuture<'_, Result<()>>;

    fn update_branch(&self, branch: &Branch) -> BoxFuture<'_, Result<()>>;

    fn delete_branches(&self, run_id: &RunId, ids: &[BranchId]) -> BoxFuture<'_, Result<()>>;

    fn load_branches(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Branch>>>;
}

/// External run persistence collaborator.
pub trait RunPersistence: Send + Sync + 'static {
    fn create_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>>;

    fn update_run_state(&self, run_id: &RunId, state: RunState) -> BoxFuture<'_, Result<()>>;

    fn record_step_execution(
        &self,
        run_id: &RunId,
        step: StepRecord,
    ) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StoredRun>>>;

    fn get_user_run_history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>>;

    fn update_run_outputs(&self, run_id: &RunId, outputs: &VarMap) -> BoxFuture<'_, Result<()>>;
}

/// Swarm records.
pub trait SwarmPersistence: Send + Sync + 'static {
    fn create_swarm(&self, swarm: &Swarm) -> BoxFuture<'_, Result<()>>;

    fn load_swarm(&self, swarm_id: &SwarmId) -> BoxFuture<'_, Result<Option<Swarm>>>;

    fn update_swarm_usage(
        &self,
        swarm_id: &SwarmId,
        resources: &SwarmResources,
    ) -> BoxFuture<'_, Result<()>>;

    fn list_swarm_runs(&self, swarm_id: &SwarmId) -> BoxFuture<'_, Result<Vec<RunSummary>>>;
}

/// Answers whether a user may own swarms and runs.
pub trait UserDirectory: Send + Sync + 'static {
    fn user_exists(&self, user_id: &str) -> BoxFuture<'_, Result<bool>>;
}

/// Cross-tier request/event contract.
pub trait TierCommunication: Send + Sync + 'static {
    fn handle_tier_request(&self, request: TierRequest) -> BoxFuture<'_, TierResponse>;

    /// Stamp the tier's source tag and forward to the event bus.
    fn emit_tier_event(&self, event: EngineEvent);
}

/// Startup/shutdown hooks and counters of one tier.
pub trait TierLifecycle: Send + Sync + 'static {
    fn tier(&self) -> Tier;

    fn metrics(&self) -> TierMetrics;

    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;
}
