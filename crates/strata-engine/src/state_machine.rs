use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use strata_core::config::{ExecutionConfig, GateDenialPolicy};
use strata_core::error::{Result, StrataError};
use strata_core::event::{EngineEvent, EventBus};
use strata_core::traits::{Navigator, StepExecutor, TierCommunication, TierLifecycle};
use strata_core::types::{
    ExecutionContext, ExecutionPlan, Location, NodeKind, ParallelOpportunity, ParentLink,
    Routine, Run, RunContext, RunId, RunState, StepInfo, StepInput, StepRecord, StepResult,
    Swarm, Tier, TierMetrics, TierRequest, TierResponse, VarMap,
};
use strata_navigator::NavigatorRegistry;

use crate::branch::{
    count_visit, enqueue_next, execute_with_recovery, merge_outputs, pop_ready, BranchCoordinator,
    BranchSpec,
};
use crate::executor::UnifiedExecutor;
use crate::gate::{GateRequest, MoiseGate};

pub const SOURCE: &str = "tier2.run";

const DEFAULT_RETENTION: usize = 256;

/// Node id of the synthetic step used when a routine cannot be navigated.
pub const FALLBACK_NODE: &str = "root";

/// External control signal for a live run, observed between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Run,
    Pause,
    Suspend,
    Cancel,
}

struct RunHandle {
    snapshot: Run,
    control: watch::Sender<RunControl>,
    state: watch::Sender<RunState>,
}

/// Tier2: drives runs through their lifecycle and walks the routine graph.
pub struct RunStateMachine {
    navigators: Arc<NavigatorRegistry>,
    branches: Arc<BranchCoordinator>,
    gate: Arc<MoiseGate>,
    tier3: Arc<UnifiedExecutor>,
    event_bus: Arc<EventBus>,
    runs: Mutex<HashMap<RunId, RunHandle>>,
    /// Terminal runs still held in `runs`, oldest first.
    finished: Mutex<VecDeque<RunId>>,
    retention: usize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl RunStateMachine {
    pub fn new(
        navigators: Arc<NavigatorRegistry>,
        branches: Arc<BranchCoordinator>,
        gate: Arc<MoiseGate>,
        tier3: Arc<UnifiedExecutor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            navigators,
            branches,
            gate,
            tier3,
            event_bus,
            runs: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            retention: DEFAULT_RETENTION,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Number of terminal runs kept for status queries. At least one.
    pub fn with_retention(mut self, finished_runs: usize) -> Self {
        self.retention = finished_runs.max(1);
        self
    }

    // ── Planning ────────────────────────────────────────────────

    /// Count executable steps and find parallel gateways. Routines no
    /// navigator can walk get a single-step fallback plan.
    pub fn create_execution_plan(&self, routine: &Routine) -> ExecutionPlan {
        let Some(navigator) = self.navigators.resolve(routine) else {
            return ExecutionPlan {
                total_steps: 1,
                parallel_opportunities: Vec::new(),
                fallback: true,
            };
        };
        match navigator.get_all_start_locations(routine) {
            Ok(starts) => {
                let (total_steps, parallel_opportunities) =
                    survey(navigator.as_ref(), routine, starts);
                ExecutionPlan {
                    total_steps,
                    parallel_opportunities,
                    fallback: false,
                }
            }
            Err(e) => {
                warn!(routine_id = %routine.id, error = %e, "Cannot plan routine; using fallback");
                ExecutionPlan {
                    total_steps: 1,
                    parallel_opportunities: Vec::new(),
                    fallback: true,
                }
            }
        }
    }

    /// Parallel gateways reachable from the run's current location, or from
    /// the start when it has not moved yet.
    pub fn identify_parallel_opportunities(
        &self,
        routine: &Routine,
        exec: &ExecutionContext,
    ) -> Vec<ParallelOpportunity> {
        let Some(navigator) = self.navigators.resolve(routine) else {
            return Vec::new();
        };
        let starts = match &exec.current_location {
            Some(location) => vec![location.clone()],
            None => navigator
                .get_all_start_locations(routine)
                .unwrap_or_default(),
        };
        survey(navigator.as_ref(), routine, starts).1
    }

    /// Seed a run's context from its swarm: blackboard copy, parent link and,
    /// when no credit limit is set, the swarm's remaining credits.
    pub fn initialize_context_from_swarm(
        swarm: &Swarm,
        run_id: RunId,
        routine: &Routine,
        inputs: VarMap,
        mut config: ExecutionConfig,
    ) -> ExecutionContext {
        if config.limits.max_credits.is_none() {
            config.limits.max_credits = Some(swarm.resources.credits_remaining());
        }
        if config.limits.max_tokens.is_none() {
            config.limits.max_tokens = swarm
                .resources
                .max_tokens
                .map(|max| max.saturating_sub(swarm.resources.tokens_used));
        }
        if config.limits.max_time_ms.is_none() {
            config.limits.max_time_ms = swarm.resources.max_time_ms;
        }

        let mut exec = ExecutionContext::new(run_id, routine.id.clone(), swarm.user_id.clone(), inputs, config);
        exec.context.blackboard = swarm.blackboard.clone();
        exec.context.parent = Some(ParentLink {
            swarm_id: swarm.id.clone(),
            goal: swarm.goal.clone(),
            resources: swarm.resources,
            shared_knowledge: swarm.shared_knowledge.clone(),
        });
        exec
    }

    /// Fold one step result into the run: usage always, outputs and the
    /// completed-step list only for steps that actually ran.
    pub fn update_context_with_results(exec: &mut ExecutionContext, result: &StepResult) {
        exec.resource_usage.accumulate(&result.resource_usage);
        if !result.success || result.skipped {
            return;
        }
        for (key, value) in result.output_entries() {
            exec.context.variables.insert(key.clone(), value.clone());
            exec.outputs.insert(key, value);
        }
        exec.mark_step_completed(&result.step_id);
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Make a run visible to status queries and controls before it starts.
    pub fn register_run(&self, run: &Run) -> watch::Receiver<RunControl> {
        let mut runs = self.lock();
        let handle = runs.entry(run.id.clone()).or_insert_with(|| RunHandle {
            snapshot: run.clone(),
            control: watch::channel(RunControl::Run).0,
            state: watch::channel(run.state).0,
        });
        handle.control.subscribe()
    }

    /// Move a run to `next`, publishing `run.state_changed`.
    pub fn transition(&self, run: &mut Run, next: RunState) -> Result<()> {
        if !run.state.can_transition_to(next) {
            return Err(StrataError::InvalidTransition {
                from: run.state.to_string(),
                to: next.to_string(),
            });
        }
        let from = run.state;
        run.state = next;
        run.updated_at = Utc::now();
        if next == RunState::Completed {
            run.progress.percent_complete = 100.0;
        }
        info!(run_id = %run.id, %from, to = %next, "Run state changed");

        self.event_bus.publish(
            EngineEvent::business(
                "run.state_changed",
                SOURCE,
                run.id.as_str(),
                json!({
                    "runId": run.id,
                    "from": from,
                    "to": next,
                    "error": run.error,
                }),
            )
            .with_correlation(run.id.as_str()),
        );
        self.update_snapshot(run);
        if next.is_terminal() {
            self.retire(&run.id);
        }
        Ok(())
    }

    /// Record a terminal run and drop the oldest ones beyond the retention.
    fn retire(&self, run_id: &RunId) {
        let evicted: Vec<RunId> = {
            let mut finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
            finished.push_back(run_id.clone());
            let excess = finished.len().saturating_sub(self.retention);
            finished.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }
        let mut runs = self.lock();
        for id in &evicted {
            runs.remove(id);
        }
        debug!(count = evicted.len(), retained = self.retention, "Evicted finished runs");
    }

    /// Drive a run from `Uninitialized` to a terminal state.
    pub async fn execute_run(&self, mut run: Run, routine: &Routine) -> Run {
        let mut control = self.register_run(&run);
        let outcome = self.drive(&mut run, routine, &mut control).await;

        let terminal = match outcome {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                return run;
            }
            Err(StrataError::Cancelled) => RunState::Cancelled,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Run failed");
                run.error = Some(e.to_string());
                RunState::Failed
            }
        };
        if terminal == RunState::Failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(e) = self.transition(&mut run, terminal) {
            warn!(run_id = %run.id, error = %e, "Could not record terminal state");
        }
        run
    }

    async fn drive(
        &self,
        run: &mut Run,
        routine: &Routine,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<()> {
        self.transition(run, RunState::Loading)?;
        let navigator = self.navigators.resolve(routine);
        let plan = self.create_execution_plan(routine);
        run.progress.total_steps = plan.total_steps;
        debug!(
            run_id = %run.id,
            total_steps = plan.total_steps,
            parallel = plan.parallel_opportunities.len(),
            fallback = plan.fallback,
            "Execution plan ready"
        );
        self.transition(run, RunState::Ready)?;
        self.checkpoint(run, control).await?;
        self.transition(run, RunState::Running)?;

        let steps = GatedStepExecutor {
            navigator: navigator.clone(),
            gate: self.gate.clone(),
            tier3: self.tier3.clone(),
            config: run.execution.config.clone(),
        };
        match navigator {
            Some(navigator) => {
                self.execute_graph(run, routine, navigator.as_ref(), &steps, control)
                    .await?
            }
            None => self.execute_fallback(run, routine, &steps).await?,
        }

        self.event_bus.publish(
            EngineEvent::business(
                "run.outputs",
                SOURCE,
                run.id.as_str(),
                json!({ "runId": run.id, "outputs": run.execution.outputs }),
            )
            .with_correlation(run.id.as_str()),
        );
        self.transition(run, RunState::Completed)
    }

    async fn execute_graph(
        &self,
        run: &mut Run,
        routine: &Routine,
        navigator: &dyn Navigator,
        steps: &GatedStepExecutor,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<()> {
        let config = run.execution.config.clone();
        let mut frontier: VecDeque<Location> = navigator.get_all_start_locations(routine)?.into();
        if frontier.is_empty() {
            return Err(StrataError::Validation(format!(
                "routine {} has no start location",
                routine.id
            )));
        }
        let mut visits: HashMap<String, usize> = HashMap::new();

        while let Some(location) = pop_ready(&mut frontier, navigator, routine) {
            self.checkpoint(run, control).await?;
            count_visit(&mut visits, &location, config.max_node_visits)?;

            run.execution.current_location = Some(location.clone());
            run.progress.current_step = Some(location.node_id().to_string());
            let info = navigator.get_step_info(routine, &location)?;

            match info.kind {
                NodeKind::ParallelGateway => {
                    self.execute_parallel(run, routine, navigator, steps, &location)
                        .await?
                }
                kind if kind.is_executable() => {
                    let result = execute_with_recovery(
                        steps,
                        &run.id,
                        routine,
                        &location,
                        &mut run.execution.context,
                        &config,
                    )
                    .await;
                    self.record_step(&run.id, &result);
                    if !result.success {
                        return Err(StrataError::StepExecution {
                            step: result.step_id,
                            message: result.error.unwrap_or_default(),
                        });
                    }
                    Self::update_context_with_results(&mut run.execution, &result);
                }
                _ => {}
            }

            self.check_limits(run)?;
            self.update_progress(run);
            let next = navigator.get_next_locations(
                routine,
                &location,
                &run.execution.context.variables,
            )?;
            for location in next {
                enqueue_next(&mut frontier, location);
            }
        }
        Ok(())
    }

    async fn execute_parallel(
        &self,
        run: &mut Run,
        routine: &Routine,
        navigator: &dyn Navigator,
        steps: &GatedStepExecutor,
        gateway: &Location,
    ) -> Result<()> {
        let spec = BranchSpec {
            parent_step_id: gateway.node_id().to_string(),
            parallel: true,
            branch_count: Some(navigator.get_successors(routine, gateway)?.len()),
            steps: Vec::new(),
        };
        let branches = self
            .branches
            .create_branches_from_config(&run.id, spec)
            .await?;
        let results = self
            .branches
            .execute_branches(&run.execution, routine, branches, navigator, steps)
            .await;

        for result in &results {
            for step in &result.step_results {
                self.record_step(&run.id, step);
            }
            run.execution.resource_usage.accumulate(&result.resource_usage);
            for step_id in &result.completed_steps {
                run.execution.mark_step_completed(step_id);
            }
        }
        run.execution.context = self
            .branches
            .merge_branch_results(&run.execution.context, &results);
        run.execution.outputs.extend(merge_outputs(&results));
        self.branches.cleanup(&run.id).await;

        match results.iter().find(|r| !r.success) {
            Some(failed) => Err(StrataError::BranchFailure {
                branch: failed.index.to_string(),
                message: failed.error.clone().unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }

    /// A routine no navigator understands runs as one step at `<routine>/root`
    /// with the run inputs and the routine's default strategy.
    async fn execute_fallback(
        &self,
        run: &mut Run,
        routine: &Routine,
        steps: &GatedStepExecutor,
    ) -> Result<()> {
        info!(run_id = %run.id, routine_id = %routine.id, "Executing routine as a single step");
        let location = Location::new(routine.id.clone(), FALLBACK_NODE);
        run.execution.current_location = Some(location.clone());
        run.progress.current_step = Some(FALLBACK_NODE.to_string());

        let config = run.execution.config.clone();
        let result = execute_with_recovery(
            steps,
            &run.id,
            routine,
            &location,
            &mut run.execution.context,
            &config,
        )
        .await;
        self.record_step(&run.id, &result);
        if !result.success {
            return Err(StrataError::StepExecution {
                step: result.step_id,
                message: result.error.unwrap_or_default(),
            });
        }
        Self::update_context_with_results(&mut run.execution, &result);
        self.check_limits(run)?;
        self.update_progress(run);
        Ok(())
    }

    /// Apply pending control signals. Blocks while the run is paused or
    /// suspended; returns `Cancelled` when the run must stop.
    async fn checkpoint(
        &self,
        run: &mut Run,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<()> {
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                RunControl::Run => {
                    if matches!(run.state, RunState::Paused | RunState::Suspended) {
                        self.transition(run, RunState::Running)?;
                    }
                    return Ok(());
                }
                RunControl::Cancel => return Err(StrataError::Cancelled),
                RunControl::Pause | RunControl::Suspend => {
                    let target = if signal == RunControl::Pause {
                        RunState::Paused
                    } else {
                        RunState::Suspended
                    };
                    if run.state == RunState::Running {
                        self.transition(run, target)?;
                    } else if !matches!(run.state, RunState::Paused | RunState::Suspended) {
                        // Not running yet; hold until resumed.
                        debug!(run_id = %run.id, state = %run.state, "Holding run before start");
                    }
                    if control.changed().await.is_err() {
                        return Err(StrataError::Cancelled);
                    }
                }
            }
        }
    }

    fn check_limits(&self, run: &Run) -> Result<()> {
        match run.limits().exceeded(run.usage(), run.execution.elapsed_ms()) {
            Some(reason) => Err(StrataError::LimitExceeded(reason)),
            None => Ok(()),
        }
    }

    fn update_progress(&self, run: &mut Run) {
        let completed = run.execution.completed_steps.len();
        let total = run.progress.total_steps.max(completed);
        run.progress.completed_steps = completed;
        run.progress.total_steps = total;
        run.progress.percent_complete = if total == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total as f64
        };
        run.updated_at = Utc::now();
        self.update_snapshot(run);
    }

    fn record_step(&self, run_id: &RunId, result: &StepResult) {
        let record = StepRecord {
            step_id: result.step_id.clone(),
            state: result.status(),
            started_at: result.started_at,
            completed_at: Some(result.completed_at),
            result: result.success.then(|| result.output.clone()),
            error: result.error.clone(),
            resource_usage: Some(result.resource_usage),
        };
        self.event_bus.publish(
            EngineEvent::business(
                "step.recorded",
                SOURCE,
                &result.step_id,
                json!({ "runId": run_id, "record": record }),
            )
            .with_correlation(run_id.as_str()),
        );
    }

    fn update_snapshot(&self, run: &Run) {
        let mut runs = self.lock();
        if let Some(handle) = runs.get_mut(&run.id) {
            handle.snapshot = run.clone();
            handle.state.send_replace(run.state);
        }
    }

    // ── Controls and queries ────────────────────────────────────

    pub fn pause_run(&self, run_id: &RunId) -> Result<()> {
        self.signal(run_id, RunControl::Pause)
    }

    pub fn suspend_run(&self, run_id: &RunId) -> Result<()> {
        self.signal(run_id, RunControl::Suspend)
    }

    pub fn resume_run(&self, run_id: &RunId) -> Result<()> {
        self.signal(run_id, RunControl::Run)
    }

    pub fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        self.signal(run_id, RunControl::Cancel)
    }

    fn signal(&self, run_id: &RunId, signal: RunControl) -> Result<()> {
        let runs = self.lock();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| StrataError::not_found("Run", run_id.as_str()))?;
        if handle.snapshot.state.is_terminal() {
            return Err(StrataError::InvalidTransition {
                from: handle.snapshot.state.to_string(),
                to: format!("{:?}", signal).to_uppercase(),
            });
        }
        handle.control.send_replace(signal);
        debug!(run_id = %run_id, ?signal, "Run control signalled");
        Ok(())
    }

    /// Latest known state of a run handled by this process. Finished runs
    /// beyond the retention are forgotten.
    pub fn run_snapshot(&self, run_id: &RunId) -> Option<Run> {
        self.lock().get(run_id).map(|h| h.snapshot.clone())
    }

    /// Wait until the run reaches a terminal state. `None` for unknown runs.
    pub async fn wait_for_terminal(&self, run_id: &RunId) -> Option<Run> {
        let mut state = self.lock().get(run_id)?.state.subscribe();
        loop {
            if state.borrow_and_update().is_terminal() {
                break;
            }
            if state.changed().await.is_err() {
                break;
            }
        }
        self.run_snapshot(run_id)
    }

    pub fn active_runs(&self) -> usize {
        self.lock()
            .values()
            .filter(|h| !h.snapshot.state.is_terminal())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, RunHandle>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Walk the graph from `starts`, counting executable nodes and collecting
/// parallel gateways with more than one branch.
fn survey(
    navigator: &dyn Navigator,
    routine: &Routine,
    starts: Vec<Location>,
) -> (usize, Vec<ParallelOpportunity>) {
    let mut queue: VecDeque<Location> = starts.into();
    let mut seen: HashSet<Location> = HashSet::new();
    let mut total = 0;
    let mut opportunities = Vec::new();

    while let Some(location) = queue.pop_front() {
        if !seen.insert(location.clone()) {
            continue;
        }
        let Ok(info) = navigator.get_step_info(routine, &location) else {
            continue;
        };
        if info.kind.is_executable() {
            total += 1;
        }
        if info.kind == NodeKind::ParallelGateway {
            let branch_count = navigator
                .get_parallel_branches(routine, &location)
                .map(|b| b.len())
                .unwrap_or(0);
            if branch_count > 1 {
                opportunities.push(ParallelOpportunity {
                    location: location.clone(),
                    branch_count,
                });
            }
        }
        queue.extend(navigator.get_successors(routine, &location).unwrap_or_default());
    }
    (total, opportunities)
}

impl TierCommunication for RunStateMachine {
    /// Step requests are relayed to tier3.
    fn handle_tier_request(&self, request: TierRequest) -> BoxFuture<'_, TierResponse> {
        Box::pin(async move {
            match request {
                TierRequest::ExecuteStep(_) => self.tier3.handle_tier_request(request).await,
                TierRequest::GetMetrics => match serde_json::to_value(self.metrics()) {
                    Ok(data) => TierResponse::ok(data),
                    Err(e) => TierResponse::error(e.to_string()),
                },
            }
        })
    }

    fn emit_tier_event(&self, event: EngineEvent) {
        self.event_bus.publish(event.with_source(SOURCE));
    }
}

impl TierLifecycle for RunStateMachine {
    fn tier(&self) -> Tier {
        Tier::Tier2
    }

    fn metrics(&self) -> TierMetrics {
        TierMetrics {
            active: self.active_runs(),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Signal every live run to cancel at its next checkpoint.
    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let runs = self.lock();
            let mut cancelled = 0;
            for handle in runs.values().filter(|h| !h.snapshot.state.is_terminal()) {
                handle.control.send_replace(RunControl::Cancel);
                cancelled += 1;
            }
            if cancelled > 0 {
                info!(cancelled, "Cancelled live runs");
            }
            Ok(())
        })
    }
}

// ── Gated step execution ────────────────────────────────────────

/// Runs one node: resolves its step info, consults the MOISE gate and hands
/// the step to tier3.
pub struct GatedStepExecutor {
    navigator: Option<Arc<dyn Navigator>>,
    gate: Arc<MoiseGate>,
    tier3: Arc<UnifiedExecutor>,
    config: ExecutionConfig,
}

impl GatedStepExecutor {
    pub fn new(
        navigator: Option<Arc<dyn Navigator>>,
        gate: Arc<MoiseGate>,
        tier3: Arc<UnifiedExecutor>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            navigator,
            gate,
            tier3,
            config,
        }
    }

    fn step_info(&self, routine: &Routine, location: &Location) -> Result<StepInfo> {
        match &self.navigator {
            Some(navigator) => navigator.get_step_info(routine, location),
            None => Ok(StepInfo {
                node_id: location.node_id().to_string(),
                kind: NodeKind::Task,
                name: routine.name.clone(),
                ..StepInfo::default()
            }),
        }
    }

    async fn run_step(
        &self,
        run_id: &RunId,
        routine: &Routine,
        info: &StepInfo,
        context: &RunContext,
    ) -> StepResult {
        let strategy = info
            .strategy
            .clone()
            .or_else(|| routine.default_strategy.clone())
            .unwrap_or_else(|| self.config.default_strategy.clone());

        let decision = self.gate.validate_execution(&GateRequest {
            run_id,
            agent_id: self.config.agent_id.as_deref(),
            team_id: self.config.team_id.as_deref(),
            step_id: &info.node_id,
            strategy: &strategy,
            tool: info.tool.as_deref(),
        });
        if !decision.allowed {
            let reason = format!("Denied by organization: {}", decision.reason);
            match self.config.on_gate_denied {
                GateDenialPolicy::Skip => {
                    return StepResult::skipped(&info.node_id, &strategy, reason)
                }
                GateDenialPolicy::Fail => {
                    return StepResult::failure(&info.node_id, &strategy, reason)
                }
                GateDenialPolicy::Proceed => {
                    warn!(run_id = %run_id, step = %info.node_id, "Executing step despite gate denial");
                }
            }
        }

        let input = StepInput {
            tool_name: info.tool.clone(),
            agent_id: self.config.agent_id.clone(),
            ..StepInput::new(run_id.clone(), &info.node_id, strategy, build_step_input(info, context))
        };
        self.tier3.execute_step(input).await
    }
}

/// Step input: the node's static config overlaid with its declared input
/// variables. A node declaring neither receives every run variable.
fn build_step_input(info: &StepInfo, context: &RunContext) -> Value {
    if info.inputs.is_empty() && info.config.is_null() {
        return json!(context.variables);
    }
    match &info.config {
        Value::Object(config) => {
            let mut input = config.clone();
            for name in &info.inputs {
                if let Some(value) = context.get(name) {
                    input.insert(name.clone(), value.clone());
                }
            }
            Value::Object(input)
        }
        Value::Null => {
            let input: serde_json::Map<String, Value> = info
                .inputs
                .iter()
                .filter_map(|name| context.get(name).map(|v| (name.clone(), v.clone())))
                .collect();
            Value::Object(input)
        }
        other => other.clone(),
    }
}

impl StepExecutor for GatedStepExecutor {
    fn execute_at<'a>(
        &'a self,
        run_id: &'a RunId,
        routine: &'a Routine,
        location: &'a Location,
        context: &'a mut RunContext,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            match self.step_info(routine, location) {
                Ok(info) => self.run_step(run_id, routine, &info, context).await,
                Err(e) => StepResult::failure(location.node_id(), "unresolved", e.to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::config::RecoveryStrategy;
    use strata_core::types::{NodeKind, ResourceUsage};
    use strata_test_utils::{fixtures, InMemoryStore, ScriptedStrategy};
    use strata_tools::ToolRegistry;
    use tokio::sync::RwLock;

    use crate::strategy::StrategyFactory;

    struct Harness {
        machine: Arc<RunStateMachine>,
        bus: Arc<EventBus>,
    }

    fn harness(factory: StrategyFactory) -> Harness {
        harness_with_retention(factory, DEFAULT_RETENTION)
    }

    fn harness_with_retention(factory: StrategyFactory, retention: usize) -> Harness {
        let bus = Arc::new(EventBus::default());
        let tier3 = Arc::new(UnifiedExecutor::new(
            Arc::new(factory),
            Arc::new(RwLock::new(ToolRegistry::with_builtins())),
            bus.clone(),
        ));
        let machine = RunStateMachine::new(
            Arc::new(NavigatorRegistry::with_defaults()),
            Arc::new(BranchCoordinator::new(Arc::new(InMemoryStore::new()), bus.clone())),
            Arc::new(MoiseGate::new(None, bus.clone())),
            tier3,
            bus.clone(),
        )
        .with_retention(retention);
        Harness {
            machine: Arc::new(machine),
            bus,
        }
    }

    fn run_for(routine: &Routine, inputs: VarMap, config: ExecutionConfig) -> Run {
        Run::new(ExecutionContext::new(RunId::new(), routine.id.clone(), "user-1", inputs, config))
    }

    #[test]
    fn plan_counts_steps_and_gateways() {
        let h = harness(StrategyFactory::with_defaults(None));
        let plan = h.machine.create_execution_plan(&fixtures::parallel_routine());
        assert_eq!(plan.total_steps, 2);
        assert!(!plan.fallback);
        assert_eq!(plan.parallel_opportunities.len(), 1);
        assert_eq!(plan.parallel_opportunities[0].branch_count, 2);

        let fallback = h.machine.create_execution_plan(&fixtures::opaque_routine());
        assert!(fallback.fallback);
        assert_eq!(fallback.total_steps, 1);

        let exec = ExecutionContext::new(
            RunId::new(),
            "parallel-routine",
            "u",
            VarMap::new(),
            ExecutionConfig::default(),
        );
        assert_eq!(
            h.machine
                .identify_parallel_opportunities(&fixtures::parallel_routine(), &exec)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn parallel_routine_merges_branch_outputs() {
        let h = harness(StrategyFactory::with_defaults(None));
        let routine = fixtures::parallel_routine();
        let mut states = h.bus.subscribe("run.state_changed");

        let run = h
            .machine
            .execute_run(run_for(&routine, VarMap::new(), ExecutionConfig::default()), &routine)
            .await;

        assert_eq!(run.state, RunState::Completed, "{:?}", run.error);
        assert_eq!(run.execution.outputs["result"], json!(["left", "right"]));
        assert_eq!(run.execution.completed_steps, vec!["left", "right"]);
        assert_eq!(run.progress.percent_complete, 100.0);

        let seen: Vec<Value> = states
            .drain()
            .into_iter()
            .filter_map(|e| e.payload.data().map(|d| d["to"].clone()))
            .collect();
        assert_eq!(
            seen,
            vec![json!("LOADING"), json!("READY"), json!("RUNNING"), json!("COMPLETED")]
        );
    }

    #[tokio::test]
    async fn exclusive_gateway_follows_condition() {
        let h = harness(StrategyFactory::with_defaults(None));
        let routine = fixtures::branching_routine();
        let inputs = VarMap::from([("score".to_string(), json!(0.9))]);
        let run = h
            .machine
            .execute_run(run_for(&routine, inputs, ExecutionConfig::default()), &routine)
            .await;
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.execution.outputs["decision"], json!("approved"));
        assert_eq!(run.execution.completed_steps, vec!["approve"]);
    }

    #[tokio::test]
    async fn parallel_branch_evaluates_its_own_gateway() {
        let h = harness(StrategyFactory::with_defaults(None));
        let routine = fixtures::conditional_parallel_routine();
        let inputs = VarMap::from([("score".to_string(), json!(0.9))]);
        let run = h
            .machine
            .execute_run(run_for(&routine, inputs, ExecutionConfig::default()), &routine)
            .await;

        assert_eq!(run.state, RunState::Completed, "{:?}", run.error);
        assert_eq!(run.execution.outputs["picked"], json!("high"));
        assert_eq!(run.execution.outputs["side"], json!("other"));
        assert_eq!(run.execution.completed_steps, vec!["high", "other"]);
    }

    #[tokio::test]
    async fn reconverging_node_runs_once() {
        let mut factory = StrategyFactory::new();
        let echo = Arc::new(ScriptedStrategy::echo("deterministic"));
        factory.register_arc(echo.clone());
        let h = harness(factory);
        let routine = fixtures::reconverging_routine();

        let run = h
            .machine
            .execute_run(run_for(&routine, VarMap::new(), ExecutionConfig::default()), &routine)
            .await;

        assert_eq!(run.state, RunState::Completed, "{:?}", run.error);
        assert_eq!(echo.calls(), 3);
        assert_eq!(run.execution.completed_steps, vec!["a", "b", "c"]);
        assert_eq!(run.execution.resource_usage.credits, 6);
    }

    #[tokio::test]
    async fn finished_runs_beyond_retention_are_forgotten() {
        let mut factory = StrategyFactory::new();
        factory.register(ScriptedStrategy::echo("deterministic"));
        let h = harness_with_retention(factory, 1);
        let routine = fixtures::sequential_routine();

        let first = h
            .machine
            .execute_run(run_for(&routine, VarMap::new(), ExecutionConfig::default()), &routine)
            .await;
        assert!(h.machine.run_snapshot(&first.id).is_some());

        let second = h
            .machine
            .execute_run(run_for(&routine, VarMap::new(), ExecutionConfig::default()), &routine)
            .await;
        assert_eq!(second.state, RunState::Completed);
        assert!(h.machine.run_snapshot(&first.id).is_none());
        assert!(h.machine.wait_for_terminal(&first.id).await.is_none());
        assert_eq!(
            h.machine.run_snapshot(&second.id).map(|r| r.state),
            Some(RunState::Completed)
        );
        assert_eq!(h.machine.metrics().completed, 2);
    }

    #[tokio::test]
    async fn opaque_routine_runs_fallback_step() {
        let mut factory = StrategyFactory::new();
        let echo = Arc::new(ScriptedStrategy::echo("deterministic"));
        factory.register_arc(echo.clone());
        let h = harness(factory);
        let routine = fixtures::opaque_routine();
        let mut recorded = h.bus.subscribe("step.recorded");

        let inputs = VarMap::from([("topic".to_string(), json!("rust"))]);
        let run = h
            .machine
            .execute_run(run_for(&routine, inputs, ExecutionConfig::default()), &routine)
            .await;

        assert_eq!(run.state, RunState::Completed);
        assert_eq!(echo.inputs(), vec![json!({"topic": "rust"})]);
        assert_eq!(run.execution.completed_steps, vec![FALLBACK_NODE]);
        assert_eq!(run.execution.resource_usage, ResourceUsage::new(10, 2, 5));
        let event = recorded.try_recv().unwrap();
        assert_eq!(event.payload.data().unwrap()["record"]["stepId"], json!("root"));
    }

    #[tokio::test]
    async fn failing_step_fails_run() {
        let mut factory = StrategyFactory::new();
        factory.register(ScriptedStrategy::failing("deterministic", "tool exploded"));
        let h = harness(factory);
        let routine = fixtures::sequential_routine();
        let run = h
            .machine
            .execute_run(run_for(&routine, VarMap::new(), ExecutionConfig::default()), &routine)
            .await;
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.unwrap().contains("tool exploded"));
        assert_eq!(h.machine.metrics().failed, 1);
    }

    #[tokio::test]
    async fn retry_recovers_sequential_step() {
        let mut factory = StrategyFactory::new();
        let flaky = Arc::new(ScriptedStrategy::flaky("deterministic", 1));
        factory.register_arc(flaky.clone());
        let h = harness(factory);
        let routine = fixtures::opaque_routine();
        let config = ExecutionConfig {
            recovery_strategy: RecoveryStrategy::Retry,
            max_retries: 2,
            ..ExecutionConfig::default()
        };
        let run = h
            .machine
            .execute_run(run_for(&routine, VarMap::new(), config), &routine)
            .await;
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn credit_limit_fails_run() {
        let mut factory = StrategyFactory::new();
        factory.register(ScriptedStrategy::echo("deterministic"));
        let h = harness(factory);
        let routine = fixtures::parallel_routine();
        let mut config = ExecutionConfig::default();
        config.limits.max_credits = Some(3);
        let run = h
            .machine
            .execute_run(run_for(&routine, VarMap::new(), config), &routine)
            .await;
        assert_eq!(run.state, RunState::Failed);
        assert!(run.error.unwrap().contains("credits 4 > max 3"));
    }

    #[tokio::test]
    async fn pause_resume_and_cancel() {
        let mut factory = StrategyFactory::new();
        factory.register(ScriptedStrategy::echo("deterministic"));
        let h = harness(factory);
        let routine = fixtures::sequential_routine();

        let run = run_for(&routine, VarMap::new(), ExecutionConfig::default());
        let run_id = run.id.clone();
        h.machine.register_run(&run);
        h.machine.pause_run(&run_id).unwrap();

        let task = {
            let machine = h.machine.clone();
            let routine = routine.clone();
            tokio::spawn(async move { machine.execute_run(run, &routine).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = h.machine.run_snapshot(&run_id).unwrap();
        assert_eq!(snapshot.state, RunState::Ready);
        assert!(snapshot.execution.completed_steps.is_empty());

        h.machine.resume_run(&run_id).unwrap();
        let done = task.await.unwrap();
        assert_eq!(done.state, RunState::Completed);
        assert!(h.machine.cancel_run(&run_id).is_err());

        let second = run_for(&routine, VarMap::new(), ExecutionConfig::default());
        let second_id = second.id.clone();
        h.machine.register_run(&second);
        h.machine.cancel_run(&second_id).unwrap();
        let cancelled = h.machine.execute_run(second, &routine).await;
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert_eq!(
            h.machine.wait_for_terminal(&second_id).await.unwrap().state,
            RunState::Cancelled
        );
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let h = harness(StrategyFactory::new());
        let routine = fixtures::opaque_routine();
        let mut run = run_for(&routine, VarMap::new(), ExecutionConfig::default());
        let err = h.machine.transition(&mut run, RunState::Running).unwrap_err();
        assert!(matches!(err, StrataError::InvalidTransition { .. }));
        assert_eq!(run.state, RunState::Uninitialized);
    }

    #[test]
    fn swarm_seeding_and_result_folding() {
        let swarm = fixtures::swarm("user-1", 5000, 1234);
        let routine = fixtures::sequential_routine();
        let mut exec = RunStateMachine::initialize_context_from_swarm(
            &swarm,
            RunId::from("r1"),
            &routine,
            VarMap::from([("q".to_string(), json!(1))]),
            ExecutionConfig::default(),
        );
        assert_eq!(exec.user_id, "user-1");
        assert_eq!(exec.config.limits.max_credits, Some(3766));
        assert_eq!(exec.context.blackboard["phase"], json!("research"));
        assert_eq!(exec.context.parent.as_ref().unwrap().swarm_id, swarm.id);
        assert_eq!(exec.context.variables["q"], json!(1));

        let ok = StepResult::success("fetch", "deterministic", json!({"a": 1}), ResourceUsage::new(1, 2, 3));
        RunStateMachine::update_context_with_results(&mut exec, &ok);
        RunStateMachine::update_context_with_results(&mut exec, &ok);
        assert_eq!(exec.completed_steps, vec!["fetch"]);
        assert_eq!(exec.resource_usage, ResourceUsage::new(2, 4, 6));

        let skipped = StepResult::skipped("render", "deterministic", "denied");
        RunStateMachine::update_context_with_results(&mut exec, &skipped);
        assert_eq!(exec.completed_steps, vec!["fetch"]);
    }

    #[test]
    fn step_input_building() {
        let ctx = RunContext::with_variables(VarMap::from([
            ("payload".to_string(), json!({"x": 1})),
            ("other".to_string(), json!(2)),
        ]));
        let info = StepInfo {
            node_id: "n".into(),
            kind: NodeKind::Task,
            inputs: vec!["payload".into(), "missing".into()],
            config: json!({"path": "x"}),
            ..StepInfo::default()
        };
        assert_eq!(
            build_step_input(&info, &ctx),
            json!({"path": "x", "payload": {"x": 1}})
        );

        let bare = StepInfo {
            node_id: "n".into(),
            ..StepInfo::default()
        };
        assert_eq!(
            build_step_input(&bare, &ctx),
            json!({"payload": {"x": 1}, "other": 2})
        );
    }
}
