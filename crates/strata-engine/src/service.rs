use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::config::{EngineConfig, ExecutionConfig, OrganizationSpec};
use strata_core::error::{Result, StrataError};
use strata_core::event::{EngineEvent, EventBus, EventBusStats, HealthStatus, Subscription};
use strata_core::telemetry::{TelemetryShim, TelemetrySink, TelemetryStats};
use strata_core::traits::{
    BranchStore, ModelClient, RunPersistence, SwarmPersistence, TierLifecycle, UserDirectory,
};
use strata_core::types::{
    ExecutionContext, PersistedRunStatus, ResourceUsage, Routine, Run, RunId, RunProgress,
    RunRecord, RunState, RunSummary, StepRecord, Swarm, SwarmCoordination, SwarmId,
    SwarmResources, SwarmState, TierMetrics, VarMap,
};
use strata_navigator::NavigatorRegistry;
use strata_tools::ToolRegistry;

use crate::branch::BranchCoordinator;
use crate::executor::UnifiedExecutor;
use crate::gate::MoiseGate;
use crate::state_machine::RunStateMachine;
use crate::strategy::StrategyFactory;
use crate::swarm::SwarmCoordinator;

pub const SOURCE: &str = "service.swarm";

// ── Requests and views ──────────────────────────────────────────

/// A run to start, optionally as a child of a swarm.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub routine: Routine,
    pub user_id: String,
    pub inputs: VarMap,
    pub swarm_id: Option<SwarmId>,
    /// Overrides the service's execution config for this run.
    pub config: Option<ExecutionConfig>,
    pub metadata: Value,
}

impl RunRequest {
    pub fn new(routine: Routine, user_id: impl Into<String>) -> Self {
        Self {
            routine,
            user_id: user_id.into(),
            inputs: VarMap::new(),
            swarm_id: None,
            config: None,
            metadata: Value::Null,
        }
    }

    pub fn with_inputs(mut self, inputs: VarMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn in_swarm(mut self, swarm_id: SwarmId) -> Self {
        self.swarm_id = Some(swarm_id);
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A swarm to start. `initial_runs` are launched as its children.
#[derive(Debug, Clone)]
pub struct SwarmRequest {
    pub user_id: String,
    pub name: String,
    pub goal: String,
    pub resources: SwarmResources,
    pub blackboard: VarMap,
    pub shared_knowledge: Vec<Value>,
    pub coordination: SwarmCoordination,
    pub initial_runs: Vec<RunRequest>,
}

impl SwarmRequest {
    pub fn new(user_id: impl Into<String>, goal: impl Into<String>, max_credits: u64) -> Self {
        let goal = goal.into();
        Self {
            user_id: user_id.into(),
            name: goal.clone(),
            goal,
            resources: SwarmResources {
                max_credits,
                ..Default::default()
            },
            blackboard: VarMap::new(),
            shared_knowledge: Vec::new(),
            coordination: SwarmCoordination::default(),
            initial_runs: Vec::new(),
        }
    }

    pub fn with_resources(mut self, resources: SwarmResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_blackboard(mut self, blackboard: VarMap) -> Self {
        self.blackboard = blackboard;
        self
    }

    pub fn with_run(mut self, run: RunRequest) -> Self {
        self.initial_runs.push(run);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditStatus {
    pub max_credits: u64,
    pub credits_used: u64,
    pub credits_remaining: u64,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmStatus {
    pub swarm_id: SwarmId,
    pub name: String,
    pub goal: String,
    pub state: SwarmState,
    pub resources: CreditStatus,
    pub total_runs: usize,
    /// Persisted run status -> count.
    pub runs_by_status: BTreeMap<String, usize>,
    pub created_at: DateTime<Utc>,
}

impl SwarmStatus {
    fn from_parts(swarm: &Swarm, runs: &[RunSummary]) -> Self {
        let mut runs_by_status = BTreeMap::new();
        for run in runs {
            *runs_by_status
                .entry(run.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        Self {
            swarm_id: swarm.id.clone(),
            name: swarm.name.clone(),
            goal: swarm.goal.clone(),
            state: swarm.state,
            resources: CreditStatus {
                max_credits: swarm.resources.max_credits,
                credits_used: swarm.resources.credits_used,
                credits_remaining: swarm.resources.credits_remaining(),
                tokens_used: swarm.resources.tokens_used,
            },
            total_runs: runs.len(),
            runs_by_status,
            created_at: swarm.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusView {
    pub run_id: RunId,
    pub routine_id: String,
    pub user_id: String,
    pub swarm_id: Option<SwarmId>,
    /// Exact lifecycle state. Only known while this process tracks the run.
    pub state: Option<RunState>,
    pub status: PersistedRunStatus,
    pub progress: Option<RunProgress>,
    pub outputs: VarMap,
    pub resource_usage: ResourceUsage,
    pub error: Option<String>,
    pub live: bool,
}

impl RunStatusView {
    fn from_run(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            routine_id: run.routine_id.clone(),
            user_id: run.user_id.clone(),
            swarm_id: run.swarm_id.clone(),
            state: Some(run.state),
            status: PersistedRunStatus::from(run.state),
            progress: Some(run.progress.clone()),
            outputs: run.execution.outputs.clone(),
            resource_usage: run.execution.resource_usage,
            error: run.error.clone(),
            live: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub tier1: TierMetrics,
    pub tier2: TierMetrics,
    pub tier3: TierMetrics,
    pub event_bus: EventBusStats,
    pub telemetry: TelemetryStats,
}

// ── Builder ─────────────────────────────────────────────────────

/// Assembles a [`SwarmExecutionService`] from injected collaborators.
#[derive(Default)]
pub struct ServiceBuilder {
    config: EngineConfig,
    organization: Option<OrganizationSpec>,
    navigators: Option<NavigatorRegistry>,
    strategies: Option<StrategyFactory>,
    tools: Option<ToolRegistry>,
    model: Option<Arc<dyn ModelClient>>,
    event_bus: Option<Arc<EventBus>>,
    runs: Option<Arc<dyn RunPersistence>>,
    swarms: Option<Arc<dyn SwarmPersistence>>,
    users: Option<Arc<dyn UserDirectory>>,
    branch_store: Option<Arc<dyn BranchStore>>,
}

impl ServiceBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides `config.organization`.
    pub fn organization(mut self, organization: OrganizationSpec) -> Self {
        self.organization = Some(organization);
        self
    }

    pub fn navigators(mut self, navigators: NavigatorRegistry) -> Self {
        self.navigators = Some(navigators);
        self
    }

    /// Replaces the default strategy set entirely.
    pub fn strategies(mut self, strategies: StrategyFactory) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Model backing the default conversational and reasoning strategies.
    pub fn model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn run_persistence(mut self, runs: Arc<dyn RunPersistence>) -> Self {
        self.runs = Some(runs);
        self
    }

    pub fn swarm_persistence(mut self, swarms: Arc<dyn SwarmPersistence>) -> Self {
        self.swarms = Some(swarms);
        self
    }

    pub fn users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn branch_store(mut self, store: Arc<dyn BranchStore>) -> Self {
        self.branch_store = Some(store);
        self
    }

    /// Use one store for every persistence collaborator.
    pub fn store<S>(self, store: Arc<S>) -> Self
    where
        S: RunPersistence + SwarmPersistence + UserDirectory + BranchStore,
    {
        self.run_persistence(store.clone())
            .swarm_persistence(store.clone())
            .users(store.clone())
            .branch_store(store)
    }

    /// Wire the tiers together and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<SwarmExecutionService> {
        let mut config = self.config;
        if let Some(organization) = self.organization {
            config.organization = Some(organization);
        }
        config.validate()?;

        let runs = self
            .runs
            .ok_or_else(|| StrataError::Validation("run persistence is required".into()))?;
        let swarms = self
            .swarms
            .ok_or_else(|| StrataError::Validation("swarm persistence is required".into()))?;
        let users = self
            .users
            .ok_or_else(|| StrataError::Validation("user directory is required".into()))?;
        let branch_store = self
            .branch_store
            .ok_or_else(|| StrataError::Validation("branch store is required".into()))?;

        let event_bus = self
            .event_bus
            .unwrap_or_else(|| Arc::new(EventBus::new(config.event_bus.recent_capacity)));
        let sink: Arc<dyn TelemetrySink> = event_bus.clone();
        let telemetry = Arc::new(TelemetryShim::new(sink, config.telemetry.clone()));

        let strategies = Arc::new(
            self.strategies
                .unwrap_or_else(|| StrategyFactory::with_defaults(self.model.clone())),
        );
        let tools = Arc::new(RwLock::new(
            self.tools.unwrap_or_else(ToolRegistry::with_builtins),
        ));
        let navigators = Arc::new(self.navigators.unwrap_or_else(NavigatorRegistry::with_defaults));

        let tier3 = Arc::new(
            UnifiedExecutor::new(strategies, tools, event_bus.clone())
                .with_telemetry(telemetry.clone())
                .with_drain_timeout(Duration::from_millis(config.shutdown.drain_timeout_ms)),
        );
        let gate = Arc::new(MoiseGate::new(config.organization.clone(), event_bus.clone()));
        let branches = Arc::new(BranchCoordinator::new(branch_store, event_bus.clone()));
        let tier2 = Arc::new(
            RunStateMachine::new(navigators, branches, gate, tier3.clone(), event_bus.clone())
                .with_retention(config.retention.finished_runs),
        );
        let tier1 = Arc::new(SwarmCoordinator::new(event_bus.clone()));

        let cancel = CancellationToken::new();
        let tracker = Arc::new(PersistedRuns::new(config.retention.finished_runs));
        let listener = tokio::spawn(persistence_listener(
            event_bus.subscribe("*"),
            runs.clone(),
            tracker.clone(),
            cancel.clone(),
        ));
        let flusher = telemetry.clone().start(cancel.clone());

        telemetry.emit(EngineEvent::health(
            "service.started",
            SOURCE,
            "service",
            HealthStatus::Healthy,
            None,
        ));
        info!(
            recovery = ?config.execution.recovery_strategy,
            default_strategy = %config.execution.default_strategy,
            organization = config.organization.is_some(),
            "Swarm execution service started"
        );

        Ok(SwarmExecutionService {
            config,
            event_bus,
            telemetry,
            tier1,
            tier2,
            tier3,
            runs,
            swarms,
            users,
            tracker,
            cancel,
            background: Mutex::new(vec![listener, flusher]),
            run_tasks: Mutex::new(Vec::new()),
        })
    }
}

// ── Service ─────────────────────────────────────────────────────

/// Entry point: starts swarms and runs, answers status queries, and shuts
/// the tiers down in order.
pub struct SwarmExecutionService {
    config: EngineConfig,
    event_bus: Arc<EventBus>,
    telemetry: Arc<TelemetryShim>,
    tier1: Arc<SwarmCoordinator>,
    tier2: Arc<RunStateMachine>,
    tier3: Arc<UnifiedExecutor>,
    runs: Arc<dyn RunPersistence>,
    swarms: Arc<dyn SwarmPersistence>,
    users: Arc<dyn UserDirectory>,
    tracker: Arc<PersistedRuns>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    run_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SwarmExecutionService {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.event_bus.subscribe(pattern)
    }

    pub fn tools(&self) -> Arc<RwLock<ToolRegistry>> {
        self.tier3.tools()
    }

    /// Register a swarm and launch its initial runs. Returns once the swarm
    /// is registered; runs progress in the background.
    pub async fn start_swarm(&self, request: SwarmRequest) -> Result<SwarmId> {
        self.require_user(&request.user_id).await?;

        let swarm = Swarm {
            id: SwarmId::new(),
            user_id: request.user_id.clone(),
            name: request.name,
            goal: request.goal,
            resources: request.resources,
            blackboard: request.blackboard,
            shared_knowledge: request.shared_knowledge,
            coordination: request.coordination,
            child_runs: Vec::new(),
            state: SwarmState::Active,
            created_at: Utc::now(),
        };
        let swarm_id = swarm.id.clone();

        if let Err(e) = self.swarms.create_swarm(&swarm).await {
            warn!(swarm_id = %swarm_id, error = %e, "Failed to persist swarm; continuing in memory");
        }
        self.tier1.register(swarm);

        for mut run in request.initial_runs {
            run.user_id = request.user_id.clone();
            run.swarm_id = Some(swarm_id.clone());
            let routine_id = run.routine.id.clone();
            if let Err(e) = self.start_run(run).await {
                warn!(swarm_id = %swarm_id, routine_id = %routine_id, error = %e, "Failed to start initial run");
            }
        }
        Ok(swarm_id)
    }

    /// Create a run and execute it in the background. Returns its id as soon
    /// as the run is registered.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunId> {
        self.require_user(&request.user_id).await?;

        let run_id = RunId::new();
        let config = request
            .config
            .unwrap_or_else(|| self.config.execution.clone());
        let exec = match &request.swarm_id {
            Some(swarm_id) => {
                let swarm = self.live_swarm(swarm_id).await?;
                if self.tier1.budget_exhausted(swarm_id) {
                    return Err(StrataError::LimitExceeded(format!(
                        "swarm {} has no credits remaining",
                        swarm_id
                    )));
                }
                let mut exec = RunStateMachine::initialize_context_from_swarm(
                    &swarm,
                    run_id.clone(),
                    &request.routine,
                    request.inputs.clone(),
                    config,
                );
                exec.user_id = request.user_id.clone();
                exec
            }
            None => ExecutionContext::new(
                run_id.clone(),
                request.routine.id.clone(),
                request.user_id.clone(),
                request.inputs.clone(),
                config,
            ),
        };
        let run = Run::new(exec);

        let record = RunRecord {
            id: run.id.clone(),
            routine_id: run.routine_id.clone(),
            user_id: run.user_id.clone(),
            swarm_id: run.swarm_id.clone(),
            inputs: request.inputs,
            metadata: request.metadata,
            created_at: run.created_at,
            updated_at: run.updated_at,
        };
        if let Err(e) = self.runs.create_run(record).await {
            warn!(run_id = %run_id, error = %e, "Failed to persist run; continuing in memory");
        }

        if let Some(swarm_id) = &run.swarm_id {
            self.tier1.attach_run(swarm_id, &run_id)?;
        }
        self.tier2.register_run(&run);
        info!(run_id = %run_id, routine_id = %run.routine_id, user_id = %run.user_id, "Run started");

        let tier1 = self.tier1.clone();
        let tier2 = self.tier2.clone();
        let swarms = self.swarms.clone();
        let routine = request.routine;
        let task = tokio::spawn(async move {
            let finished = tier2.execute_run(run, &routine).await;
            let Some(swarm_id) = finished.swarm_id.as_ref() else {
                return;
            };
            let charged =
                tier1.record_run_finished(swarm_id, &finished.id, finished.state, finished.usage());
            if let Some(resources) = charged {
                match swarms.update_swarm_usage(swarm_id, &resources).await {
                    Ok(()) => {
                        tier1.release_if_exhausted(swarm_id);
                    }
                    Err(e) => {
                        warn!(swarm_id = %swarm_id, error = %e, "Failed to persist swarm usage")
                    }
                }
            }
        });

        let mut tasks = self.run_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        Ok(run_id)
    }

    /// Wait until a run is terminal and its final state has been handed to
    /// persistence. `None` for runs this process never started or no longer
    /// retains; [`Self::get_run_status`] answers those from persistence.
    pub async fn wait_for_run(&self, run_id: &RunId) -> Option<RunStatusView> {
        let run = self.tier2.wait_for_terminal(run_id).await?;
        self.tracker.wait(run_id, &self.cancel).await;
        Some(RunStatusView::from_run(&run))
    }

    pub async fn get_run_status(&self, run_id: &RunId) -> Result<RunStatusView> {
        if let Some(run) = self.tier2.run_snapshot(run_id) {
            return Ok(RunStatusView::from_run(&run));
        }
        let stored = self
            .runs
            .load_run(run_id)
            .await?
            .ok_or_else(|| StrataError::not_found("Run", run_id.as_str()))?;

        let mut usage = ResourceUsage::default();
        for step in &stored.steps {
            if let Some(step_usage) = &step.resource_usage {
                usage.accumulate(step_usage);
            }
        }
        let error = stored.steps.iter().rev().find_map(|s| s.error.clone());
        Ok(RunStatusView {
            run_id: stored.record.id.clone(),
            routine_id: stored.record.routine_id.clone(),
            user_id: stored.record.user_id.clone(),
            swarm_id: stored.record.swarm_id.clone(),
            state: None,
            status: stored.status,
            progress: None,
            outputs: stored.outputs,
            resource_usage: usage,
            error,
            live: false,
        })
    }

    /// Credits and run counts of a swarm, read through persistence with the
    /// live coordinator as fallback.
    pub async fn get_swarm_status(&self, swarm_id: &SwarmId) -> Result<SwarmStatus> {
        let swarm = match self.swarms.load_swarm(swarm_id).await {
            Ok(Some(swarm)) => swarm,
            Ok(None) => self
                .tier1
                .get(swarm_id)
                .ok_or_else(|| StrataError::not_found("Swarm", swarm_id.as_str()))?,
            Err(e) => {
                warn!(swarm_id = %swarm_id, error = %e, "Swarm lookup failed; using live state");
                self.tier1
                    .get(swarm_id)
                    .ok_or_else(|| StrataError::not_found("Swarm", swarm_id.as_str()))?
            }
        };
        let runs = match self.swarms.list_swarm_runs(swarm_id).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(swarm_id = %swarm_id, error = %e, "Failed to list swarm runs");
                Vec::new()
            }
        };
        Ok(SwarmStatus::from_parts(&swarm, &runs))
    }

    /// Child runs of a swarm live in this process.
    pub fn swarm_runs(&self, swarm_id: &SwarmId) -> Vec<RunId> {
        self.tier1
            .get(swarm_id)
            .map(|s| s.child_runs)
            .unwrap_or_default()
    }

    pub fn get_system_metrics(&self) -> SystemMetrics {
        SystemMetrics {
            tier1: self.tier1.metrics(),
            tier2: self.tier2.metrics(),
            tier3: self.tier3.metrics(),
            event_bus: self.event_bus.stats(),
            telemetry: self.telemetry.stats(),
        }
    }

    pub async fn get_user_run_history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RunSummary>> {
        self.runs.get_user_run_history(user_id, limit, offset).await
    }

    pub fn pause_run(&self, run_id: &RunId) -> Result<()> {
        self.tier2.pause_run(run_id)
    }

    pub fn suspend_run(&self, run_id: &RunId) -> Result<()> {
        self.tier2.suspend_run(run_id)
    }

    pub fn resume_run(&self, run_id: &RunId) -> Result<()> {
        self.tier2.resume_run(run_id)
    }

    pub fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        self.tier2.cancel_run(run_id)
    }

    /// Stop tier3, tier2 and tier1 in that order, then the background tasks.
    /// A tier that fails to stop is logged and skipped.
    pub async fn shutdown(&self) {
        info!("Shutting down swarm execution service");
        self.telemetry.emit(EngineEvent::health(
            "service.stopping",
            SOURCE,
            "service",
            HealthStatus::Degraded,
            None,
        ));

        let tiers: [&dyn TierLifecycle; 3] =
            [self.tier3.as_ref(), self.tier2.as_ref(), self.tier1.as_ref()];
        for tier in tiers {
            match tier.shutdown().await {
                Ok(()) => debug!(tier = %tier.tier(), "Tier stopped"),
                Err(e) => error!(tier = %tier.tier(), error = %e, "Error during shutdown"),
            }
        }

        let drain = Duration::from_millis(self.config.shutdown.drain_timeout_ms);
        let tasks: Vec<JoinHandle<()>> = self
            .run_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(drain, task).await.is_err() {
                warn!("Run task did not stop in time; aborting");
                abort.abort();
            }
        }

        self.cancel.cancel();
        let background: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let flushed = self.telemetry.flush();
        self.event_bus.close();
        info!(flushed, "Swarm execution service stopped");
    }

    async fn require_user(&self, user_id: &str) -> Result<()> {
        match self.users.user_exists(user_id).await? {
            true => Ok(()),
            false => Err(StrataError::not_found("User", user_id)),
        }
    }

    /// A swarm known to tier1, loading it from persistence if needed.
    async fn live_swarm(&self, swarm_id: &SwarmId) -> Result<Swarm> {
        if let Some(swarm) = self.tier1.get(swarm_id) {
            return Ok(swarm);
        }
        let swarm = self
            .swarms
            .load_swarm(swarm_id)
            .await?
            .ok_or_else(|| StrataError::not_found("Swarm", swarm_id.as_str()))?;
        if swarm.state != SwarmState::Active {
            return Err(StrataError::Validation(format!(
                "swarm {} is {}",
                swarm_id,
                swarm.state.as_str()
            )));
        }
        self.tier1.register(swarm.clone());
        Ok(swarm)
    }
}

// ── Persistence listener ────────────────────────────────────────

/// The most recent runs whose terminal state the listener has processed.
struct PersistedRuns {
    done: Mutex<VecDeque<RunId>>,
    capacity: usize,
    version: watch::Sender<u64>,
}

impl PersistedRuns {
    fn new(capacity: usize) -> Self {
        Self {
            done: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            version: watch::channel(0).0,
        }
    }

    fn mark(&self, run_id: RunId) {
        {
            let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
            if !done.contains(&run_id) {
                done.push_back(run_id);
            }
            while done.len() > self.capacity {
                done.pop_front();
            }
        }
        self.version.send_modify(|v| *v += 1);
    }

    fn contains(&self, run_id: &RunId) -> bool {
        self.done
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(run_id)
    }

    async fn wait(&self, run_id: &RunId, cancel: &CancellationToken) {
        let mut version = self.version.subscribe();
        while !self.contains(run_id) {
            tokio::select! {
                changed = version.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

/// Single writer of run state, steps and outputs. One subscription keeps the
/// events of a run in publish order.
async fn persistence_listener(
    mut events: Subscription,
    runs: Arc<dyn RunPersistence>,
    tracker: Arc<PersistedRuns>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => persist_event(runs.as_ref(), &tracker, &event).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                for event in events.drain() {
                    persist_event(runs.as_ref(), &tracker, &event).await;
                }
                break;
            }
        }
    }
    debug!("Persistence listener stopped");
}

async fn persist_event(runs: &dyn RunPersistence, tracker: &PersistedRuns, event: &EngineEvent) {
    if !(event.event_type.starts_with("run.") || event.event_type.starts_with("step.")) {
        return;
    }
    let Some(data) = event.payload.data() else {
        return;
    };
    let Some(run_id) = data.get("runId").and_then(|v| v.as_str()).map(RunId::from) else {
        return;
    };

    let outcome = match event.event_type.as_str() {
        "run.state_changed" => {
            let state: RunState = match serde_json::from_value(data["to"].clone()) {
                Ok(state) => state,
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Malformed state change event");
                    return;
                }
            };
            let result = runs.update_run_state(&run_id, state).await;
            if state.is_terminal() {
                tracker.mark(run_id.clone());
            }
            result
        }
        "step.recorded" => match serde_json::from_value::<StepRecord>(data["record"].clone()) {
            Ok(record) => runs.record_step_execution(&run_id, record).await,
            Err(e) => Err(e.into()),
        },
        "run.outputs" => match serde_json::from_value::<VarMap>(data["outputs"].clone()) {
            Ok(outputs) => runs.update_run_outputs(&run_id, &outputs).await,
            Err(e) => Err(e.into()),
        },
        _ => return,
    };

    if let Err(e) = outcome {
        warn!(
            run_id = %run_id,
            event_type = %event.event_type,
            error = %e,
            "Failed to persist run event"
        );
    }
}
