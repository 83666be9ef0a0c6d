use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use strata_core::config::{ExecutionConfig, RecoveryStrategy};
use strata_core::error::{Result, StrataError};
use strata_core::event::{EngineEvent, EventBus};
use strata_core::traits::{BranchStore, Navigator, StepExecutor};
use strata_core::types::{
    Branch, BranchId, BranchState, ExecutionContext, Location, NodeKind, ResourceUsage, Routine,
    RunContext, RunId, StepResult, VarMap,
};

const SOURCE: &str = "tier2.branch";

/// How to split execution at a gateway.
#[derive(Debug, Clone, Default)]
pub struct BranchSpec {
    pub parent_step_id: String,
    pub parallel: bool,
    /// Number of branches. Defaults to the number of `steps` lists, or 2.
    pub branch_count: Option<usize>,
    /// Pre-computed step lists, one per branch. Branches without a list are
    /// navigated at execution time. A sequential spec always yields exactly
    /// one branch.
    pub steps: Vec<Vec<Location>>,
}

/// What one branch produced.
#[derive(Debug, Clone)]
pub struct BranchResult {
    pub branch_id: BranchId,
    pub index: usize,
    pub success: bool,
    /// Outputs of the branch's successful steps, later steps winning.
    pub outputs: VarMap,
    /// The branch's isolated context after its last step.
    pub context: RunContext,
    pub resource_usage: ResourceUsage,
    pub completed_steps: Vec<String>,
    /// Final result of every step attempted, in order.
    pub step_results: Vec<StepResult>,
    pub error: Option<String>,
}

/// Creates, runs, merges and cleans up branches of a run.
///
/// Branch records are persisted best effort: a failing [`BranchStore`] is
/// logged and the in-memory table stays authoritative.
pub struct BranchCoordinator {
    store: Arc<dyn BranchStore>,
    event_bus: Arc<EventBus>,
    branches: Mutex<HashMap<RunId, Vec<Branch>>>,
}

impl BranchCoordinator {
    pub fn new(store: Arc<dyn BranchStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            event_bus,
            branches: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_branches_from_config(
        &self,
        run_id: &RunId,
        spec: BranchSpec,
    ) -> Result<Vec<Branch>> {
        let count = spec.branch_count.unwrap_or(if spec.steps.is_empty() {
            2
        } else {
            spec.steps.len()
        });
        let count = if spec.parallel { count } else { 1 };
        if count == 0 {
            return Err(StrataError::Validation(format!(
                "gateway {} produced no branches",
                spec.parent_step_id
            )));
        }

        let now = Utc::now();
        let branches: Vec<Branch> = (0..count)
            .map(|index| Branch {
                id: BranchId::new(),
                run_id: run_id.clone(),
                parent_step_id: spec.parent_step_id.clone(),
                steps: spec.steps.get(index).cloned().unwrap_or_default(),
                state: BranchState::Pending,
                parallel: spec.parallel,
                index,
                error: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        for branch in &branches {
            if let Err(e) = self.store.save_branch(branch).await {
                warn!(
                    run_id = %run_id,
                    branch_id = %branch.id,
                    error = %e,
                    "Failed to persist branch; continuing in memory"
                );
            }
        }

        self.lock()
            .entry(run_id.clone())
            .or_default()
            .extend(branches.iter().cloned());
        debug!(run_id = %run_id, count, parallel = spec.parallel, "Created branches");
        Ok(branches)
    }

    /// Run every branch and return one result per branch, ordered by index.
    ///
    /// Each branch gets its own deep copy of the run context, taken before
    /// any branch starts. Parallel branches run concurrently; a failing
    /// branch never cancels its siblings.
    ///
    /// Branches without pre-computed steps are navigated from the gateway's
    /// n-th successor up to the gateway's join, evaluating conditions
    /// against the branch's own variables. Nested parallel gateways fork
    /// branches of their own.
    pub async fn execute_branches(
        &self,
        exec: &ExecutionContext,
        routine: &Routine,
        branches: Vec<Branch>,
        navigator: &dyn Navigator,
        executor: &dyn StepExecutor,
    ) -> Vec<BranchResult> {
        let walk = Walk {
            exec,
            routine,
            navigator,
            executor,
        };
        self.run_all(walk, branches).await
    }

    async fn run_all(&self, walk: Walk<'_>, branches: Vec<Branch>) -> Vec<BranchResult> {
        let parallel = branches.iter().any(|b| b.parallel);
        let prepared: Vec<(Branch, RunContext)> = branches
            .into_iter()
            .map(|b| (b, walk.exec.context.isolated_copy()))
            .collect();

        let mut results = if parallel {
            join_all(
                prepared
                    .into_iter()
                    .map(|(branch, context)| self.run_branch(walk, branch, context)),
            )
            .await
        } else {
            let mut results = Vec::with_capacity(prepared.len());
            for (branch, context) in prepared {
                results.push(self.run_branch(walk, branch, context).await);
            }
            results
        };

        results.sort_by_key(|r| r.index);
        let failed = results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            warn!(run_id = %walk.exec.run_id, failed, total = results.len(), "Branches failed");
        }
        results
    }

    async fn run_branch(
        &self,
        walk: Walk<'_>,
        mut branch: Branch,
        mut context: RunContext,
    ) -> BranchResult {
        let planned = !branch.steps.is_empty();
        self.set_state(&mut branch, BranchState::Running, None).await;
        self.publish(
            &branch,
            "branch.started",
            json!({ "steps": branch.steps.len(), "planned": planned }),
        );

        let mut progress = BranchProgress::default();
        let outcome = if planned {
            run_step_list(walk, &branch, &mut context, &mut progress).await
        } else {
            self.navigate_branch(walk, &mut branch, &mut context, &mut progress)
                .await
        };
        let error = outcome.err();

        let success = error.is_none();
        if success {
            self.set_state(&mut branch, BranchState::Completed, None).await;
            self.publish(&branch, "branch.completed", json!({ "outputs": progress.outputs }));
        } else {
            self.set_state(&mut branch, BranchState::Failed, error.clone()).await;
            self.publish(&branch, "branch.failed", json!({ "error": error }));
        }

        BranchResult {
            branch_id: branch.id,
            index: branch.index,
            success,
            outputs: progress.outputs,
            context,
            resource_usage: progress.usage,
            completed_steps: progress.completed_steps,
            step_results: progress.step_results,
            error,
        }
    }

    /// Walk one branch of its parent gateway, stopping at the gateway's join
    /// or an end node. Executed locations are appended to `branch.steps`.
    async fn navigate_branch(
        &self,
        walk: Walk<'_>,
        branch: &mut Branch,
        context: &mut RunContext,
        progress: &mut BranchProgress,
    ) -> std::result::Result<(), String> {
        let Walk {
            exec,
            routine,
            navigator,
            executor,
        } = walk;
        let gateway = Location::new(routine.id.clone(), branch.parent_step_id.clone());
        let entry = navigator
            .get_successors(routine, &gateway)
            .map_err(|e| e.to_string())?
            .into_iter()
            .nth(branch.index);
        let Some(entry) = entry else {
            warn!(branch_id = %branch.id, index = branch.index, "Branch has no steps");
            return Ok(());
        };
        let until = navigator
            .get_next_locations(routine, &gateway, &context.variables)
            .map_err(|e| e.to_string())?
            .into_iter()
            .next();

        let mut frontier = VecDeque::from([entry]);
        let mut visits = HashMap::new();
        while let Some(location) = pop_ready(&mut frontier, navigator, routine) {
            if until.as_ref() == Some(&location) {
                continue;
            }
            count_visit(&mut visits, &location, exec.config.max_node_visits)
                .map_err(|e| e.to_string())?;
            let info = navigator
                .get_step_info(routine, &location)
                .map_err(|e| e.to_string())?;

            match info.kind {
                NodeKind::End => continue,
                NodeKind::ParallelGateway => {
                    self.run_nested(walk, &location, context, progress).await?
                }
                kind if kind.is_executable() => {
                    let result = execute_with_recovery(
                        executor,
                        &exec.run_id,
                        routine,
                        &location,
                        context,
                        &exec.config,
                    )
                    .await;
                    branch.steps.push(location.clone());
                    progress.record(&location, result, context)?;
                }
                _ => {}
            }

            let next = navigator
                .get_next_locations(routine, &location, &context.variables)
                .map_err(|e| e.to_string())?;
            for location in next {
                enqueue_next(&mut frontier, location);
            }
        }
        Ok(())
    }

    /// Fork the branches of a gateway met inside a branch and fold them back
    /// into that branch.
    fn run_nested<'a>(
        &'a self,
        walk: Walk<'a>,
        gateway: &'a Location,
        context: &'a mut RunContext,
        progress: &'a mut BranchProgress,
    ) -> BoxFuture<'a, std::result::Result<(), String>> {
        Box::pin(async move {
            let count = walk
                .navigator
                .get_successors(walk.routine, gateway)
                .map_err(|e| e.to_string())?
                .len();
            let spec = BranchSpec {
                parent_step_id: gateway.node_id().to_string(),
                parallel: true,
                branch_count: Some(count),
                steps: Vec::new(),
            };
            let branches = self
                .create_branches_from_config(&walk.exec.run_id, spec)
                .await
                .map_err(|e| e.to_string())?;

            let mut exec = walk.exec.clone();
            exec.context = context.isolated_copy();
            let results = self.run_all(Walk { exec: &exec, ..walk }, branches).await;

            progress.absorb(&results);
            *context = self.merge_branch_results(context, &results);
            match results.iter().find(|r| !r.success) {
                Some(failed) => Err(format!(
                    "branch {} of gateway {} failed: {}",
                    failed.index,
                    gateway.node_id(),
                    failed.error.as_deref().unwrap_or("unknown error")
                )),
                None => Ok(()),
            }
        })
    }

    /// Combine branch outputs into a new context derived from `parent`.
    ///
    /// Keys written by one branch are copied as is. A key written by several
    /// branches becomes an array of their values ordered by branch index.
    /// The result's blackboard is a fresh copy of the parent's; branch
    /// blackboard writes stay in their branches.
    pub fn merge_branch_results(&self, parent: &RunContext, results: &[BranchResult]) -> RunContext {
        let mut merged = parent.isolated_copy();
        merged.variables.extend(merge_outputs(results));
        merged
    }

    /// Drop terminal branches of a run from memory and from the store.
    pub async fn cleanup(&self, run_id: &RunId) -> usize {
        let removed: Vec<BranchId> = {
            let mut table = self.lock();
            let Some(list) = table.get_mut(run_id) else {
                return 0;
            };
            let (done, live): (Vec<Branch>, Vec<Branch>) =
                list.drain(..).partition(|b| b.state.is_terminal());
            *list = live;
            if list.is_empty() {
                table.remove(run_id);
            }
            done.into_iter().map(|b| b.id).collect()
        };
        if removed.is_empty() {
            return 0;
        }
        if let Err(e) = self.store.delete_branches(run_id, &removed).await {
            warn!(run_id = %run_id, error = %e, "Failed to delete persisted branches");
        }
        debug!(run_id = %run_id, count = removed.len(), "Cleaned up branches");
        removed.len()
    }

    /// Reload persisted branches into memory, replacing what is there.
    pub async fn restore_branches(&self, run_id: &RunId) -> Result<Vec<Branch>> {
        let mut branches = self.store.load_branches(run_id).await?;
        branches.sort_by_key(|b| b.index);
        info!(run_id = %run_id, count = branches.len(), "Restored branches");
        self.lock().insert(run_id.clone(), branches.clone());
        Ok(branches)
    }

    /// In-memory branches of a run.
    pub fn branches(&self, run_id: &RunId) -> Vec<Branch> {
        self.lock().get(run_id).cloned().unwrap_or_default()
    }

    async fn set_state(&self, branch: &mut Branch, state: BranchState, error: Option<String>) {
        branch.state = state;
        branch.error = error;
        branch.updated_at = Utc::now();
        {
            let mut table = self.lock();
            if let Some(entry) = table
                .get_mut(&branch.run_id)
                .and_then(|list| list.iter_mut().find(|b| b.id == branch.id))
            {
                *entry = branch.clone();
            }
        }
        if let Err(e) = self.store.update_branch(branch).await {
            warn!(branch_id = %branch.id, error = %e, "Failed to persist branch state");
        }
    }

    fn publish(&self, branch: &Branch, event_type: &str, extra: Value) {
        let mut data = json!({
            "runId": branch.run_id,
            "branchId": branch.id,
            "index": branch.index,
            "parentStepId": branch.parent_step_id,
        });
        if let (Some(data), Value::Object(extra)) = (data.as_object_mut(), extra) {
            data.extend(extra);
        }
        self.event_bus.publish(
            EngineEvent::business(event_type, SOURCE, branch.id.as_str(), data)
                .with_correlation(branch.run_id.as_str()),
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Vec<Branch>>> {
        self.branches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What a branch walks with.
#[derive(Clone, Copy)]
struct Walk<'a> {
    exec: &'a ExecutionContext,
    routine: &'a Routine,
    navigator: &'a dyn Navigator,
    executor: &'a dyn StepExecutor,
}

/// Accumulated effect of the steps a branch ran.
#[derive(Default)]
struct BranchProgress {
    outputs: VarMap,
    usage: ResourceUsage,
    completed_steps: Vec<String>,
    step_results: Vec<StepResult>,
}

impl BranchProgress {
    /// Fold one step result in. A failed step becomes the branch error.
    fn record(
        &mut self,
        location: &Location,
        result: StepResult,
        context: &mut RunContext,
    ) -> std::result::Result<(), String> {
        self.usage.accumulate(&result.resource_usage);
        if !result.success {
            let error = format!(
                "step {} failed: {}",
                location.node_id(),
                result.error.as_deref().unwrap_or("unknown error")
            );
            self.step_results.push(result);
            return Err(error);
        }
        if !result.skipped {
            for (key, value) in result.output_entries() {
                context.variables.insert(key.clone(), value.clone());
                self.outputs.insert(key, value);
            }
            self.completed_steps.push(location.node_id().to_string());
        }
        self.step_results.push(result);
        Ok(())
    }

    fn absorb(&mut self, nested: &[BranchResult]) {
        for result in nested {
            self.usage.accumulate(&result.resource_usage);
            self.completed_steps
                .extend(result.completed_steps.iter().cloned());
            self.step_results.extend(result.step_results.iter().cloned());
        }
        self.outputs.extend(merge_outputs(nested));
    }
}

async fn run_step_list(
    walk: Walk<'_>,
    branch: &Branch,
    context: &mut RunContext,
    progress: &mut BranchProgress,
) -> std::result::Result<(), String> {
    for location in &branch.steps {
        let result = execute_with_recovery(
            walk.executor,
            &walk.exec.run_id,
            walk.routine,
            location,
            context,
            &walk.exec.config,
        )
        .await;
        progress.record(location, result, context)?;
    }
    Ok(())
}

/// Queue a location unless it is already waiting.
pub(crate) fn enqueue_next(frontier: &mut VecDeque<Location>, next: Location) {
    if !frontier.contains(&next) {
        frontier.push_back(next);
    }
}

/// Take the first waiting location that no other waiting location leads
/// to, so a node reached by several paths runs once, after all of them.
/// Locations on a common cycle do not hold each other back.
pub(crate) fn pop_ready(
    frontier: &mut VecDeque<Location>,
    navigator: &dyn Navigator,
    routine: &Routine,
) -> Option<Location> {
    let blocked = |candidate: &Location| {
        frontier.iter().any(|other| {
            other != candidate
                && reaches(navigator, routine, other, candidate)
                && !reaches(navigator, routine, candidate, other)
        })
    };
    let index = frontier
        .iter()
        .position(|candidate| !blocked(candidate))
        .unwrap_or(0);
    frontier.remove(index)
}

/// Whether `target` is structurally reachable from `from`.
fn reaches(navigator: &dyn Navigator, routine: &Routine, from: &Location, target: &Location) -> bool {
    let mut queue = VecDeque::from([from.clone()]);
    let mut seen = HashSet::new();
    while let Some(location) = queue.pop_front() {
        let Ok(successors) = navigator.get_successors(routine, &location) else {
            continue;
        };
        for next in successors {
            if &next == target {
                return true;
            }
            if seen.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    false
}

/// Count a visit to `location`, failing once it exceeds `max`.
pub(crate) fn count_visit(
    visits: &mut HashMap<String, usize>,
    location: &Location,
    max: usize,
) -> Result<()> {
    let count = visits.entry(location.node_id().to_string()).or_default();
    *count += 1;
    if *count > max {
        return Err(StrataError::LimitExceeded(format!(
            "node {} visited more than {} times",
            location.node_id(),
            max
        )));
    }
    Ok(())
}

/// Outputs of all branches, collisions collected into arrays by branch index.
pub fn merge_outputs(results: &[BranchResult]) -> VarMap {
    let mut ordered: Vec<&BranchResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.index);

    let mut collected: Vec<(String, Vec<Value>)> = Vec::new();
    for result in ordered {
        let mut keys: Vec<&String> = result.outputs.keys().collect();
        keys.sort();
        for key in keys {
            let value = result.outputs[key].clone();
            match collected.iter_mut().find(|(k, _)| k == key) {
                Some((_, values)) => values.push(value),
                None => collected.push((key.clone(), vec![value])),
            }
        }
    }

    collected
        .into_iter()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                Value::Array(values)
            };
            (key, value)
        })
        .collect()
}

/// Execute a step, re-attempting failures when the run's recovery strategy
/// is `retry`. Returns the last attempt's result.
pub(crate) async fn execute_with_recovery(
    executor: &dyn StepExecutor,
    run_id: &RunId,
    routine: &Routine,
    location: &Location,
    context: &mut RunContext,
    config: &ExecutionConfig,
) -> StepResult {
    let retries = match config.recovery_strategy {
        RecoveryStrategy::Retry => config.max_retries,
        RecoveryStrategy::Fail => 0,
    };
    let mut attempt = 0;
    loop {
        let result = executor.execute_at(run_id, routine, location, context).await;
        if result.success || attempt >= retries {
            return result;
        }
        attempt += 1;
        warn!(
            run_id = %run_id,
            step = location.node_id(),
            attempt,
            max_retries = retries,
            error = result.error.as_deref().unwrap_or_default(),
            "Retrying failed step"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_core::types::ExecutionContext;
    use strata_navigator::NativeNavigator;
    use strata_test_utils::{fixtures, FailingBranchStore, InMemoryStore, LogCapture};

    /// Writes `<node>` as output `result` and can fail named nodes a number of times.
    #[derive(Default)]
    struct FakeExecutor {
        fail_node: Option<String>,
        failures: usize,
        calls: AtomicUsize,
    }

    impl StepExecutor for FakeExecutor {
        fn execute_at<'a>(
            &'a self,
            _run_id: &'a RunId,
            _routine: &'a Routine,
            location: &'a Location,
            context: &'a mut RunContext,
        ) -> BoxFuture<'a, StepResult> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                let node = location.node_id();
                if self.fail_node.as_deref() == Some(node) && call < self.failures {
                    return StepResult::failure(node, "fake", "flaky");
                }
                context
                    .blackboard
                    .insert("shared".into(), json!(format!("modified-by-{}", node)));
                StepResult::success(
                    node,
                    "fake",
                    json!({ "result": node }),
                    ResourceUsage::new(1, 1, 0),
                )
            })
        }
    }

    fn exec_context(run_id: &str) -> ExecutionContext {
        let mut exec = ExecutionContext::new(
            RunId::from(run_id),
            "parallel-routine",
            "user",
            VarMap::new(),
            ExecutionConfig::default(),
        );
        exec.context
            .blackboard
            .insert("shared".into(), json!("original"));
        exec
    }

    fn coordinator(store: Arc<dyn BranchStore>) -> BranchCoordinator {
        BranchCoordinator::new(store, Arc::new(EventBus::default()))
    }

    fn spec(count: Option<usize>) -> BranchSpec {
        BranchSpec {
            parent_step_id: "split".into(),
            parallel: true,
            branch_count: count,
            steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn branches_do_not_see_each_others_writes() {
        let store = Arc::new(InMemoryStore::new());
        let coord = coordinator(store.clone());
        let exec = exec_context("run-123");
        let routine = fixtures::parallel_routine();

        let branches = coord
            .create_branches_from_config(&exec.run_id, spec(Some(2)))
            .await
            .unwrap();
        assert_eq!(store.stored_branches(&exec.run_id).len(), 2);

        let results = coord
            .execute_branches(&exec, &routine, branches, &NativeNavigator::new(), &FakeExecutor::default())
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].context.blackboard["shared"], json!("modified-by-left"));
        assert_eq!(results[1].context.blackboard["shared"], json!("modified-by-right"));
        assert_eq!(exec.context.blackboard["shared"], json!("original"));
        assert!(coord
            .branches(&exec.run_id)
            .iter()
            .all(|b| b.state == BranchState::Completed));
    }

    #[tokio::test]
    async fn merge_collects_collisions_in_index_order() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        let exec = exec_context("run-merge");
        let routine = fixtures::parallel_routine();
        let branches = coord
            .create_branches_from_config(&exec.run_id, spec(None))
            .await
            .unwrap();
        let results = coord
            .execute_branches(&exec, &routine, branches, &NativeNavigator::new(), &FakeExecutor::default())
            .await;

        let merged = coord.merge_branch_results(&exec.context, &results);
        assert_eq!(merged.variables["result"], json!(["left", "right"]));
        assert_eq!(merged.blackboard["shared"], json!("original"));
    }

    #[test]
    fn merge_keeps_single_writers_and_nested_values() {
        let result = |index: usize, outputs: VarMap| BranchResult {
            branch_id: BranchId::new(),
            index,
            success: true,
            outputs,
            context: RunContext::new(),
            resource_usage: ResourceUsage::default(),
            completed_steps: vec![],
            step_results: vec![],
            error: None,
        };
        let results = vec![
            result(1, VarMap::from([("k".into(), json!({"from": 1})), ("only_b".into(), json!(2))])),
            result(0, VarMap::from([("k".into(), json!({"from": 0})), ("only_a".into(), json!(1))])),
        ];
        let merged = merge_outputs(&results);
        assert_eq!(merged["k"], json!([{"from": 0}, {"from": 1}]));
        assert_eq!(merged["only_a"], json!(1));
        assert_eq!(merged["only_b"], json!(2));
    }

    #[tokio::test]
    async fn merged_blackboard_is_independent_of_parent() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        let mut parent = RunContext::new();
        parent
            .blackboard
            .insert("nested".into(), json!({"deep": {"list": [1]}}));

        let mut merged = coord.merge_branch_results(&parent, &[]);
        merged.blackboard.get_mut("nested").unwrap()["deep"]["list"]
            .as_array_mut()
            .unwrap()
            .push(json!(2));
        assert_eq!(parent.blackboard["nested"], json!({"deep": {"list": [1]}}));
    }

    #[tokio::test]
    async fn failing_store_is_logged_not_fatal() {
        let logs = LogCapture::new();
        let _guard = logs.install();
        let coord = coordinator(Arc::new(FailingBranchStore));
        let exec = exec_context("run-store");

        let branches = coord
            .create_branches_from_config(&exec.run_id, spec(Some(2)))
            .await
            .unwrap();
        assert_eq!(branches.len(), 2);
        assert!(logs.contains("Failed to persist branch"));

        let results = coord
            .execute_branches(
                &exec,
                &fixtures::parallel_routine(),
                branches,
                &NativeNavigator::new(),
                &FakeExecutor::default(),
            )
            .await;
        assert!(results.iter().all(|r| r.success));
        assert!(coord.restore_branches(&exec.run_id).await.is_err());
    }

    #[tokio::test]
    async fn zero_branches_rejected() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        let err = coord
            .create_branches_from_config(&RunId::from("r"), spec(Some(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
    }

    #[tokio::test]
    async fn sequential_spec_always_yields_one_branch() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        for count in [Some(0), Some(3), None] {
            let branches = coord
                .create_branches_from_config(
                    &RunId::from("r-seq"),
                    BranchSpec {
                        parallel: false,
                        ..spec(count)
                    },
                )
                .await
                .unwrap();
            assert_eq!(branches.len(), 1);
            assert!(!branches[0].parallel);
        }
    }

    #[tokio::test]
    async fn branch_follows_conditions_against_its_variables() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        let routine = fixtures::conditional_parallel_routine();
        let mut exec = ExecutionContext::new(
            RunId::from("run-scored"),
            routine.id.clone(),
            "user",
            VarMap::from([("score".to_string(), json!(0.9))]),
            ExecutionConfig::default(),
        );
        exec.context.blackboard.insert("shared".into(), json!("original"));

        let branches = coord
            .create_branches_from_config(&exec.run_id, spec(Some(2)))
            .await
            .unwrap();
        let results = coord
            .execute_branches(&exec, &routine, branches, &NativeNavigator::new(), &FakeExecutor::default())
            .await;

        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].completed_steps, vec!["high".to_string()]);
        assert_eq!(results[1].completed_steps, vec!["other".to_string()]);
        let stored = coord.branches(&exec.run_id);
        assert_eq!(stored[0].steps, vec![Location::new(routine.id.clone(), "high")]);
    }

    #[tokio::test]
    async fn nested_gateway_forks_inside_its_branch() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        let routine = fixtures::nested_parallel_routine();
        let exec = exec_context("run-nested");
        let branches = coord
            .create_branches_from_config(
                &exec.run_id,
                BranchSpec {
                    parent_step_id: "outer".into(),
                    ..spec(Some(2))
                },
            )
            .await
            .unwrap();
        let results = coord
            .execute_branches(&exec, &routine, branches, &NativeNavigator::new(), &FakeExecutor::default())
            .await;

        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].completed_steps, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(results[0].outputs["result"], json!(["x", "y"]));
        assert_eq!(results[0].resource_usage, ResourceUsage::new(2, 2, 0));
        assert_eq!(results[1].completed_steps, vec!["z".to_string()]);

        let merged = merge_outputs(&results);
        assert_eq!(merged["result"], json!([["x", "y"], "z"]));
        let all = coord.branches(&exec.run_id);
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|b| b.state == BranchState::Completed));
    }

    #[test]
    fn reconverging_node_waits_for_every_path() {
        let routine = fixtures::reconverging_routine();
        let nav = NativeNavigator::new();
        let at = |id: &str| Location::new(routine.id.clone(), id);

        let mut frontier = VecDeque::new();
        enqueue_next(&mut frontier, at("c"));
        enqueue_next(&mut frontier, at("b"));
        enqueue_next(&mut frontier, at("c"));
        assert_eq!(frontier.len(), 2);

        assert_eq!(pop_ready(&mut frontier, &nav, &routine), Some(at("b")));
        assert_eq!(pop_ready(&mut frontier, &nav, &routine), Some(at("c")));
        assert_eq!(pop_ready(&mut frontier, &nav, &routine), None);
    }

    #[test]
    fn visit_limit_is_enforced() {
        let mut visits = HashMap::new();
        let loc = Location::new("r", "loop");
        assert!(count_visit(&mut visits, &loc, 2).is_ok());
        assert!(count_visit(&mut visits, &loc, 2).is_ok());
        let err = count_visit(&mut visits, &loc, 2).unwrap_err();
        assert!(matches!(err, StrataError::LimitExceeded(_)));
    }

    #[tokio::test]
    async fn failed_branch_does_not_stop_sibling() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        let exec = exec_context("run-fail");
        let branches = coord
            .create_branches_from_config(&exec.run_id, spec(None))
            .await
            .unwrap();
        let executor = FakeExecutor {
            fail_node: Some("left".into()),
            failures: usize::MAX,
            ..Default::default()
        };
        let results = coord
            .execute_branches(&exec, &fixtures::parallel_routine(), branches, &NativeNavigator::new(), &executor)
            .await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("flaky"));
        assert!(results[1].success);

        let merged = merge_outputs(&results);
        assert_eq!(merged["result"], json!("right"));
    }

    #[tokio::test]
    async fn retry_recovers_transient_failure() {
        let coord = coordinator(Arc::new(InMemoryStore::new()));
        let mut exec = exec_context("run-retry");
        exec.config.recovery_strategy = RecoveryStrategy::Retry;
        exec.config.max_retries = 2;
        let branches = coord
            .create_branches_from_config(
                &exec.run_id,
                BranchSpec {
                    parent_step_id: "split".into(),
                    parallel: false,
                    branch_count: None,
                    steps: vec![vec![Location::new("parallel-routine", "left")]],
                },
            )
            .await
            .unwrap();
        assert_eq!(branches.len(), 1);

        let executor = FakeExecutor {
            fail_node: Some("left".into()),
            failures: 2,
            ..Default::default()
        };
        let results = coord
            .execute_branches(&exec, &fixtures::parallel_routine(), branches, &NativeNavigator::new(), &executor)
            .await;
        assert!(results[0].success);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cleanup_and_restore() {
        let store = Arc::new(InMemoryStore::new());
        let coord = coordinator(store.clone());
        let exec = exec_context("run-clean");
        let branches = coord
            .create_branches_from_config(&exec.run_id, spec(None))
            .await
            .unwrap();

        let restarted = coordinator(store.clone());
        let restored = restarted.restore_branches(&exec.run_id).await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].index, 0);

        coord
            .execute_branches(&exec, &fixtures::parallel_routine(), branches, &NativeNavigator::new(), &FakeExecutor::default())
            .await;
        assert_eq!(coord.cleanup(&exec.run_id).await, 2);
        assert!(coord.branches(&exec.run_id).is_empty());
        assert!(store.stored_branches(&exec.run_id).is_empty());
    }
}
