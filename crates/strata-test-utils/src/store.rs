use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;

use strata_core::error::{Result, StrataError};
use strata_core::traits::{BranchStore, RunPersistence, SwarmPersistence, UserDirectory};
use strata_core::types::*;

/// In-memory implementation of every persistence collaborator.
///
/// `fail_runs` and `fail_branches` make the corresponding calls return
/// `StrataError::Persistence`.
#[derive(Default)]
pub struct InMemoryStore {
    users: Mutex<HashSet<String>>,
    runs: Mutex<HashMap<RunId, StoredRun>>,
    swarms: Mutex<HashMap<SwarmId, Swarm>>,
    branches: Mutex<HashMap<RunId, Vec<Branch>>>,
    state_log: Mutex<Vec<(RunId, RunState)>>,
    fail_runs: AtomicBool,
    fail_branches: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user_id: &str) -> Self {
        self.add_user(user_id);
        self
    }

    pub fn add_user(&self, user_id: &str) {
        self.users.lock().unwrap().insert(user_id.to_string());
    }

    pub fn set_fail_runs(&self, fail: bool) {
        self.fail_runs.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_branches(&self, fail: bool) {
        self.fail_branches.store(fail, Ordering::SeqCst);
    }

    /// Seed a swarm record directly.
    pub fn insert_swarm(&self, swarm: Swarm) {
        self.swarms.lock().unwrap().insert(swarm.id.clone(), swarm);
    }

    pub fn run(&self, run_id: &RunId) -> Option<StoredRun> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    pub fn swarm(&self, swarm_id: &SwarmId) -> Option<Swarm> {
        self.swarms.lock().unwrap().get(swarm_id).cloned()
    }

    /// Every state persisted for a run, in order.
    pub fn state_history(&self, run_id: &RunId) -> Vec<RunState> {
        self.state_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn stored_branches(&self, run_id: &RunId) -> Vec<Branch> {
        self.branches
            .lock()
            .unwrap()
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check_runs(&self) -> Result<()> {
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(StrataError::Persistence("run store unavailable".into()));
        }
        Ok(())
    }

    fn check_branches(&self) -> Result<()> {
        if self.fail_branches.load(Ordering::SeqCst) {
            return Err(StrataError::Persistence("branch store unavailable".into()));
        }
        Ok(())
    }

    fn with_run<T>(&self, run_id: &RunId, f: impl FnOnce(&mut StoredRun) -> T) -> Result<T> {
        self.check_runs()?;
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| StrataError::not_found("Run", run_id.as_str()))?;
        run.record.updated_at = Utc::now();
        Ok(f(run))
    }
}

impl RunPersistence for InMemoryStore {
    fn create_run(&self, record: RunRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check_runs()?;
            self.runs.lock().unwrap().insert(
                record.id.clone(),
                StoredRun {
                    record,
                    status: PersistedRunStatus::Scheduled,
                    outputs: VarMap::new(),
                    steps: Vec::new(),
                },
            );
            Ok(())
        })
    }

    fn update_run_state(&self, run_id: &RunId, state: RunState) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.with_run(&run_id, |run| run.status = state.into())?;
            self.state_log.lock().unwrap().push((run_id, state));
            Ok(())
        })
    }

    fn record_step_execution(
        &self,
        run_id: &RunId,
        step: StepRecord,
    ) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        Box::pin(async move { self.with_run(&run_id, |run| run.steps.push(step)) })
    }

    fn load_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StoredRun>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.check_runs()?;
            Ok(self.runs.lock().unwrap().get(&run_id).cloned())
        })
    }

    fn get_user_run_history(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.check_runs()?;
            let runs = self.runs.lock().unwrap();
            let mut summaries: Vec<RunSummary> = runs
                .values()
                .filter(|r| r.record.user_id == user_id)
                .map(|r| r.summary())
                .collect();
            summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(summaries.into_iter().skip(offset).take(limit).collect())
        })
    }

    fn update_run_outputs(&self, run_id: &RunId, outputs: &VarMap) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let outputs = outputs.clone();
        Box::pin(async move { self.with_run(&run_id, |run| run.outputs = outputs) })
    }
}

impl SwarmPersistence for InMemoryStore {
    fn create_swarm(&self, swarm: &Swarm) -> BoxFuture<'_, Result<()>> {
        let swarm = swarm.clone();
        Box::pin(async move {
            self.check_runs()?;
            self.insert_swarm(swarm);
            Ok(())
        })
    }

    fn load_swarm(&self, swarm_id: &SwarmId) -> BoxFuture<'_, Result<Option<Swarm>>> {
        let swarm_id = swarm_id.clone();
        Box::pin(async move {
            self.check_runs()?;
            Ok(self.swarm(&swarm_id))
        })
    }

    fn update_swarm_usage(
        &self,
        swarm_id: &SwarmId,
        resources: &SwarmResources,
    ) -> BoxFuture<'_, Result<()>> {
        let swarm_id = swarm_id.clone();
        let resources = *resources;
        Box::pin(async move {
            self.check_runs()?;
            let mut swarms = self.swarms.lock().unwrap();
            let swarm = swarms
                .get_mut(&swarm_id)
                .ok_or_else(|| StrataError::not_found("Swarm", swarm_id.as_str()))?;
            swarm.resources = resources;
            Ok(())
        })
    }

    fn list_swarm_runs(&self, swarm_id: &SwarmId) -> BoxFuture<'_, Result<Vec<RunSummary>>> {
        let swarm_id = swarm_id.clone();
        Box::pin(async move {
            self.check_runs()?;
            Ok(self
                .runs
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.record.swarm_id.as_ref() == Some(&swarm_id))
                .map(|r| r.summary())
                .collect())
        })
    }
}

impl UserDirectory for InMemoryStore {
    fn user_exists(&self, user_id: &str) -> BoxFuture<'_, Result<bool>> {
        let user_id = user_id.to_string();
        Box::pin(async move { Ok(self.users.lock().unwrap().contains(&user_id)) })
    }
}

impl BranchStore for InMemoryStore {
    fn save_branch(&self, branch: &Branch) -> BoxFuture<'_, Result<()>> {
        let branch = branch.clone();
        Box::pin(async move {
            self.check_branches()?;
            self.branches
                .lock()
                .unwrap()
                .entry(branch.run_id.clone())
                .or_default()
                .push(branch);
            Ok(())
        })
    }

    fn update_branch(&self, branch: &Branch) -> BoxFuture<'_, Result<()>> {
        let branch = branch.clone();
        Box::pin(async move {
            self.check_branches()?;
            let mut all = self.branches.lock().unwrap();
            let list = all.entry(branch.run_id.clone()).or_default();
            match list.iter_mut().find(|b| b.id == branch.id) {
                Some(existing) => *existing = branch,
                None => list.push(branch),
            }
            Ok(())
        })
    }

    fn delete_branches(&self, run_id: &RunId, ids: &[BranchId]) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        let ids = ids.to_vec();
        Box::pin(async move {
            self.check_branches()?;
            if let Some(list) = self.branches.lock().unwrap().get_mut(&run_id) {
                list.retain(|b| !ids.contains(&b.id));
            }
            Ok(())
        })
    }

    fn load_branches(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Branch>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            self.check_branches()?;
            Ok(self.stored_branches(&run_id))
        })
    }
}

/// Branch store whose every call fails.
#[derive(Default)]
pub struct FailingBranchStore;

impl FailingBranchStore {
    fn fail<T: Send + 'static>() -> BoxFuture<'static, Result<T>> {
        Box::pin(async { Err(StrataError::Persistence("connection refused".into())) })
    }
}

impl BranchStore for FailingBranchStore {
    fn save_branch(&self, _branch: &Branch) -> BoxFuture<'_, Result<()>> {
        Self::fail()
    }

    fn update_branch(&self, _branch: &Branch) -> BoxFuture<'_, Result<()>> {
        Self::fail()
    }

    fn delete_branches(&self, _run_id: &RunId, _ids: &[BranchId]) -> BoxFuture<'_, Result<()>> {
        Self::fail()
    }

    fn load_branches(&self, _run_id: &RunId) -> BoxFuture<'_, Result<Vec<Branch>>> {
        Self::fail()
    }
}
