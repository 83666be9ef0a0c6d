use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use strata_core::error::{Result, StrataError};
use strata_core::event::{EngineEvent, EventBus};
use strata_core::traits::{TierCommunication, TierLifecycle};
use strata_core::types::{
    ResourceUsage, RunId, RunState, Swarm, SwarmId, SwarmResources, SwarmState, Tier,
    TierMetrics, TierRequest, TierResponse,
};

pub const SOURCE: &str = "tier1.swarm";

/// A registered swarm and how many of its child runs are unfinished.
struct LiveSwarm {
    swarm: Swarm,
    running: usize,
}

/// Tier1: owns live swarms, their budgets and their child runs.
///
/// A swarm whose budget is spent and whose runs have all finished can be
/// released; it is reloaded from persistence if it is addressed again.
pub struct SwarmCoordinator {
    event_bus: Arc<EventBus>,
    swarms: Mutex<HashMap<SwarmId, LiveSwarm>>,
    completed_runs: AtomicU64,
    failed_runs: AtomicU64,
}

impl SwarmCoordinator {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            event_bus,
            swarms: Mutex::new(HashMap::new()),
            completed_runs: AtomicU64::new(0),
            failed_runs: AtomicU64::new(0),
        }
    }

    pub fn register(&self, swarm: Swarm) {
        info!(swarm_id = %swarm.id, goal = %swarm.goal, "Swarm started");
        self.publish(
            "swarm.started",
            &swarm.id,
            json!({ "goal": swarm.goal, "maxCredits": swarm.resources.max_credits }),
        );
        self.lock()
            .insert(swarm.id.clone(), LiveSwarm { swarm, running: 0 });
    }

    pub fn get(&self, swarm_id: &SwarmId) -> Option<Swarm> {
        self.lock().get(swarm_id).map(|live| live.swarm.clone())
    }

    pub fn attach_run(&self, swarm_id: &SwarmId, run_id: &RunId) -> Result<()> {
        let mut swarms = self.lock();
        let live = swarms
            .get_mut(swarm_id)
            .ok_or_else(|| StrataError::not_found("Swarm", swarm_id.as_str()))?;
        if !live.swarm.child_runs.contains(run_id) {
            live.swarm.child_runs.push(run_id.clone());
            live.running += 1;
        }
        Ok(())
    }

    /// Whether the swarm has no credits left to hand to a new run.
    pub fn budget_exhausted(&self, swarm_id: &SwarmId) -> bool {
        self.lock()
            .get(swarm_id)
            .map_or(false, |live| live.swarm.resources.credits_remaining() == 0)
    }

    /// Charge a finished child run to its swarm. Returns the updated budget.
    pub fn record_run_finished(
        &self,
        swarm_id: &SwarmId,
        run_id: &RunId,
        state: RunState,
        usage: &ResourceUsage,
    ) -> Option<SwarmResources> {
        match state {
            RunState::Completed => self.completed_runs.fetch_add(1, Ordering::SeqCst),
            _ => self.failed_runs.fetch_add(1, Ordering::SeqCst),
        };

        let resources = {
            let mut swarms = self.lock();
            let Some(live) = swarms.get_mut(swarm_id) else {
                warn!(swarm_id = %swarm_id, run_id = %run_id, "Run finished for unknown swarm");
                return None;
            };
            live.running = live.running.saturating_sub(1);
            let resources = &mut live.swarm.resources;
            resources.credits_used = resources.credits_used.saturating_add(usage.credits);
            resources.tokens_used = resources.tokens_used.saturating_add(usage.tokens);
            *resources
        };

        self.publish(
            "swarm.usage",
            swarm_id,
            json!({
                "runId": run_id,
                "runState": state,
                "creditsUsed": resources.credits_used,
                "creditsRemaining": resources.credits_remaining(),
                "tokensUsed": resources.tokens_used,
            }),
        );
        Some(resources)
    }

    /// Drop a swarm with no credits left and no unfinished runs. Call once
    /// its usage is persisted. Returns whether the swarm was released.
    pub fn release_if_exhausted(&self, swarm_id: &SwarmId) -> bool {
        let mut swarms = self.lock();
        let idle = swarms.get(swarm_id).is_some_and(|live| {
            live.running == 0 && live.swarm.resources.credits_remaining() == 0
        });
        if idle {
            swarms.remove(swarm_id);
            info!(swarm_id = %swarm_id, "Released exhausted swarm");
        }
        idle
    }

    pub fn active_swarms(&self) -> usize {
        self.lock()
            .values()
            .filter(|live| live.swarm.state == SwarmState::Active)
            .count()
    }

    fn publish(&self, event_type: &str, swarm_id: &SwarmId, data: serde_json::Value) {
        self.event_bus.publish(
            EngineEvent::business(event_type, SOURCE, swarm_id.as_str(), data)
                .with_correlation(swarm_id.as_str()),
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SwarmId, LiveSwarm>> {
        self.swarms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TierCommunication for SwarmCoordinator {
    fn handle_tier_request(&self, request: TierRequest) -> BoxFuture<'_, TierResponse> {
        Box::pin(async move {
            match request {
                TierRequest::GetMetrics => match serde_json::to_value(self.metrics()) {
                    Ok(data) => TierResponse::ok(data),
                    Err(e) => TierResponse::error(e.to_string()),
                },
                TierRequest::ExecuteStep(input) => TierResponse::error(format!(
                    "tier1 does not execute steps (step {})",
                    input.step_id
                )),
            }
        })
    }

    fn emit_tier_event(&self, event: EngineEvent) {
        self.event_bus.publish(event.with_source(SOURCE));
    }
}

impl TierLifecycle for SwarmCoordinator {
    fn tier(&self) -> Tier {
        Tier::Tier1
    }

    fn metrics(&self) -> TierMetrics {
        TierMetrics {
            active: self.active_swarms(),
            completed: self.completed_runs.load(Ordering::SeqCst),
            failed: self.failed_runs.load(Ordering::SeqCst),
        }
    }

    /// Mark every active swarm stopped.
    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let stopped: Vec<SwarmId> = {
                let mut swarms = self.lock();
                swarms
                    .values_mut()
                    .map(|live| &mut live.swarm)
                    .filter(|s| s.state == SwarmState::Active)
                    .map(|s| {
                        s.state = SwarmState::Stopped;
                        s.id.clone()
                    })
                    .collect()
            };
            for id in &stopped {
                self.publish("swarm.stopped", id, json!({}));
            }
            if !stopped.is_empty() {
                info!(count = stopped.len(), "Stopped swarms");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_test_utils::fixtures;

    #[tokio::test]
    async fn usage_is_charged_and_swarms_stop() {
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe("swarm.*");
        let tier1 = SwarmCoordinator::new(bus.clone());
        let swarm = fixtures::swarm("u1", 10, 0);
        let id = swarm.id.clone();
        tier1.register(swarm);

        let run = RunId::from("r1");
        tier1.attach_run(&id, &run).unwrap();
        tier1.attach_run(&id, &run).unwrap();
        assert_eq!(tier1.get(&id).unwrap().child_runs.len(), 1);

        let resources = tier1
            .record_run_finished(&id, &run, RunState::Completed, &ResourceUsage::new(50, 10, 0))
            .unwrap();
        assert_eq!(resources.credits_remaining(), 0);
        assert!(tier1.budget_exhausted(&id));
        assert_eq!(tier1.metrics().completed, 1);

        assert_eq!(tier1.metrics().active, 1);
        tier1.shutdown().await.unwrap();
        assert_eq!(tier1.get(&id).unwrap().state, SwarmState::Stopped);
        assert_eq!(tier1.metrics().active, 0);

        let types: Vec<String> = events.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["swarm.started", "swarm.usage", "swarm.stopped"]);
    }

    #[tokio::test]
    async fn exhausted_swarm_is_released_once_idle() {
        let tier1 = SwarmCoordinator::new(Arc::new(EventBus::default()));
        let swarm = fixtures::swarm("u1", 10, 0);
        let id = swarm.id.clone();
        tier1.register(swarm);
        let (first, second) = (RunId::from("r1"), RunId::from("r2"));
        tier1.attach_run(&id, &first).unwrap();
        tier1.attach_run(&id, &second).unwrap();

        tier1.record_run_finished(&id, &first, RunState::Completed, &ResourceUsage::new(0, 10, 0));
        assert!(tier1.budget_exhausted(&id));
        assert!(!tier1.release_if_exhausted(&id));
        assert!(tier1.get(&id).is_some());

        tier1.record_run_finished(&id, &second, RunState::Failed, &ResourceUsage::default());
        assert!(tier1.release_if_exhausted(&id));
        assert!(tier1.get(&id).is_none());
        assert_eq!(tier1.metrics().active, 0);
        assert!(!tier1.release_if_exhausted(&id));

        let funded = fixtures::swarm("u1", 10, 0);
        let funded_id = funded.id.clone();
        tier1.register(funded);
        assert!(!tier1.release_if_exhausted(&funded_id));
        assert_eq!(tier1.metrics().active, 1);
    }

    #[tokio::test]
    async fn unknown_swarm() {
        let tier1 = SwarmCoordinator::new(Arc::new(EventBus::default()));
        let missing = SwarmId::from("nope");
        assert!(tier1.attach_run(&missing, &RunId::from("r")).is_err());
        assert!(tier1
            .record_run_finished(&missing, &RunId::from("r"), RunState::Failed, &ResourceUsage::default())
            .is_none());
        let response = tier1.handle_tier_request(TierRequest::GetMetrics).await;
        assert!(response.success);
    }
}
