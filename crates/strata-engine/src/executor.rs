use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use strata_core::error::{Result, StrataError};
use strata_core::event::{EngineEvent, EventBus};
use strata_core::telemetry::TelemetryShim;
use strata_core::traits::{TierCommunication, TierLifecycle};
use strata_core::types::{
    ResourceUsage, StepInput, StepResult, StrategyInput, StrategyKind, Tier, TierMetrics,
    TierRequest, TierResponse,
};
use strata_tools::ToolRegistry;

use crate::strategy::StrategyFactory;

pub const SOURCE: &str = "tier3.executor";

/// Tier3: executes single steps through a named strategy.
///
/// Every failure ends up inside the returned [`StepResult`]; nothing here
/// propagates an error to the caller.
pub struct UnifiedExecutor {
    strategies: Arc<StrategyFactory>,
    tools: Arc<RwLock<ToolRegistry>>,
    event_bus: Arc<EventBus>,
    telemetry: Option<Arc<TelemetryShim>>,
    drain_timeout: Duration,
    accepting: AtomicBool,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

/// Decrements the in-flight counter when a step finishes or is dropped.
struct InFlight<'a>(&'a UnifiedExecutor);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.idle.notify_one();
    }
}

impl UnifiedExecutor {
    pub fn new(
        strategies: Arc<StrategyFactory>,
        tools: Arc<RwLock<ToolRegistry>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            strategies,
            tools,
            event_bus,
            telemetry: None,
            drain_timeout: Duration::from_millis(5000),
            accepting: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryShim>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn tools(&self) -> Arc<RwLock<ToolRegistry>> {
        self.tools.clone()
    }

    pub fn active_executions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Execute one step. Publishes `step.started` and then exactly one of
    /// `step.completed` or `step.failed`.
    pub async fn execute_step(&self, input: StepInput) -> StepResult {
        if !self.accepting.load(Ordering::SeqCst) {
            return StepResult::failure(&input.step_id, &input.strategy, "executor is shutting down");
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(self);

        self.publish_step("step.started", &input, json!({ "toolName": input.tool_name }));
        debug!(run_id = %input.run_id, step = %input.step_id, strategy = %input.strategy, "Executing step");

        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = self.run_strategy(&input).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Ok((output, mut usage)) => {
                if usage.duration_ms == 0 {
                    usage.duration_ms = elapsed_ms;
                }
                StepResult::success(&input.step_id, &input.strategy, output, usage)
            }
            Err(error) => {
                let mut failed = StepResult::failure(&input.step_id, &input.strategy, error);
                failed.resource_usage.duration_ms = elapsed_ms;
                failed
            }
        };
        result.started_at = started_at;
        result.completed_at = Utc::now();

        if result.success {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.publish_step(
                "step.completed",
                &input,
                json!({ "resourceUsage": result.resource_usage }),
            );
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
            warn!(
                run_id = %input.run_id,
                step = %input.step_id,
                error = result.error.as_deref().unwrap_or_default(),
                "Step failed"
            );
            self.publish_step("step.failed", &input, json!({ "error": result.error }));
        }

        if let Some(telemetry) = &self.telemetry {
            telemetry.emit(
                EngineEvent::performance(
                    "step.duration",
                    SOURCE,
                    format!("strategy.{}.duration", input.strategy),
                    elapsed_ms as f64,
                    "ms",
                )
                .with_correlation(input.run_id.as_str()),
            );
        }
        result
    }

    /// Resolve strategy and tool, run the strategy, normalize its usage.
    async fn run_strategy(
        &self,
        input: &StepInput,
    ) -> std::result::Result<(Value, ResourceUsage), String> {
        let strategy = self
            .strategies
            .get_strategy(&input.strategy)
            .ok_or_else(|| format!("Strategy '{}' not found", input.strategy))?;

        let tool = match (&input.tool_name, strategy.kind()) {
            (Some(name), StrategyKind::Deterministic) => Some(
                self.tools
                    .read()
                    .await
                    .get(name)
                    .ok_or_else(|| format!("Tool '{}' not found", name))?,
            ),
            _ => None,
        };

        let output = strategy
            .execute(StrategyInput {
                step_id: input.step_id.clone(),
                run_id: input.run_id.clone(),
                input: input.input.clone(),
                tool,
            })
            .await
            .map_err(|e| e.to_string())?;

        if !output.success {
            return Err(output
                .error
                .unwrap_or_else(|| "strategy reported failure".to_string()));
        }
        Ok((output.output, ResourceUsage::normalize(&output.resource_usage)))
    }

    fn publish_step(&self, event_type: &str, input: &StepInput, extra: Value) {
        let mut data = json!({
            "runId": input.run_id,
            "stepId": input.step_id,
            "strategy": input.strategy,
        });
        if let (Some(data), Value::Object(extra)) = (data.as_object_mut(), extra) {
            data.extend(extra);
        }
        self.event_bus.publish(
            EngineEvent::business(event_type, SOURCE, &input.step_id, data)
                .with_correlation(input.run_id.as_str()),
        );
    }

    async fn wait_idle(&self) {
        while self.active.load(Ordering::SeqCst) > 0 {
            self.idle.notified().await;
        }
    }
}

impl TierCommunication for UnifiedExecutor {
    fn handle_tier_request(&self, request: TierRequest) -> BoxFuture<'_, TierResponse> {
        Box::pin(async move {
            match request {
                TierRequest::ExecuteStep(input) => {
                    let result = self.execute_step(input).await;
                    match serde_json::to_value(&result) {
                        Ok(data) => TierResponse {
                            success: result.success,
                            data: Some(data),
                            error: result.error,
                        },
                        Err(e) => TierResponse::error(e.to_string()),
                    }
                }
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

impl TierLifecycle for UnifiedExecutor {
    fn tier(&self) -> Tier {
        Tier::Tier3
    }

    fn metrics(&self) -> TierMetrics {
        TierMetrics {
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting steps and wait for in-flight ones up to the drain timeout.
    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.accepting.store(false, Ordering::SeqCst);
            let in_flight = self.active.load(Ordering::SeqCst);
            if in_flight > 0 {
                info!(in_flight, "Waiting for in-flight steps");
            }
            match tokio::time::timeout(self.drain_timeout, self.wait_idle()).await {
                Ok(()) => Ok(()),
                Err(_) => Err(StrataError::ShutdownTimeout {
                    tier: Tier::Tier3.to_string(),
                    active: self.active.load(Ordering::SeqCst),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::RunId;
    use strata_test_utils::ScriptedStrategy;

    fn executor(factory: StrategyFactory) -> (UnifiedExecutor, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let tools = Arc::new(RwLock::new(ToolRegistry::with_builtins()));
        (
            UnifiedExecutor::new(Arc::new(factory), tools, bus.clone()),
            bus,
        )
    }

    fn step(strategy: &str, input: Value) -> StepInput {
        StepInput::new(RunId::from("run-1"), "step-1", strategy, input)
    }

    #[tokio::test]
    async fn normalizes_usage_and_publishes_lifecycle() {
        let mut factory = StrategyFactory::new();
        factory.register(ScriptedStrategy::echo("echo"));
        let (exec, bus) = executor(factory);
        let mut sub = bus.subscribe("step.*");

        let result = exec.execute_step(step("echo", json!({"x": 1}))).await;
        assert!(result.success);
        assert_eq!(result.output, json!({"x": 1}));
        assert_eq!(result.resource_usage, ResourceUsage::new(10, 2, 5));

        let types: Vec<String> = sub.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["step.started", "step.completed"]);
        assert_eq!(exec.metrics().completed, 1);
        assert_eq!(exec.active_executions(), 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_result() {
        let (exec, bus) = executor(StrategyFactory::with_defaults(None));
        let mut sub = bus.subscribe("step.failed");

        let result = exec
            .execute_step(step("deterministic", json!({})).with_tool("nonexistent"))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Tool 'nonexistent' not found"));
        assert!(sub.try_recv().is_some());
        assert_eq!(exec.metrics().failed, 1);
    }

    #[tokio::test]
    async fn unknown_strategy_and_errors_are_captured() {
        let mut factory = StrategyFactory::new();
        factory.register(ScriptedStrategy::failing("boom", "kaput"));
        let (exec, _bus) = executor(factory);

        let missing = exec.execute_step(step("nope", json!({}))).await;
        assert_eq!(missing.error.as_deref(), Some("Strategy 'nope' not found"));

        let failed = exec.execute_step(step("boom", json!({}))).await;
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("kaput"));
    }

    #[tokio::test]
    async fn tool_runs_through_deterministic_strategy() {
        let (exec, _bus) = executor(StrategyFactory::with_defaults(None));
        let result = exec
            .execute_step(
                step("deterministic", json!({"op": "max", "values": [3, 9, 4]})).with_tool("math"),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.output["result"], json!(9.0));
    }

    #[tokio::test]
    async fn tier_request_envelope() {
        let mut factory = StrategyFactory::new();
        factory.register(ScriptedStrategy::echo("echo"));
        let (exec, bus) = executor(factory);

        let response = exec
            .handle_tier_request(TierRequest::ExecuteStep(step("echo", json!("hi"))))
            .await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["output"], json!("hi"));

        let metrics = exec.handle_tier_request(TierRequest::GetMetrics).await;
        assert_eq!(metrics.data.unwrap()["completed"], json!(1));

        let mut sub = bus.subscribe("custom.event");
        exec.emit_tier_event(EngineEvent::business("custom.event", "elsewhere", "x", json!({})));
        assert_eq!(sub.try_recv().unwrap().source, SOURCE);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_times_out_with_work_in_flight() {
        let mut factory = StrategyFactory::new();
        factory.register(
            ScriptedStrategy::echo("slow").with_delay(Duration::from_secs(3600)),
        );
        let (exec, _bus) = executor(factory);
        let exec = Arc::new(exec.with_drain_timeout(Duration::from_millis(100)));

        let running = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.execute_step(step("slow", json!({}))).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(exec.active_executions(), 1);

        let err = exec.shutdown().await.unwrap_err();
        assert!(matches!(err, StrataError::ShutdownTimeout { active: 1, .. }));

        let refused = exec.execute_step(step("slow", json!({}))).await;
        assert_eq!(refused.error.as_deref(), Some("executor is shutting down"));
        running.abort();
    }

    #[tokio::test]
    async fn shutdown_when_idle() {
        let (exec, _bus) = executor(StrategyFactory::with_defaults(None));
        exec.shutdown().await.unwrap();
    }
}
