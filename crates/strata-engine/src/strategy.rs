use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use strata_core::error::Result;
use strata_core::traits::{ExecutionStrategy, ModelClient};
use strata_core::types::{
    ModelRequest, StrategyInput, StrategyKind, StrategyOutput, ToolContext,
};
use strata_tools::registry::run_with_timeout;

/// Strategies keyed by name. Tier3 resolves every step's strategy here.
#[derive(Clone, Default)]
pub struct StrategyFactory {
    strategies: HashMap<String, Arc<dyn ExecutionStrategy>>,
}

impl StrategyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The three built-in strategies. Without a model client the
    /// conversational and reasoning strategies fail every step.
    pub fn with_defaults(model: Option<Arc<dyn ModelClient>>) -> Self {
        let mut factory = Self::new();
        factory.register(ConversationalStrategy::new(model.clone()));
        factory.register(ReasoningStrategy::new(model));
        factory.register(DeterministicStrategy);
        factory
    }

    pub fn register(&mut self, strategy: impl ExecutionStrategy) {
        self.register_arc(Arc::new(strategy));
    }

    pub fn register_arc(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        let name = strategy.name().to_string();
        debug!(strategy = %name, kind = strategy.kind().as_str(), "Registered strategy");
        self.strategies.insert(name, strategy);
    }

    pub fn get_strategy(&self, name: &str) -> Option<Arc<dyn ExecutionStrategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Prompt text for a step input: `prompt`, then `message`, then the whole input.
fn prompt_text(input: &Value) -> String {
    ["prompt", "message"]
        .iter()
        .find_map(|k| input.get(*k).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| match input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

fn system_text(input: &Value) -> Option<String> {
    input.get("system").and_then(|v| v.as_str()).map(str::to_string)
}

// ── Conversational ──────────────────────────────────────────────

/// One model turn. Output: `{"response": text}`.
pub struct ConversationalStrategy {
    model: Option<Arc<dyn ModelClient>>,
}

impl ConversationalStrategy {
    pub fn new(model: Option<Arc<dyn ModelClient>>) -> Self {
        Self { model }
    }
}

impl ExecutionStrategy for ConversationalStrategy {
    fn name(&self) -> &str {
        "conversational"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Conversational
    }

    fn execute(&self, input: StrategyInput) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let Some(model) = &self.model else {
                return Ok(StrategyOutput::failed(
                    "no model client configured for conversational strategy",
                ));
            };
            let response = model
                .complete(ModelRequest {
                    system: system_text(&input.input),
                    prompt: prompt_text(&input.input),
                })
                .await?;
            Ok(StrategyOutput::ok(
                json!({ "response": response.text }),
                response.usage,
            ))
        })
    }
}

// ── Reasoning ───────────────────────────────────────────────────

const REASONING_SYSTEM: &str = "Think through the task step by step. \
End with a single line of the form 'Final answer: <answer>'.";

/// Step-by-step model turn. Output: `{"answer", "reasoning"}`.
pub struct ReasoningStrategy {
    model: Option<Arc<dyn ModelClient>>,
}

impl ReasoningStrategy {
    pub fn new(model: Option<Arc<dyn ModelClient>>) -> Self {
        Self { model }
    }
}

/// Text after the last `Final answer:` line, or the last non-empty line.
fn final_answer(text: &str) -> String {
    const MARKER: &str = "final answer:";
    text.lines()
        .rev()
        .find_map(|line| {
            let trimmed = line.trim();
            trimmed
                .to_lowercase()
                .starts_with(MARKER)
                .then(|| trimmed[MARKER.len()..].trim().to_string())
        })
        .or_else(|| {
            text.lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

impl ExecutionStrategy for ReasoningStrategy {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Reasoning
    }

    fn execute(&self, input: StrategyInput) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let Some(model) = &self.model else {
                return Ok(StrategyOutput::failed(
                    "no model client configured for reasoning strategy",
                ));
            };
            let system = match system_text(&input.input) {
                Some(extra) => format!("{}\n\n{}", REASONING_SYSTEM, extra),
                None => REASONING_SYSTEM.to_string(),
            };
            let response = model
                .complete(ModelRequest {
                    system: Some(system),
                    prompt: prompt_text(&input.input),
                })
                .await?;
            Ok(StrategyOutput::ok(
                json!({
                    "answer": final_answer(&response.text),
                    "reasoning": response.text,
                }),
                response.usage,
            ))
        })
    }
}

// ── Deterministic ───────────────────────────────────────────────

/// Runs the step's tool, or passes the input through when there is none.
pub struct DeterministicStrategy;

impl ExecutionStrategy for DeterministicStrategy {
    fn name(&self) -> &str {
        "deterministic"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Deterministic
    }

    fn execute(&self, input: StrategyInput) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            let Some(tool) = input.tool.clone() else {
                return Ok(StrategyOutput::ok(input.input, json!({})));
            };
            let start = Instant::now();
            let ctx = ToolContext {
                run_id: input.run_id.clone(),
                step_id: input.step_id.clone(),
            };
            let result = run_with_timeout(tool.as_ref(), input.input, ctx).await?;
            let usage = json!({ "duration_ms": start.elapsed().as_millis() as u64 });
            if result.is_error {
                let message = match result.output {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                return Ok(StrategyOutput {
                    resource_usage: usage,
                    ..StrategyOutput::failed(message)
                });
            }
            Ok(StrategyOutput::ok(result.output, usage))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::RunId;
    use strata_test_utils::ScriptedModel;
    use strata_tools::builtin::math::MathTool;

    fn input(value: Value) -> StrategyInput {
        StrategyInput {
            step_id: "s1".into(),
            run_id: RunId::from("r1"),
            input: value,
            tool: None,
        }
    }

    #[test]
    fn defaults_registered() {
        let factory = StrategyFactory::with_defaults(None);
        assert_eq!(
            factory.names(),
            vec!["conversational", "deterministic", "reasoning"]
        );
        assert!(factory.get_strategy("nonexistent").is_none());
    }

    #[test]
    fn final_answer_parsing() {
        assert_eq!(final_answer("a\nb\nFinal answer: 42\n"), "42");
        assert_eq!(final_answer("FINAL ANSWER:  yes "), "yes");
        assert_eq!(final_answer("just text\n\n"), "just text");
        assert_eq!(final_answer(""), "");
    }

    #[tokio::test]
    async fn conversational_uses_prompt_field() {
        let model = Arc::new(ScriptedModel::new("hello there"));
        let strategy = ConversationalStrategy::new(Some(model.clone()));
        let out = strategy
            .execute(input(json!({"prompt": "hi", "system": "be brief"})))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output, json!({"response": "hello there"}));
        let prompts = model.prompts();
        assert_eq!(prompts[0].prompt, "hi");
        assert_eq!(prompts[0].system.as_deref(), Some("be brief"));
    }

    #[tokio::test]
    async fn reasoning_extracts_answer() {
        let model = Arc::new(ScriptedModel::new("step one\nFinal answer: 7"));
        let out = ReasoningStrategy::new(Some(model))
            .execute(input(json!({"message": "3 + 4?"})))
            .await
            .unwrap();
        assert_eq!(out.output["answer"], json!("7"));
    }

    #[tokio::test]
    async fn model_strategies_fail_without_client() {
        let out = ReasoningStrategy::new(None)
            .execute(input(json!("x")))
            .await
            .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn deterministic_runs_tool_or_echoes() {
        let echoed = DeterministicStrategy
            .execute(input(json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(echoed.output, json!({"a": 1}));

        let mut with_tool = input(json!({"op": "sum", "values": [1, 2, 3]}));
        with_tool.tool = Some(Arc::new(MathTool));
        let out = DeterministicStrategy.execute(with_tool).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output["result"], json!(6.0));

        let mut bad = input(json!({"op": "sum", "values": ["x"]}));
        bad.tool = Some(Arc::new(MathTool));
        let failed = DeterministicStrategy.execute(bad).await.unwrap();
        assert!(!failed.success);
        assert!(failed.error.is_some());
    }
}
