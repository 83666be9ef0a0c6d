use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use strata_core::error::{Result, StrataError};
use strata_core::traits::{ExecutionStrategy, ModelClient};
use strata_core::types::{ModelRequest, ModelResponse, StrategyInput, StrategyKind, StrategyOutput};

type Behaviour = Box<dyn Fn(&StrategyInput) -> Result<StrategyOutput> + Send + Sync>;

/// Strategy whose outcome is decided by a closure. Records every input.
pub struct ScriptedStrategy {
    name: String,
    kind: StrategyKind,
    behaviour: Behaviour,
    delay: Option<Duration>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<Value>>,
}

impl ScriptedStrategy {
    pub fn new(
        name: &str,
        kind: StrategyKind,
        behaviour: impl Fn(&StrategyInput) -> Result<StrategyOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            behaviour: Box::new(behaviour),
            delay: None,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Returns its input as output and reports usage in camelCase field names.
    pub fn echo(name: &str) -> Self {
        Self::new(name, StrategyKind::Deterministic, |input| {
            Ok(StrategyOutput::ok(
                input.input.clone(),
                json!({"tokensUsed": 10, "creditsUsed": 2, "durationMs": 5}),
            ))
        })
    }

    /// Always returns an error.
    pub fn failing(name: &str, message: &str) -> Self {
        let message = message.to_string();
        Self::new(name, StrategyKind::Reasoning, move |_| {
            Err(StrataError::StepExecution {
                step: "scripted".into(),
                message: message.clone(),
            })
        })
    }

    /// Fails the first `failures` calls, then echoes.
    pub fn flaky(name: &str, failures: usize) -> Self {
        let seen = AtomicUsize::new(0);
        Self::new(name, StrategyKind::Deterministic, move |input| {
            if seen.fetch_add(1, Ordering::SeqCst) < failures {
                Ok(StrategyOutput::failed("transient failure"))
            } else {
                Ok(StrategyOutput::ok(input.input.clone(), json!({"credits": 1})))
            }
        })
    }

    /// Sleep before answering. Use a long delay to keep a step in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }
}

impl ExecutionStrategy for ScriptedStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn execute(&self, input: StrategyInput) -> BoxFuture<'_, Result<StrategyOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.input.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.behaviour)(&input)
        })
    }
}

/// Model client replaying canned replies. Falls back to a default reply.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    default_reply: String,
    prompts: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(default_reply: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_reply: default_reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(self, reply: &str) -> Self {
        self.replies.lock().unwrap().push_back(reply.to_string());
        self
    }

    pub fn prompts(&self) -> Vec<ModelRequest> {
        self.prompts.lock().unwrap().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, request: ModelRequest) -> BoxFuture<'_, Result<ModelResponse>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(request);
            let text = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.default_reply.clone());
            Ok(ModelResponse {
                text,
                usage: json!({"input_tokens": 12, "output_tokens": 8, "cost": 3}),
            })
        })
    }
}
