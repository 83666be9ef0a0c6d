use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StrataError};

pub const EVENT_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Performance,
    Health,
    Business,
    Safety,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Health => "health",
            Self::Business => "business",
            Self::Safety => "safety",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Category-tagged payload. The variant always agrees with the envelope's category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventPayload {
    Performance {
        metric: String,
        value: f64,
        unit: String,
    },
    Health {
        component: String,
        status: HealthStatus,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Business {
        entity_id: String,
        #[serde(default)]
        data: Value,
    },
    Safety {
        severity: Severity,
        reason: String,
        #[serde(default)]
        data: Value,
    },
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Performance { .. } => EventCategory::Performance,
            Self::Health { .. } => EventCategory::Health,
            Self::Business { .. } => EventCategory::Business,
            Self::Safety { .. } => EventCategory::Safety,
        }
    }

    /// Free-form data carried by business and safety payloads.
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Business { data, .. } | Self::Safety { data, .. } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: EventPriority,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            version: EVENT_SCHEMA_VERSION.to_string(),
            tags: Vec::new(),
            priority: EventPriority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingPriority {
    #[default]
    Sampled,
    /// Bypasses telemetry sampling unconditionally.
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingInfo {
    pub rate: f64,
    #[serde(default)]
    pub priority: SamplingPriority,
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl Default for SamplingInfo {
    fn default() -> Self {
        Self {
            rate: 1.0,
            priority: SamplingPriority::Sampled,
            conditions: Vec::new(),
        }
    }
}

/// Event envelope delivered to subscribers and external consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub category: EventCategory,
    pub payload: EventPayload,
    #[serde(default)]
    pub metadata: EventMetadata,
    #[serde(default)]
    pub sampling: SamplingInfo,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            correlation_id: None,
            category: payload.category(),
            payload,
            metadata: EventMetadata::default(),
            sampling: SamplingInfo::default(),
        }
    }

    pub fn business(
        event_type: impl Into<String>,
        source: impl Into<String>,
        entity_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self::new(
            event_type,
            source,
            EventPayload::Business {
                entity_id: entity_id.into(),
                data,
            },
        )
    }

    pub fn performance(
        event_type: impl Into<String>,
        source: impl Into<String>,
        metric: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self::new(
            event_type,
            source,
            EventPayload::Performance {
                metric: metric.into(),
                value,
                unit: unit.into(),
            },
        )
    }

    pub fn health(
        event_type: impl Into<String>,
        source: impl Into<String>,
        component: impl Into<String>,
        status: HealthStatus,
        message: Option<String>,
    ) -> Self {
        Self::new(
            event_type,
            source,
            EventPayload::Health {
                component: component.into(),
                status,
                message,
            },
        )
    }

    /// Safety events always bypass sampling.
    pub fn safety(
        event_type: impl Into<String>,
        source: impl Into<String>,
        severity: Severity,
        reason: impl Into<String>,
        data: Value,
    ) -> Self {
        Self::new(
            event_type,
            source,
            EventPayload::Safety {
                severity,
                reason: reason.into(),
                data,
            },
        )
        .always()
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Mark the event as exempt from sampling.
    pub fn always(mut self) -> Self {
        self.sampling.priority = SamplingPriority::Always;
        self
    }

    pub fn is_always(&self) -> bool {
        self.sampling.priority == SamplingPriority::Always
    }

    /// Shape check applied at the bus boundary.
    pub fn validate(&self) -> Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(StrataError::Validation("event type is empty".into()));
        }
        if self.source.trim().is_empty() {
            return Err(StrataError::Validation(format!(
                "event '{}' has no source",
                self.event_type
            )));
        }
        if self.category != self.payload.category() {
            return Err(StrataError::Validation(format!(
                "event '{}' category {} does not match payload",
                self.event_type,
                self.category.as_str()
            )));
        }
        if !(0.0..=1.0).contains(&self.sampling.rate) {
            return Err(StrataError::Validation(format!(
                "event '{}' sampling rate {} outside [0,1]",
                self.event_type, self.sampling.rate
            )));
        }
        match &self.payload {
            EventPayload::Performance { value, .. } if !value.is_finite() => {
                Err(StrataError::Validation(format!(
                    "event '{}' has non-finite metric value",
                    self.event_type
                )))
            }
            EventPayload::Health { component, .. } if component.trim().is_empty() => Err(
                StrataError::Validation(format!("event '{}' has no component", self.event_type)),
            ),
            _ => Ok(()),
        }
    }
}

/// Whether `event_type` matches a subscription pattern.
///
/// Patterns are an exact type, `prefix.*`, or `*`.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => pattern == event_type,
    }
}

/// Handle returned by [`EventBus::subscribe`]. Events arrive in publish order.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything already delivered.
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStats {
    pub published: u64,
    pub rejected: u64,
    pub subscribers: usize,
}

struct Subscriber {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

struct BusState {
    subscribers: Vec<Subscriber>,
    recent: VecDeque<EngineEvent>,
    next_id: u64,
    closed: bool,
    published: u64,
    rejected: u64,
}

/// In-process pub/sub with pattern subscriptions and a recent-events ring buffer.
pub struct EventBus {
    state: Mutex<BusState>,
    recent_capacity: usize,
}

impl EventBus {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                recent: VecDeque::with_capacity(recent_capacity),
                next_id: 1,
                closed: false,
                published: 0,
                rejected: 0,
            }),
            recent_capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire-and-forget publish. Failures are logged, never returned.
    pub fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.try_publish_batch(vec![event]) {
            warn!(error = %e, "Dropped event");
        }
    }

    pub fn publish_batch(&self, events: Vec<EngineEvent>) {
        if let Err(e) = self.try_publish_batch(events) {
            warn!(error = %e, "Dropped event batch");
        }
    }

    /// Publish a batch, reporting a closed bus to the caller.
    ///
    /// Invalid events are counted and skipped; they do not fail the batch.
    pub fn try_publish_batch(&self, events: Vec<EngineEvent>) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(StrataError::EventBusClosed);
        }

        for event in events {
            if let Err(e) = event.validate() {
                state.rejected += 1;
                warn!(event_type = %event.event_type, error = %e, "Rejected invalid event");
                continue;
            }

            let before = state.subscribers.len();
            state.subscribers.retain(|sub| {
                if !pattern_matches(&sub.pattern, &event.event_type) {
                    return !sub.tx.is_closed();
                }
                sub.tx.send(event.clone()).is_ok()
            });
            let pruned = before - state.subscribers.len();
            if pruned > 0 {
                debug!(pruned, "Pruned closed subscribers");
            }

            if self.recent_capacity > 0 {
                if state.recent.len() == self.recent_capacity {
                    state.recent.pop_front();
                }
                state.recent.push_back(event);
            }
            state.published += 1;
        }
        Ok(())
    }

    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            pattern: pattern.into(),
            tx,
        });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    /// Last `n` events, oldest first.
    pub fn get_recent_events(&self, n: usize) -> Vec<EngineEvent> {
        let state = self.lock();
        let skip = state.recent.len().saturating_sub(n);
        state.recent.iter().skip(skip).cloned().collect()
    }

    /// Stop accepting events and disconnect all subscribers.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> EventBusStats {
        let state = self.lock();
        EventBusStats {
            published: state.published,
            rejected: state.rejected,
            subscribers: state.subscribers.len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_event(kind: &str, n: u64) -> EngineEvent {
        EngineEvent::business(kind, "tier3.executor", format!("step-{}", n), json!({"n": n}))
    }

    #[test]
    fn patterns() {
        assert!(pattern_matches("*", "run.started"));
        assert!(pattern_matches("step.*", "step.completed"));
        assert!(!pattern_matches("step.*", "steps.completed"));
        assert!(!pattern_matches("step.*", "run.started"));
        assert!(pattern_matches("run.started", "run.started"));
        assert!(!pattern_matches("run.started", "run.state_changed"));
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe("step.*");
        let mut other = bus.subscribe("run.*");

        for n in 0..5 {
            bus.publish(step_event("step.completed", n));
        }
        bus.publish(step_event("run.started", 99));

        let got: Vec<_> = sub
            .drain()
            .into_iter()
            .map(|e| e.payload.data().cloned().unwrap()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(other.drain().len(), 1);
    }

    #[test]
    fn recent_buffer_is_bounded() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.publish(step_event("step.completed", n));
        }
        let recent = bus.get_recent_events(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].payload.data().unwrap()["n"], 2);
        assert_eq!(bus.get_recent_events(1)[0].payload.data().unwrap()["n"], 4);
    }

    #[test]
    fn invalid_events_are_rejected() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe("*");

        bus.publish(EngineEvent::performance("perf", "tier3.executor", "latency", f64::NAN, "ms"));
        bus.publish(step_event("", 1));
        let mut bad_rate = step_event("step.started", 2);
        bad_rate.sampling.rate = 1.5;
        bus.publish(bad_rate);

        assert!(sub.drain().is_empty());
        assert_eq!(bus.stats().rejected, 3);
        assert_eq!(bus.stats().published, 0);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe("step.*");
        assert_eq!(bus.stats().subscribers, 1);
        drop(sub);
        bus.publish(step_event("step.completed", 1));
        assert_eq!(bus.stats().subscribers, 0);
    }

    #[test]
    fn closed_bus_reports_error() {
        let bus = EventBus::new(8);
        bus.close();
        assert!(matches!(
            bus.try_publish_batch(vec![step_event("step.completed", 1)]),
            Err(StrataError::EventBusClosed)
        ));
        // fire-and-forget path does not panic
        bus.publish(step_event("step.completed", 2));
    }

    #[test]
    fn envelope_uses_camel_case() {
        let event = step_event("step.completed", 1).with_correlation("run-1");
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "step.completed");
        assert_eq!(v["correlationId"], "run-1");
        assert_eq!(v["category"], "business");
        assert_eq!(v["payload"]["entityId"], "step-1");
        assert_eq!(v["metadata"]["version"], EVENT_SCHEMA_VERSION);
        assert_eq!(v["sampling"]["priority"], "sampled");
    }
}
