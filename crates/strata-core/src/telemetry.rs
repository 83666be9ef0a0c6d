use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackpressurePolicy, TelemetryConfig};
use crate::error::Result;
use crate::event::{EngineEvent, EventBus, EventCategory};

/// Where flushed telemetry batches go.
pub trait TelemetrySink: Send + Sync + 'static {
    fn deliver(&self, events: Vec<EngineEvent>) -> Result<()>;
}

impl TelemetrySink for EventBus {
    fn deliver(&self, events: Vec<EngineEvent>) -> Result<()> {
        self.try_publish_batch(events)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub accepted: u64,
    pub sampled_out: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub flush_failures: u64,
    pub buffered: usize,
    pub slow_calls: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    sampled_out: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    flush_failures: AtomicU64,
    slow_calls: AtomicU64,
}

/// Sampled, buffered front for event emission.
///
/// Events are sampled per category, queued in a bounded buffer and delivered
/// to the sink in batches. `Always`-priority events skip sampling but still
/// obey the buffer bound.
pub struct TelemetryShim {
    sink: Arc<dyn TelemetrySink>,
    config: TelemetryConfig,
    buffer: Mutex<VecDeque<EngineEvent>>,
    counters: Counters,
}

impl TelemetryShim {
    pub fn new(sink: Arc<dyn TelemetrySink>, config: TelemetryConfig) -> Self {
        let capacity = config.max_buffer_size;
        Self {
            sink,
            config,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EngineEvent>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rate_for(&self, category: EventCategory) -> f64 {
        let s = &self.config.sampling;
        match category {
            EventCategory::Performance => s.performance,
            EventCategory::Health => s.health,
            EventCategory::Business => s.business,
            EventCategory::Safety => s.safety,
        }
    }

    /// Offer an event. Returns whether it was accepted into the buffer.
    pub fn emit(&self, mut event: EngineEvent) -> bool {
        let started = Instant::now();
        let accepted = self.admit(&mut event) && self.enqueue(event);
        self.check_overhead(started);
        accepted
    }

    fn admit(&self, event: &mut EngineEvent) -> bool {
        if !self.config.enabled {
            self.counters.sampled_out.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if event.is_always() {
            event.sampling.rate = 1.0;
            return true;
        }
        let rate = self.rate_for(event.category);
        event.sampling.rate = rate;
        if rate < 1.0 && rand::random::<f64>() >= rate {
            self.counters.sampled_out.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn enqueue(&self, event: EngineEvent) -> bool {
        let ready = {
            let mut buffer = self.lock();
            if buffer.len() >= self.config.max_buffer_size {
                if self.config.drop_on_overload {
                    match self.config.backpressure {
                        BackpressurePolicy::DropNewest => {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            return false;
                        }
                        BackpressurePolicy::DropOldest => {
                            buffer.pop_front();
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else {
                    let batch: Vec<_> = buffer.drain(..).collect();
                    drop(buffer);
                    self.deliver(batch, 1);
                    buffer = self.lock();
                }
            }
            buffer.push_back(event);
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            buffer.len() >= self.config.batch_size
        };

        if ready {
            self.flush();
        }
        true
    }

    fn check_overhead(&self, started: Instant) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > self.config.overhead_threshold_ms {
            self.counters.slow_calls.fetch_add(1, Ordering::Relaxed);
            warn!(
                elapsed_ms,
                threshold_ms = self.config.overhead_threshold_ms,
                "Telemetry overhead above threshold"
            );
        }
    }

    /// Deliver everything buffered. Returns the number of events delivered.
    pub fn flush(&self) -> usize {
        let batch: Vec<_> = self.lock().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }
        self.deliver(batch, 0)
    }

    /// Send a batch to the sink. `reserve` slots are kept free when re-buffering.
    fn deliver(&self, batch: Vec<EngineEvent>, reserve: usize) -> usize {
        let n = batch.len();
        match self.sink.deliver(batch.clone()) {
            Ok(()) => {
                self.counters.flushed.fetch_add(n as u64, Ordering::Relaxed);
                debug!(events = n, "Telemetry flushed");
                n
            }
            Err(e) => {
                self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                let mut buffer = self.lock();
                if buffer.len() + n + reserve <= self.config.max_buffer_size {
                    for event in batch.into_iter().rev() {
                        buffer.push_front(event);
                    }
                    warn!(error = %e, events = n, "Telemetry flush failed, re-buffered");
                } else {
                    self.counters.dropped.fetch_add(n as u64, Ordering::Relaxed);
                    warn!(error = %e, events = n, "Telemetry flush failed, batch dropped");
                }
                0
            }
        }
    }

    /// Run the periodic flush until cancelled, then flush once more.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        self.flush();
                    }
                    _ = cancel.cancelled() => {
                        info!("Telemetry flusher shutting down");
                        break;
                    }
                }
            }
            self.flush();
        })
    }

    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            sampled_out: self.counters.sampled_out.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
            buffered: self.lock().len(),
            slow_calls: self.counters.slow_calls.load(Ordering::Relaxed),
        }
    }
}
