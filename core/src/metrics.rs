//! Metrics sinks for guarded calls
//!
//! This module provides different sink implementations:
//! - `MemoryMetrics`: Thread-safe in-memory counters with a bounded event log
//! - `NullMetrics`: No-op sink for callers that export metrics elsewhere

use crate::{Event, EventKind};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Abstract sink the execution paths report into
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// A call produced a value
    fn record_success(&self, circuit_name: &str, latency: Duration);

    /// An attempt failed; `error_type` is the label of its classification
    fn record_failure(&self, circuit_name: &str, error_type: &str, latency: Duration);

    /// A retry was scheduled after `delay`
    fn record_retry(&self, circuit_name: &str, attempt: u32, delay: Duration);

    /// The circuit short-circuited a call
    fn record_rejection(&self, circuit_name: &str);

    /// Aggregated counters for a circuit
    fn snapshot(&self, circuit_name: &str) -> MetricsSnapshot;

    /// Get event log for a circuit (limited to last N events)
    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<Event>;

    /// Clear everything recorded for a circuit
    fn clear(&self, circuit_name: &str);
}

/// Aggregated call statistics of one circuit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub successes: u64,
    /// Failed attempts, including ones that were retried
    pub failures: u64,
    pub retries: u64,
    pub rejections: u64,
    /// Time spent inside the operation across all attempts
    pub total_latency: Duration,
    /// Failed attempts per classification label
    pub error_counts: HashMap<String, u64>,
}

impl MetricsSnapshot {
    /// Mean latency of completed attempts
    pub fn average_latency(&self) -> Option<Duration> {
        let attempts = self.successes + self.failures;
        if attempts == 0 {
            return None;
        }
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        Some(self.total_latency / attempts)
    }
}

#[derive(Debug, Default)]
struct CircuitMetrics {
    totals: MetricsSnapshot,
    events: Vec<Event>,
}

/// Thread-safe in-memory metrics
#[derive(Debug)]
pub struct MemoryMetrics {
    circuits: RwLock<HashMap<String, CircuitMetrics>>,
    /// Maximum events to keep per circuit
    max_events: usize,
    /// Monotonic time anchor for event timestamps
    start_time: Instant,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::with_max_events(1000)
    }

    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            max_events,
            start_time: Instant::now(),
        }
    }

    fn update(
        &self,
        circuit_name: &str,
        kind: EventKind,
        duration: Duration,
        apply: impl FnOnce(&mut MetricsSnapshot),
    ) {
        let mut circuits = self
            .circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let metrics = circuits.entry(circuit_name.to_string()).or_default();

        apply(&mut metrics.totals);
        metrics.events.push(Event {
            kind,
            timestamp: self.start_time.elapsed().as_secs_f64(),
            duration: duration.as_secs_f64(),
        });

        // Drop the oldest 10% at once so trimming is not paid on every event
        if metrics.events.len() > self.max_events {
            let remove_count = (self.max_events / 10).max(1);
            metrics.events.drain(0..remove_count.min(metrics.events.len()));
        }
    }
}

impl Default for MemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MemoryMetrics {
    fn record_success(&self, circuit_name: &str, latency: Duration) {
        self.update(circuit_name, EventKind::Success, latency, |totals| {
            totals.successes += 1;
            totals.total_latency += latency;
        });
    }

    fn record_failure(&self, circuit_name: &str, error_type: &str, latency: Duration) {
        self.update(circuit_name, EventKind::Failure, latency, |totals| {
            totals.failures += 1;
            totals.total_latency += latency;
            *totals
                .error_counts
                .entry(error_type.to_string())
                .or_insert(0) += 1;
        });
    }

    fn record_retry(&self, circuit_name: &str, _attempt: u32, delay: Duration) {
        self.update(circuit_name, EventKind::Retry, delay, |totals| {
            totals.retries += 1;
        });
    }

    fn record_rejection(&self, circuit_name: &str) {
        self.update(circuit_name, EventKind::Rejected, Duration::ZERO, |totals| {
            totals.rejections += 1;
        });
    }

    fn snapshot(&self, circuit_name: &str) -> MetricsSnapshot {
        let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
        circuits
            .get(circuit_name)
            .map(|metrics| metrics.totals.clone())
            .unwrap_or_default()
    }

    fn event_log(&self, circuit_name: &str, limit: usize) -> Vec<Event> {
        let circuits = self.circuits.read().unwrap_or_else(PoisonError::into_inner);
        circuits
            .get(circuit_name)
            .map(|metrics| {
                let start = metrics.events.len().saturating_sub(limit);
                metrics.events[start..].to_vec()
            })
            .unwrap_or_default()
    }

    fn clear(&self, circuit_name: &str) {
        let mut circuits = self
            .circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        circuits.remove(circuit_name);
    }
}

/// No-op sink
///
/// Discards everything and reports empty snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record_success(&self, _circuit_name: &str, _latency: Duration) {}

    fn record_failure(&self, _circuit_name: &str, _error_type: &str, _latency: Duration) {}

    fn record_retry(&self, _circuit_name: &str, _attempt: u32, _delay: Duration) {}

    fn record_rejection(&self, _circuit_name: &str) {}

    fn snapshot(&self, _circuit_name: &str) -> MetricsSnapshot {
        MetricsSnapshot::default()
    }

    fn event_log(&self, _circuit_name: &str, _limit: usize) -> Vec<Event> {
        Vec::new()
    }

    fn clear(&self, _circuit_name: &str) {}
}
