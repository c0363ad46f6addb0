//! Correlation ids, traced operations, and the in-process metrics registry.
//!
//! Every unit of work carries a [`CorrelationId`] attached as a field on all
//! tracing records it emits. [`TracedOperation`] brackets an operation with
//! `started`/`finished` events (and `exception` on error) so a collector can
//! reconstruct latency and failure classification. Metrics are lock-free
//! atomic counters mirrored to structured records with a `metric` field;
//! collectors are whatever tracing subscriber the operator installs.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tracing::{error, info};

/// Correlation id propagated through every log record of a delegation chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh correlation id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Adopt an id supplied by the caller (for propagation across boundaries).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Emits `started`/`finished`/`exception` records around one traced operation.
///
/// Construct at operation entry; call [`TracedOperation::finish`] on success
/// or [`TracedOperation::fail`] with the error classification. Dropping the
/// guard without either is reported as an abandoned operation.
pub struct TracedOperation {
    name: &'static str,
    correlation_id: CorrelationId,
    started_at: Instant,
    completed: bool,
}

impl TracedOperation {
    /// Start a traced operation, emitting the `started` event.
    pub fn start(name: &'static str, correlation_id: CorrelationId) -> Self {
        info!(
            operation = name,
            correlation_id = %correlation_id,
            event = "started",
            "operation started"
        );
        Self {
            name,
            correlation_id,
            started_at: Instant::now(),
            completed: false,
        }
    }

    /// The correlation id this operation runs under.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Emit the `finished` event with duration.
    pub fn finish(mut self) {
        self.completed = true;
        info!(
            operation = self.name,
            correlation_id = %self.correlation_id,
            event = "finished",
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            "operation finished"
        );
    }

    /// Emit the `exception` event with the error classification and duration.
    pub fn fail(mut self, code: &str, message: &str) {
        self.completed = true;
        error!(
            operation = self.name,
            correlation_id = %self.correlation_id,
            event = "exception",
            error_code = code,
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            "operation failed: {message}"
        );
    }
}

impl Drop for TracedOperation {
    fn drop(&mut self) {
        if !self.completed {
            error!(
                operation = self.name,
                correlation_id = %self.correlation_id,
                event = "exception",
                error_code = "Abandoned",
                "operation dropped without completion"
            );
        }
    }
}

/// Emit a counter metric as a structured record.
pub fn record_metric(name: &'static str, value: u64, correlation_id: Option<&CorrelationId>) {
    match correlation_id {
        Some(id) => info!(metric = name, value, correlation_id = %id, "metric"),
        None => info!(metric = name, value, "metric"),
    }
}

/// Lock-free counters shared across the orchestrator.
///
/// Atomic operations keep the hot path (task submission) free of locks; the
/// snapshot methods feed `getWorkerStats` and `getHealth`.
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Tasks accepted by the dispatcher since startup.
    pub tasks_submitted: AtomicU64,
    /// Tasks that reached COMPLETED.
    pub tasks_completed: AtomicU64,
    /// Tasks that reached FAILED.
    pub tasks_failed: AtomicU64,
    /// Tasks that reached CANCELLED.
    pub tasks_cancelled: AtomicU64,
    /// Child processes spawned by the supervisor.
    pub processes_spawned: AtomicU64,
    /// Admissions rejected by the rate limiter.
    pub rate_limited: AtomicU64,
    /// Calls rejected by an open circuit.
    pub circuit_rejections: AtomicU64,
    /// Entries currently parked in the dead-letter queue.
    pub dlq_depth: AtomicUsize,
    /// Workers currently executing a task.
    pub active_workers: AtomicUsize,
    /// Timestamp when the registry (and effectively the server) started.
    start_time: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            processes_spawned: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            dlq_depth: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }
}

impl MetricsRegistry {
    /// Create a fresh registry; the uptime clock starts now.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds since the registry was constructed.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Total tasks that reached any terminal state.
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed.load(Ordering::Relaxed)
            + self.tasks_failed.load(Ordering::Relaxed)
            + self.tasks_cancelled.load(Ordering::Relaxed)
    }

    /// Point-in-time snapshot for health and stats responses.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            processes_spawned: self.processes_spawned.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            dlq_depth: self.dlq_depth.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

/// Serializable snapshot of [`MetricsRegistry`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub processes_spawned: u64,
    pub rate_limited: u64,
    pub circuit_rejections: u64,
    pub dlq_depth: usize,
    pub active_workers: usize,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_correlation_id_roundtrip() {
        let id = CorrelationId::from_string("req-42");
        assert_eq!(id.as_str(), "req-42");
        assert_eq!(format!("{}", id), "req-42");
    }

    #[test]
    fn test_traced_operation_finish() {
        let op = TracedOperation::start("delegate_task", CorrelationId::new());
        op.finish();
    }

    #[test]
    fn test_traced_operation_fail() {
        let op = TracedOperation::start("delegate_task", CorrelationId::new());
        op.fail("SpawnFailed", "executable missing");
    }

    #[test]
    fn test_metrics_snapshot_counts() {
        let metrics = MetricsRegistry::new();
        metrics.tasks_submitted.fetch_add(3, Ordering::Relaxed);
        metrics.tasks_completed.fetch_add(2, Ordering::Relaxed);
        metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.tasks_submitted, 3);
        assert_eq!(snap.tasks_completed, 2);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(metrics.total_processed(), 3);
    }

    #[test]
    fn test_metrics_snapshot_serializes() {
        let metrics = MetricsRegistry::new();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert!(json.get("tasks_submitted").is_some());
        assert!(json.get("uptime_seconds").is_some());
    }
}
