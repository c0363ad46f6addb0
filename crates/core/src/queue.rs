//! Bounded FIFO task queue and the worker pool that drains it.
//!
//! Submission is enqueue-only: the producer path performs no downstream I/O
//! and returns as soon as the task id is in the channel. N workers (default
//! 3) dequeue in strict FIFO order; each worker resolves the agent, consults
//! the rate limiter and circuit breaker for that agent's scope, runs the
//! child through the supervisor, and records the terminal transition.
//! Failures park the operation in the dead-letter queue and trigger any
//! registered compensation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentCatalog, AgentKind};
use crate::circuit::CircuitBreaker;
use crate::compensation::CompensationRegistry;
use crate::dlq::DeadLetterQueue;
use crate::error::{Error, Result};
use crate::observability::{record_metric, MetricsRegistry};
use crate::rate_limit::RateLimiter;
use crate::shutdown::ShutdownFlag;
use crate::supervisor::ProcessSupervisor;
use crate::task::{CancelOutcome, Task, TaskRegistry, TaskStatus};

/// Default worker pool size.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default queue high-water mark.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Pause between admission retries when a scope is rate limited.
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// DLQ operation type used for failed task executions.
pub const TASK_EXECUTION_OP: &str = "task_execution";

/// Aggregate worker statistics for `getWorkerStats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStats {
    pub max_workers: usize,
    pub active_workers: usize,
    pub queued: usize,
    pub total_processed: u64,
}

/// The task queue plus its worker pool.
pub struct WorkerPool {
    tx: async_channel::Sender<String>,
    rx: async_channel::Receiver<String>,
    capacity: usize,
    worker_count: usize,
    registry: Arc<TaskRegistry>,
    catalog: Arc<AgentCatalog>,
    supervisor: Arc<ProcessSupervisor>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    dlq: Arc<DeadLetterQueue>,
    compensation: Arc<CompensationRegistry>,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownFlag,
    running: Mutex<HashMap<String, CancellationToken>>,
    stop: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Everything a pool needs besides its sizing.
pub struct WorkerPoolDeps {
    pub registry: Arc<TaskRegistry>,
    pub catalog: Arc<AgentCatalog>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub dlq: Arc<DeadLetterQueue>,
    pub compensation: Arc<CompensationRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub shutdown: ShutdownFlag,
}

impl WorkerPool {
    /// Create a pool. Workers do not run until [`WorkerPool::start`].
    pub fn new(worker_count: usize, capacity: usize, deps: WorkerPoolDeps) -> Arc<Self> {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Arc::new(Self {
            tx,
            rx,
            capacity: capacity.max(1),
            worker_count: worker_count.max(1),
            registry: deps.registry,
            catalog: deps.catalog,
            supervisor: deps.supervisor,
            rate_limiter: deps.rate_limiter,
            circuit_breaker: deps.circuit_breaker,
            dlq: deps.dlq,
            compensation: deps.compensation,
            metrics: deps.metrics,
            shutdown: deps.shutdown,
            running: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker loops.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.worker_count {
            let pool = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                pool.worker_loop(index).await;
            }));
        }
        info!(workers = self.worker_count, capacity = self.capacity, "worker pool started");
    }

    /// Enqueue a task.
    ///
    /// Wait-free on the producer path: the task record is stored and the id
    /// pushed into the bounded channel, nothing else. Rejected with
    /// [`Error::ShuttingDown`] during drain and [`Error::QueueFull`] at the
    /// high-water mark.
    pub fn submit(&self, task: Task) -> Result<String> {
        if self.shutdown.is_set() {
            return Err(Error::ShuttingDown);
        }
        let id = task.id.clone();
        self.registry.insert(task);
        if self.tx.try_send(id.clone()).is_err() {
            // Leave no trace of a rejected submission.
            debug!(task_id = %id, "queue full, rejecting submission");
            self.registry.remove(&id);
            return Err(Error::QueueFull(self.capacity));
        }
        self.metrics
            .tasks_submitted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(id)
    }

    /// Check that a task could be routed to some agent right now.
    ///
    /// Lets delegation fail fast with [`Error::NoAgentAvailable`] instead of
    /// queueing work that no installed agent can take. The worker re-resolves
    /// at execution time; availability may have changed by then.
    pub fn check_routable(&self, task: &Task) -> Result<()> {
        self.catalog
            .resolve(&task.task_type, task.preferred_agent.as_deref())
            .map(|_| ())
    }

    /// Cancel a task.
    ///
    /// QUEUED tasks transition to CANCELLED immediately and are discarded by
    /// workers on dequeue. For RUNNING tasks the child's cancellation token
    /// fires and the owning worker records CANCELLED once the child is
    /// confirmed terminated.
    pub fn cancel(&self, task_id: &str) -> Result<CancelOutcome> {
        let outcome = self.registry.cancel(task_id)?;
        if outcome.kill_required {
            let token = self
                .running
                .lock()
                .ok()
                .and_then(|running| running.get(task_id).cloned());
            if let Some(token) = token {
                token.cancel();
            }
        } else {
            self.metrics
                .tasks_cancelled
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Cancel every task still QUEUED (used during shutdown drain).
    pub fn cancel_queued(&self) -> usize {
        let mut cancelled = 0;
        for task in self.registry.list_active() {
            if task.status == TaskStatus::Queued && self.cancel(&task.id).is_ok() {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Current aggregate statistics.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            max_workers: self.worker_count,
            active_workers: self
                .metrics
                .active_workers
                .load(std::sync::atomic::Ordering::Relaxed),
            queued: self.registry.queued_count(),
            total_processed: self.metrics.total_processed(),
        }
    }

    /// Stop dequeueing new work and wait for in-flight tasks to settle.
    pub async fn stop_and_join(&self) {
        self.stop.cancel();
        self.tx.close();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Re-run a dead-lettered task execution once (DLQ retry handler body).
    ///
    /// Resolves the agent and command from the entry's captured context and
    /// reports success or a new failure text to the sweep.
    pub async fn retry_execution(
        &self,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<(), String> {
        let agent_name = context
            .get("agent")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "retry context missing 'agent'".to_string())?;
        let agent = AgentKind::from_name(agent_name)
            .ok_or_else(|| format!("unknown agent '{agent_name}' in retry context"))?;
        let description = context
            .get("description")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "retry context missing 'description'".to_string())?;
        let cwd = context
            .get("project_path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let task_context = context
            .get("context")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        if let Err(e) = self.circuit_breaker.try_acquire(agent.name()).await {
            return Err(e.to_string());
        }
        let spec = agent.resolve_command(description, &task_context, std::path::Path::new(cwd));
        match self.supervisor.run(&spec, CancellationToken::new()).await {
            Ok(output) => match agent.classify_exit(&output) {
                Ok(()) => {
                    self.circuit_breaker.record_success(agent.name()).await;
                    Ok(())
                }
                Err(e) => {
                    self.circuit_breaker.record_failure(agent.name()).await;
                    Err(e.to_string())
                }
            },
            Err(e) => {
                if e.is_outbound_failure() {
                    self.circuit_breaker.record_failure(agent.name()).await;
                }
                Err(e.to_string())
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, index: usize) {
        debug!(worker = index, "worker started");
        loop {
            let task_id = tokio::select! {
                _ = self.stop.cancelled() => break,
                received = self.rx.recv() => match received {
                    Ok(id) => id,
                    Err(_) => break,
                },
            };

            // Shutdown drain: everything still queued is cancelled, not run.
            if self.shutdown.is_set() {
                let _ = self.cancel(&task_id);
                continue;
            }

            self.execute_one(index, &task_id).await;
        }
        debug!(worker = index, "worker stopped");
    }

    async fn execute_one(&self, index: usize, task_id: &str) {
        let Ok(task) = self.registry.get(task_id) else {
            return;
        };
        // Tombstone left by a queued-task cancellation.
        if task.status != TaskStatus::Queued {
            return;
        }

        let agent = match self
            .catalog
            .resolve(&task.task_type, task.preferred_agent.as_deref())
        {
            Ok(agent) => agent,
            Err(e) => {
                warn!(task_id, error = %e, "no agent available");
                let _ = self.registry.mark_running(task_id, index, "unrouted");
                self.fail_task(&task, "unrouted", e).await;
                return;
            }
        };
        let scope = agent.name();

        if self.registry.mark_running(task_id, index, scope).is_err() {
            // Cancelled between dequeue and start.
            return;
        }
        self.metrics
            .active_workers
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let result = self.execute_admitted(index, &task, agent).await;
        self.metrics
            .active_workers
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        if let Err(e) = result {
            self.fail_task(&task, scope, e).await;
        }
    }

    /// Admission (rate limit + circuit) and execution for one task.
    /// Returns `Err` for the failure paths handled uniformly by the caller.
    async fn execute_admitted(&self, index: usize, task: &Task, agent: AgentKind) -> Result<()> {
        let scope = agent.name();
        let task_id = task.id.as_str();

        // Registered before admission so a cancel request during the
        // rate-limit wait reaches this task, not just a live child.
        let cancel = CancellationToken::new();
        if let Ok(mut running) = self.running.lock() {
            running.insert(task_id.to_string(), cancel.clone());
        }

        // Rate limiting waits cooperatively rather than failing the task; a
        // cancellation or shutdown during the wait aborts it.
        let admitted = loop {
            if cancel.is_cancelled() {
                break false;
            }
            if self.shutdown.is_set() {
                self.drop_running(task_id);
                return Err(Error::ShuttingDown);
            }
            if self.rate_limiter.allow(scope).await {
                break true;
            }
            self.metrics
                .rate_limited
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tokio::select! {
                _ = cancel.cancelled() => break false,
                _ = tokio::time::sleep(RATE_LIMIT_RETRY_DELAY) => {}
            }
        };
        if !admitted {
            self.drop_running(task_id);
            let _ = self.registry.mark_cancelled(task_id);
            self.metrics
                .tasks_cancelled
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(());
        }

        if let Err(e) = self.circuit_breaker.try_acquire(scope).await {
            self.metrics
                .circuit_rejections
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.drop_running(task_id);
            return Err(e);
        }

        let spec = agent.resolve_command(&task.description, &task.context, &task.project_path);
        debug!(worker = index, task_id, agent = scope, "spawning agent");
        self.metrics
            .processes_spawned
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let outcome = self.supervisor.run(&spec, cancel).await;

        self.drop_running(task_id);

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                if e.is_outbound_failure() {
                    self.circuit_breaker.record_failure(scope).await;
                }
                return Err(e);
            }
        };

        if output.cancelled {
            self.circuit_breaker.record_cancelled(scope).await;
            let _ = self.registry.mark_cancelled(task_id);
            self.metrics
                .tasks_cancelled
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(());
        }

        match agent.classify_exit(&output) {
            Ok(()) => {
                self.circuit_breaker.record_success(scope).await;
                let mut result = serde_json::Map::new();
                result.insert("stdout".into(), serde_json::json!(output.stdout));
                result.insert("stderr".into(), serde_json::json!(output.stderr));
                result.insert("exit_code".into(), serde_json::json!(output.exit_code));
                result.insert(
                    "duration_ms".into(),
                    serde_json::json!(output.duration.as_millis() as u64),
                );
                result.insert("agent".into(), serde_json::json!(scope));
                let _ = self.registry.complete(task_id, result);
                self.metrics
                    .tasks_completed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                record_metric(
                    "task_completed_total",
                    self.metrics
                        .tasks_completed
                        .load(std::sync::atomic::Ordering::Relaxed),
                    None,
                );
                Ok(())
            }
            Err(e) => {
                self.circuit_breaker.record_failure(scope).await;
                Err(e)
            }
        }
    }

    fn drop_running(&self, task_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(task_id);
        }
    }

    /// Terminal failure handling: FAILED status, DLQ entry, compensation.
    async fn fail_task(&self, task: &Task, scope: &str, error: Error) {
        let error_text = error.to_string();
        let _ = self.registry.fail(&task.id, error_text.clone());
        self.metrics
            .tasks_failed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        record_metric(
            "task_failed_total",
            self.metrics
                .tasks_failed
                .load(std::sync::atomic::Ordering::Relaxed),
            None,
        );

        let mut dlq_context = serde_json::Map::new();
        dlq_context.insert("agent".into(), serde_json::json!(scope));
        dlq_context.insert("description".into(), serde_json::json!(task.description));
        dlq_context.insert(
            "project_path".into(),
            serde_json::json!(task.project_path.display().to_string()),
        );
        dlq_context.insert("context".into(), serde_json::Value::Object(task.context.clone()));
        if let Err(e) = self
            .dlq
            .add(&task.id, TASK_EXECUTION_OP, dlq_context, &error_text)
            .await
        {
            warn!(task_id = %task.id, error = %e, "failed to park task in DLQ");
        }
        self.metrics
            .dlq_depth
            .store(self.dlq.get_stats().await.pending, std::sync::atomic::Ordering::Relaxed);

        let outcome = self.compensation.compensate(&task.id).await;
        if outcome.failed > 0 {
            warn!(
                task_id = %task.id,
                failed = outcome.failed,
                "compensation completed with failures"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitBreakerConfig;
    use crate::dlq::DlqConfig;
    use crate::rate_limit::RateLimit;

    fn test_pool(workers: usize, capacity: usize) -> Arc<WorkerPool> {
        test_pool_with(workers, capacity, CircuitBreakerConfig::default())
    }

    fn test_pool_with(
        workers: usize,
        capacity: usize,
        circuit: CircuitBreakerConfig,
    ) -> Arc<WorkerPool> {
        let mut catalog = AgentCatalog::new();
        catalog.set_route("code_generation", vec![AgentKind::NoopEcho]);
        catalog.set_route("always_fails", vec![AgentKind::NoopFail]);
        let deps = WorkerPoolDeps {
            registry: Arc::new(TaskRegistry::new()),
            catalog: Arc::new(catalog),
            supervisor: Arc::new(ProcessSupervisor::default()),
            rate_limiter: Arc::new(RateLimiter::new(RateLimit {
                capacity: 10_000,
                refill_rate: 10_000.0,
            })),
            circuit_breaker: Arc::new(CircuitBreaker::new(circuit)),
            dlq: Arc::new(DeadLetterQueue::new(DlqConfig::default())),
            compensation: Arc::new(CompensationRegistry::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            shutdown: ShutdownFlag::new(),
        };
        WorkerPool::new(workers, capacity, deps)
    }

    async fn wait_for_status(pool: &WorkerPool, id: &str, status: TaskStatus) -> Task {
        for _ in 0..200 {
            let task = pool.registry.get(id).unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_submit_returns_queued_immediately() {
        let pool = test_pool(1, 16);
        let task = Task::new("code_generation", "echo hello", "/tmp");
        let id = pool.submit(task).unwrap();
        let stored = pool.registry.get(&id).unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_task_completes_with_echo_output() {
        let pool = test_pool(1, 16);
        pool.start();
        let id = pool
            .submit(Task::new("code_generation", "echo hello", "/tmp"))
            .unwrap();

        let task = wait_for_status(&pool, &id, TaskStatus::Completed).await;
        let result = task.result.unwrap();
        assert!(result["stdout"].as_str().unwrap().contains("echo hello"));
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["agent"], "noop-echo");
        assert!(task.assigned_worker.is_some());
        pool.stop_and_join().await;
    }

    #[tokio::test]
    async fn test_failed_task_parks_in_dlq() {
        let pool = test_pool(1, 16);
        pool.start();
        let id = pool
            .submit(Task::new("always_fails", "doomed", "/tmp"))
            .unwrap();

        let task = wait_for_status(&pool, &id, TaskStatus::Failed).await;
        assert!(task.error.unwrap().contains("exited"));

        let stats = pool.dlq.get_stats().await;
        assert_eq!(stats.pending, 1);
        pool.stop_and_join().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejected_without_side_effects() {
        let pool = test_pool(1, 2);
        // Workers not started: the channel fills up.
        pool.submit(Task::new("code_generation", "a", "/tmp")).unwrap();
        pool.submit(Task::new("code_generation", "b", "/tmp")).unwrap();
        let err = pool
            .submit(Task::new("code_generation", "c", "/tmp"))
            .unwrap_err();
        assert_eq!(err.code(), "QueueFull");
        assert_eq!(pool.stats().queued, 2);
    }

    #[tokio::test]
    async fn test_submit_rejected_during_shutdown() {
        let pool = test_pool(1, 16);
        pool.shutdown.set();
        let err = pool
            .submit(Task::new("code_generation", "late", "/tmp"))
            .unwrap_err();
        assert_eq!(err.code(), "ShuttingDown");
    }

    #[tokio::test]
    async fn test_cancel_queued_task_never_runs() {
        let pool = test_pool(1, 16);
        // Worker not started yet, so the task stays queued.
        let id = pool
            .submit(Task::new("code_generation", "never", "/tmp"))
            .unwrap();
        let outcome = pool.cancel(&id).unwrap();
        assert_eq!(outcome.previous_status, TaskStatus::Queued);

        pool.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let task = pool.registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        // The tombstone was discarded without spawning anything.
        assert_eq!(pool.supervisor.spawned_total(), 0);
        pool.stop_and_join().await;
    }

    #[tokio::test]
    async fn test_cancel_running_task_kills_child() {
        let pool = test_pool(1, 16);
        pool.start();

        // noop-sleep keeps the child alive long enough to cancel it.
        let task = Task::new("code_generation", "30", "/tmp").with_preferred_agent("noop-sleep");
        let id = pool.submit(task).unwrap();
        wait_for_status(&pool, &id, TaskStatus::Running).await;

        let outcome = pool.cancel(&id).unwrap();
        assert_eq!(outcome.previous_status, TaskStatus::Running);
        assert!(outcome.kill_required);

        let task = wait_for_status(&pool, &id, TaskStatus::Cancelled).await;
        assert!(task.finished_at.is_some());

        // A second cancel on the terminal task is rejected.
        let err = pool.cancel(&id).unwrap_err();
        assert_eq!(err.code(), "TerminalState");
        pool.stop_and_join().await;
    }

    #[tokio::test]
    async fn test_fifo_order_with_single_worker() {
        let pool = test_pool(1, 16);
        pool.start();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                pool.submit(Task::new("code_generation", format!("task {i}"), "/tmp"))
                    .unwrap(),
            );
        }
        let mut finished = Vec::new();
        for id in &ids {
            let task = wait_for_status(&pool, id, TaskStatus::Completed).await;
            finished.push(task.finished_at.unwrap());
        }
        for pair in finished.windows(2) {
            assert!(pair[0] <= pair[1], "FIFO completion order violated");
        }
        pool.stop_and_join().await;
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let pool = test_pool_with(
            1,
            16,
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
                half_open_max: 1,
            },
        );
        pool.start();

        for _ in 0..3 {
            let id = pool
                .submit(Task::new("always_fails", "doomed", "/tmp"))
                .unwrap();
            wait_for_status(&pool, &id, TaskStatus::Failed).await;
        }
        let spawned_before = pool.supervisor.spawned_total();

        // Circuit now open: the next task fails without spawning a child.
        let id = pool
            .submit(Task::new("always_fails", "rejected", "/tmp"))
            .unwrap();
        let task = wait_for_status(&pool, &id, TaskStatus::Failed).await;
        assert!(task.error.unwrap().contains("Circuit open"));
        assert_eq!(pool.supervisor.spawned_total(), spawned_before);
        pool.stop_and_join().await;
    }

    #[tokio::test]
    async fn test_no_agent_available_fails_task() {
        let mut catalog = AgentCatalog::new();
        catalog.set_route("exotic", vec![]);
        let deps = WorkerPoolDeps {
            registry: Arc::new(TaskRegistry::new()),
            catalog: Arc::new(catalog),
            supervisor: Arc::new(ProcessSupervisor::default()),
            rate_limiter: Arc::new(RateLimiter::new(RateLimit::default())),
            circuit_breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            dlq: Arc::new(DeadLetterQueue::new(DlqConfig::default())),
            compensation: Arc::new(CompensationRegistry::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            shutdown: ShutdownFlag::new(),
        };
        let pool = WorkerPool::new(1, 16, deps);
        pool.start();

        let id = pool.submit(Task::new("exotic", "nobody", "/tmp")).unwrap();
        let task = wait_for_status(&pool, &id, TaskStatus::Failed).await;
        assert!(task.error.unwrap().contains("No agent available"));
        pool.stop_and_join().await;
    }

    #[tokio::test]
    async fn test_worker_stats() {
        let pool = test_pool(2, 16);
        pool.start();
        let id = pool
            .submit(Task::new("code_generation", "echo s", "/tmp"))
            .unwrap();
        wait_for_status(&pool, &id, TaskStatus::Completed).await;

        let stats = pool.stats();
        assert_eq!(stats.max_workers, 2);
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.queued, 0);
        pool.stop_and_join().await;
    }
}
