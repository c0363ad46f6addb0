//! Component wiring and the operation surface the tool dispatcher binds to.
//!
//! Every component is constructed once here and passed by reference; there
//! are no global registries. The orchestrator also owns the glue the
//! components need from each other: the DLQ retry handler that re-runs a
//! failed task execution, the shutdown cleanups (worker drain, straggler
//! termination, DLQ flush), and the aggregate health report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use crate::agent::AgentCatalog;
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::compensation::CompensationRegistry;
use crate::config::OrchestratorConfig;
use crate::dlq::{DeadLetterQueue, DlqConfig};
use crate::error::Result;
use crate::observability::MetricsRegistry;
use crate::queue::{WorkerPool, WorkerPoolDeps, WorkerStats, TASK_EXECUTION_OP};
use crate::rate_limit::{RateLimit, RateLimiter};
use crate::shutdown::{ShutdownConfig, ShutdownCoordinator, ShutdownFlag};
use crate::state_store::ProjectStore;
use crate::supervisor::ProcessSupervisor;
use crate::task::{CancelOutcome, Task, TaskRegistry, TaskStatus};
use crate::workflow::{PhaseAdvance, StartedFeature, WorkflowEngine};

/// Receipt returned by task delegation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DelegationReceipt {
    pub task_id: String,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
}

/// The assembled orchestrator.
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub tasks: Arc<TaskRegistry>,
    pub pool: Arc<WorkerPool>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub dlq: Arc<DeadLetterQueue>,
    pub compensation: Arc<CompensationRegistry>,
    pub metrics: Arc<MetricsRegistry>,
    pub store: Arc<ProjectStore>,
    pub workflow: WorkflowEngine,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl Orchestrator {
    /// Build and start every component from the resolved configuration.
    ///
    /// Workers and the DLQ auto-retry loop are running when this returns;
    /// signal handlers are NOT installed (the binary decides that).
    pub async fn start(config: OrchestratorConfig) -> Result<Arc<Self>> {
        let metrics = Arc::new(MetricsRegistry::new());
        let tasks = Arc::new(TaskRegistry::new());
        let supervisor = Arc::new(ProcessSupervisor::default());
        let rate_limiter = Arc::new(RateLimiter::new(RateLimit {
            capacity: config.rate_limit_capacity,
            refill_rate: config.rate_limit_rate,
        }));
        let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_failure_threshold,
            cooldown: config.circuit_cooldown,
            half_open_max: 1,
        }));
        let dlq = Arc::new(
            DeadLetterQueue::load(DlqConfig {
                path: config.dlq_path.clone(),
                ..DlqConfig::default()
            })
            .await?,
        );
        let compensation = Arc::new(CompensationRegistry::new());
        let store = Arc::new(ProjectStore::open(config.state_root.clone()).await?);
        let workflow = WorkflowEngine::new(Arc::clone(&store));

        let flag = ShutdownFlag::new();
        let shutdown = ShutdownCoordinator::new(
            ShutdownConfig {
                request_timeout: config.shutdown_request_timeout,
                cleanup_timeout: config.shutdown_cleanup_timeout,
                force_after_timeout: true,
            },
            flag.clone(),
        );

        let pool = WorkerPool::new(
            config.worker_count,
            config.queue_capacity,
            WorkerPoolDeps {
                registry: Arc::clone(&tasks),
                catalog: Arc::new(AgentCatalog::new()),
                supervisor: Arc::clone(&supervisor),
                rate_limiter: Arc::clone(&rate_limiter),
                circuit_breaker: Arc::clone(&circuit_breaker),
                dlq: Arc::clone(&dlq),
                compensation: Arc::clone(&compensation),
                metrics: Arc::clone(&metrics),
                shutdown: flag,
            },
        );
        pool.start();

        // Failed executions re-run through the pool's retry path.
        let retry_pool = Arc::clone(&pool);
        dlq.register_handler(
            TASK_EXECUTION_OP,
            Arc::new(move |entry| {
                let pool = Arc::clone(&retry_pool);
                Box::pin(async move { pool.retry_execution(&entry.context).await })
            }),
        )
        .await;
        dlq.start_auto_retry(config.dlq_retry_interval).await;

        let orchestrator = Arc::new(Self {
            config,
            tasks,
            pool,
            supervisor,
            rate_limiter,
            circuit_breaker,
            dlq,
            compensation,
            metrics,
            store,
            workflow,
            shutdown,
        });
        orchestrator.register_cleanups().await;
        info!("orchestrator started");
        Ok(orchestrator)
    }

    /// Orchestrator cleanups, in the order shutdown runs them.
    async fn register_cleanups(self: &Arc<Self>) {
        // 1. Cancel everything still queued and let running children finish.
        let pool = Arc::clone(&self.pool);
        self.shutdown
            .register_cleanup(
                "drain-workers",
                Arc::new(move || {
                    let pool = Arc::clone(&pool);
                    Box::pin(async move {
                        let cancelled = pool.cancel_queued();
                        if cancelled > 0 {
                            info!(cancelled, "cancelled queued tasks for shutdown");
                        }
                        pool.stop_and_join().await;
                        Ok(())
                    })
                }),
            )
            .await;

        // 2. Anything still RUNNING gets the cancel signal (kill escalation
        //    is the supervisor's job).
        let tasks = Arc::clone(&self.tasks);
        let pool = Arc::clone(&self.pool);
        self.shutdown
            .register_cleanup(
                "terminate-stragglers",
                Arc::new(move || {
                    let tasks = Arc::clone(&tasks);
                    let pool = Arc::clone(&pool);
                    Box::pin(async move {
                        for task in tasks.list_active() {
                            if task.status == TaskStatus::Running {
                                let _ = pool.cancel(&task.id);
                            }
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        // 3. Stop the retry loop and flush DLQ persistence.
        let dlq = Arc::clone(&self.dlq);
        self.shutdown
            .register_cleanup(
                "flush-dlq",
                Arc::new(move || {
                    let dlq = Arc::clone(&dlq);
                    Box::pin(async move {
                        dlq.stop_auto_retry().await;
                        dlq.flush().await.map_err(|e| e.to_string())
                    })
                }),
            )
            .await;
    }

    // =========================================================================
    // Task operations
    // =========================================================================

    /// Delegate a task: enqueue and return immediately.
    pub fn delegate_task(&self, task: Task) -> Result<DelegationReceipt> {
        if self.shutdown.flag().is_set() {
            return Err(crate::error::Error::ShuttingDown);
        }
        self.pool.check_routable(&task)?;
        let submitted_at = task.created_at;
        let task_id = self.pool.submit(task)?;
        Ok(DelegationReceipt {
            task_id,
            status: TaskStatus::Queued,
            submitted_at,
        })
    }

    /// Fetch one task record.
    pub fn task_status(&self, task_id: &str) -> Result<Task> {
        self.tasks.get(task_id)
    }

    /// All non-terminal tasks.
    pub fn active_tasks(&self) -> Vec<Task> {
        self.tasks.list_active()
    }

    /// Aggregate worker statistics.
    pub fn worker_stats(&self) -> WorkerStats {
        self.pool.stats()
    }

    /// Cancel a task.
    pub fn cancel_task(&self, task_id: &str) -> Result<CancelOutcome> {
        self.pool.cancel(task_id)
    }

    // =========================================================================
    // Project and workflow operations
    // =========================================================================

    /// Register (or return) the project at `path`.
    pub async fn register_project(
        &self,
        name: Option<String>,
        path: impl Into<PathBuf>,
    ) -> Result<crate::project::Project> {
        self.store.register(name, path).await
    }

    /// Start a feature workflow on a project.
    pub async fn start_feature(
        &self,
        project_path: &Path,
        prompt: &str,
        workflow_type: Option<&str>,
    ) -> Result<StartedFeature> {
        self.workflow
            .start_feature(project_path, prompt, workflow_type)
            .await
    }

    /// Submit artifacts for a feature's current phase.
    pub async fn submit_work(
        &self,
        project_path: &Path,
        feature_id: &str,
        phase_id: &str,
        results: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PhaseAdvance> {
        self.workflow
            .submit_phase(project_path, feature_id, phase_id, results)
            .await
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Aggregate health report for `getHealth`.
    pub async fn health_report(&self) -> serde_json::Value {
        let snapshot = self.metrics.snapshot();
        let dlq_stats = self.dlq.get_stats().await;
        let stats = self.pool.stats();
        let status = if self.shutdown.flag().is_set() {
            "shutting_down"
        } else {
            "ok"
        };
        json!({
            "status": status,
            "uptime_seconds": snapshot.uptime_seconds,
            "metrics": snapshot,
            "checks": {
                "workers": {
                    "max": stats.max_workers,
                    "active": stats.active_workers,
                    "queued": stats.queued,
                },
                "dlq": dlq_stats,
                "rate_limits": self.rate_limiter.snapshots().await,
                "circuits": self.circuit_breaker.snapshots().await,
                "children": self.supervisor.live_pids(),
            }
        })
    }

    /// Trigger shutdown and run the full sequence to completion.
    pub async fn shutdown_now(&self) -> crate::shutdown::ShutdownReport {
        self.shutdown.trigger();
        self.shutdown.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn test_orchestrator() -> (tempfile::TempDir, Arc<Orchestrator>) {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            worker_count: 2,
            queue_capacity: 32,
            shutdown_request_timeout: Duration::from_millis(500),
            shutdown_cleanup_timeout: Duration::from_secs(5),
            dlq_path: Some(dir.path().join("dlq.json")),
            dlq_retry_interval: Duration::from_secs(60),
            state_root: dir.path().join("registry"),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::start(config).await.unwrap();
        (dir, orchestrator)
    }

    #[tokio::test]
    async fn test_delegate_and_complete() {
        let (_dir, orchestrator) = test_orchestrator().await;
        let task =
            Task::new("code_generation", "echo hi", "/tmp").with_preferred_agent("noop-echo");
        let receipt = orchestrator.delegate_task(task).unwrap();
        assert_eq!(receipt.status, TaskStatus::Queued);

        for _ in 0..100 {
            if orchestrator.task_status(&receipt.task_id).unwrap().status
                == TaskStatus::Completed
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let task = orchestrator.task_status(&receipt.task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_health_report_shape() {
        let (_dir, orchestrator) = test_orchestrator().await;
        let health = orchestrator.health_report().await;
        assert_eq!(health["status"], "ok");
        assert!(health["uptime_seconds"].is_u64());
        assert!(health["checks"]["workers"]["max"].is_u64());
        assert!(health["checks"]["dlq"]["pending"].is_u64());
    }

    #[tokio::test]
    async fn test_shutdown_sequence_completes() {
        let (_dir, orchestrator) = test_orchestrator().await;
        let report = orchestrator.shutdown_now().await;
        assert!(report.drained);
        assert_eq!(report.cleanups_failed, 0);
        assert_eq!(report.cleanups_succeeded, 3);

        let err = orchestrator
            .delegate_task(Task::new("code_generation", "late", "/tmp"))
            .unwrap_err();
        assert_eq!(err.code(), "ShuttingDown");
    }

    #[tokio::test]
    async fn test_register_project_via_facade() {
        let (dir, orchestrator) = test_orchestrator().await;
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();

        let project = orchestrator
            .register_project(Some("proj".into()), &project_dir)
            .await
            .unwrap();
        let started = orchestrator
            .start_feature(&project_dir, "add auth", None)
            .await
            .unwrap();
        assert_eq!(started.phase, "define");

        let loaded = orchestrator.store.get_by_id(&project.id).await.unwrap();
        assert_eq!(loaded.features.len(), 1);
    }
}
