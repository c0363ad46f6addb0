//! DashCrew Core
//!
//! Core orchestration logic for the DashCrew multi-agent server: the
//! non-blocking task dispatcher and worker pool, the child-process
//! supervisor for third-party coding agents, the resilience layer (rate
//! limiting, circuit breaking, dead-letter retries, compensation), the
//! per-project state store and feature workflow engine, and the graceful
//! shutdown coordinator.
//!
//! ## Architecture
//!
//! - **WorkerPool**: bounded FIFO queue drained by N cooperative workers
//! - **ProcessSupervisor**: spawn, stream, health-sample, and kill agent children
//! - **Resilience**: per-agent token buckets and circuit breakers, DLQ with
//!   exponential-backoff auto-retry, LIFO compensation
//! - **ProjectStore / WorkflowEngine**: one JSON state file per project and a
//!   phase state machine over it
//! - **ShutdownCoordinator**: signal-driven drain with ordered cleanups

pub mod agent;
pub mod circuit;
pub mod compensation;
pub mod config;
pub mod dlq;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod project;
pub mod queue;
pub mod rate_limit;
pub mod shutdown;
pub mod spawn;
pub mod state_store;
pub mod supervisor;
pub mod task;
pub mod workflow;

// Re-exports
pub use agent::{AgentCatalog, AgentKind};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use compensation::{CompensationFn, CompensationOutcome, CompensationRegistry};
pub use config::OrchestratorConfig;
pub use dlq::{
    DeadLetterQueue, DlqConfig, DlqEntry, DlqStats, DlqStatus, RetryHandler,
    DEFAULT_DLQ_BASE_BACKOFF, DEFAULT_DLQ_MAX_ATTEMPTS, DEFAULT_DLQ_MAX_BACKOFF,
};
pub use error::{Error, Result, Severity};
pub use observability::{
    record_metric, CorrelationId, MetricsRegistry, MetricsSnapshot, TracedOperation,
};
pub use orchestrator::{DelegationReceipt, Orchestrator};
pub use project::{Feature, FeatureStatus, Project, ProjectStatus};
pub use queue::{
    WorkerPool, WorkerPoolDeps, WorkerStats, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT,
    TASK_EXECUTION_OP,
};
pub use rate_limit::{RateLimit, RateLimiter, ScopeSnapshot};
pub use shutdown::{
    CleanupFn, ShutdownConfig, ShutdownCoordinator, ShutdownFlag, ShutdownReport,
};
pub use spawn::{spawn_child, SpawnOptions, StdioPolicy};
pub use state_store::{ProjectStore, INDEX_FILE, STATE_DIR, STATE_FILE};
pub use supervisor::{
    CommandSpec, HealthSnapshot, KillReport, OutputLine, OutputSource, ProcessSupervisor,
    RunOutput, SpawnOutcome, StreamingChild, KILL_GRACE_PERIOD,
};
pub use task::{CancelOutcome, Task, TaskRegistry, TaskStatus};
pub use workflow::{
    PhaseAdvance, PhaseSpec, StartedFeature, ValueShape, WorkflowDefinition, WorkflowEngine,
    WorkflowRegistry, FEATURE_WORKFLOW,
};
