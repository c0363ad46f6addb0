//! Task records and the lifecycle-validated task registry.
//!
//! The registry owns every [`Task`] for the process lifetime. Status
//! transitions follow the lifecycle DAG — QUEUED → RUNNING → terminal, with
//! CANCELLED reachable from both non-terminal states — and terminal
//! transitions happen at most once; anything else is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the lifecycle permits moving to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Queued => matches!(next, TaskStatus::Running | TaskStatus::Cancelled),
            TaskStatus::Running => matches!(
                next,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(token)
    }
}

/// A unit of work submitted for execution by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_agent: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<usize>,
    /// Working directory the agent runs in.
    pub project_path: PathBuf,
    /// Free-form context rendered into the agent prompt.
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Populated on COMPLETED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Map<String, serde_json::Value>>,
    /// Populated on FAILED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new QUEUED task.
    pub fn new(
        task_type: impl Into<String>,
        description: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            description: description.into(),
            preferred_agent: None,
            status: TaskStatus::Queued,
            assigned_agent: None,
            assigned_worker: None,
            project_path: project_path.into(),
            context: serde_json::Map::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Set the preferred agent.
    pub fn with_preferred_agent(mut self, agent: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent.into());
        self
    }

    /// Set the prompt context.
    pub fn with_context(mut self, context: serde_json::Map<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Status the task held when the request arrived.
    pub previous_status: TaskStatus,
    /// True when the task was RUNNING and the child must be terminated.
    pub kill_required: bool,
}

/// In-memory task registry keyed by task id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new task.
    pub fn insert(&self, task: Task) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(task.id.clone(), task);
        }
    }

    /// Remove a task record entirely (rejected submissions only).
    pub fn remove(&self, id: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.remove(id);
        }
    }

    /// Fetch a task by id.
    pub fn get(&self, id: &str) -> Result<Task> {
        self.tasks
            .lock()
            .ok()
            .and_then(|tasks| tasks.get(id).cloned())
            .ok_or_else(|| Error::NotFound(format!("task '{id}'")))
    }

    /// All tasks, newest first.
    pub fn list_all(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Non-terminal tasks, newest first.
    pub fn list_active(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .map(|tasks| {
                tasks
                    .values()
                    .filter(|t| !t.status.is_terminal())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Count of tasks currently QUEUED.
    pub fn queued_count(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Queued)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Mark a task RUNNING and record its worker and agent assignment.
    ///
    /// Fails with [`Error::TerminalState`] if the task was cancelled while
    /// queued (the worker then discards it).
    pub fn mark_running(&self, id: &str, worker: usize, agent: &str) -> Result<()> {
        self.update(id, |task| {
            if !task.status.can_transition_to(TaskStatus::Running) {
                return Err(Error::TerminalState(format!(
                    "task '{id}' is {} and cannot start",
                    task.status
                )));
            }
            task.status = TaskStatus::Running;
            task.assigned_worker = Some(worker);
            task.assigned_agent = Some(agent.to_string());
            task.started_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Transition a RUNNING task to COMPLETED with its result payload.
    pub fn complete(
        &self,
        id: &str,
        result: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.finish(id, TaskStatus::Completed, Some(result), None)
    }

    /// Transition a RUNNING task to FAILED with its error text.
    pub fn fail(&self, id: &str, error_text: impl Into<String>) -> Result<()> {
        self.finish(id, TaskStatus::Failed, None, Some(error_text.into()))
    }

    /// Transition a task to CANCELLED after its child is confirmed gone
    /// (or immediately, for queued tombstones).
    pub fn mark_cancelled(&self, id: &str) -> Result<()> {
        self.finish(id, TaskStatus::Cancelled, None, None)
    }

    /// Request cancellation.
    ///
    /// A QUEUED task transitions to CANCELLED immediately (workers discard
    /// the tombstone on dequeue). A RUNNING task stays RUNNING; the caller
    /// must terminate the child, after which the worker records CANCELLED.
    /// Terminal tasks are rejected with [`Error::TerminalState`].
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| Error::Persistence("task registry lock poisoned".to_string()))?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("task '{id}'")))?;

        let previous = task.status;
        match previous {
            TaskStatus::Queued => {
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(Utc::now());
                Ok(CancelOutcome {
                    previous_status: previous,
                    kill_required: false,
                })
            }
            TaskStatus::Running => Ok(CancelOutcome {
                previous_status: previous,
                kill_required: true,
            }),
            _ => Err(Error::TerminalState(format!(
                "task '{id}' is already {previous}"
            ))),
        }
    }

    fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<serde_json::Map<String, serde_json::Value>>,
        error_text: Option<String>,
    ) -> Result<()> {
        self.update(id, |task| {
            if !task.status.can_transition_to(status) {
                return Err(Error::TerminalState(format!(
                    "task '{id}' is {} and cannot become {status}",
                    task.status
                )));
            }
            task.status = status;
            task.result = result.clone();
            task.error = error_text.clone();
            task.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut Task) -> Result<()>) -> Result<()> {
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| Error::Persistence("task registry lock poisoned".to_string()))?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("task '{id}'")))?;
        f(task)
    }
}
