//! MCP server handler exposing the orchestrator tool surface.
//!
//! The handler is the adapter boundary: it mints a correlation id, checks
//! the shutdown flag, validates inputs, calls into the orchestrator, and
//! converts typed errors into the structured error envelope. No business
//! rules live here.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, JsonObject, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::ErrorData as McpError;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use dashcrew_core::{CorrelationId, Error as CoreError, Orchestrator, Task, TracedOperation};

/// Arguments for the `delegateTask` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegateTaskArgs {
    /// The coding task in natural language.
    pub task_description: String,

    /// Task type used by the routing policy.
    #[serde(default = "default_task_type")]
    pub task_type: String,

    /// Working directory for the agent.
    #[serde(default = "default_project_path")]
    pub project_path: String,

    /// Free-form context rendered into the agent prompt.
    #[serde(default)]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,

    /// Agent to use instead of the routing policy.
    #[serde(default)]
    pub preferred_agent: Option<String>,
}

fn default_task_type() -> String {
    "code_generation".to_string()
}

fn default_project_path() -> String {
    ".".to_string()
}

/// Arguments for tools addressing one task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskIdArgs {
    pub task_id: String,
}

/// Arguments for the `registerProject` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterProjectArgs {
    pub project_path: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Arguments for the `startFeature` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct StartFeatureArgs {
    pub project_path: String,
    pub user_prompt: String,
    #[serde(default)]
    pub workflow_type: Option<String>,
}

/// Arguments for the `submitWork` tool.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitWorkArgs {
    pub project_path: String,
    pub feature_id: String,
    pub phase_id: String,
    pub results: serde_json::Map<String, serde_json::Value>,
}

/// MCP server handler bound to one orchestrator instance.
#[derive(Clone)]
pub struct OrchestratorToolServer {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorToolServer {
    /// Create a handler over a running orchestrator.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    fn tool(name: &'static str, description: &'static str, schema: serde_json::Value) -> Tool {
        let schema: JsonObject =
            serde_json::from_value(schema).expect("tool schema should deserialize");
        Tool::new(Cow::Borrowed(name), Cow::Borrowed(description), Arc::new(schema))
    }

    fn tools() -> Vec<Tool> {
        vec![
            Self::tool(
                "delegateTask",
                "Delegate a coding task to a locally-installed coding agent. \
                 Returns immediately with a task id; poll getTaskStatus for the result.",
                json!({
                    "type": "object",
                    "properties": {
                        "task_description": {
                            "type": "string",
                            "description": "The coding task in natural language"
                        },
                        "task_type": {
                            "type": "string",
                            "description": "Task type for routing (default: code_generation)"
                        },
                        "project_path": {
                            "type": "string",
                            "description": "Working directory for the agent (default: .)"
                        },
                        "context": {
                            "type": "object",
                            "description": "Extra context rendered into the agent prompt"
                        },
                        "preferred_agent": {
                            "type": "string",
                            "description": "Agent name to use instead of the routing policy"
                        }
                    },
                    "required": ["task_description"],
                    "additionalProperties": false
                }),
            ),
            Self::tool(
                "getTaskStatus",
                "Fetch the full record of a delegated task by id.",
                json!({
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "string", "description": "Task id from delegateTask"}
                    },
                    "required": ["task_id"],
                    "additionalProperties": false
                }),
            ),
            Self::tool(
                "listActiveTasks",
                "List all tasks that have not reached a terminal state.",
                json!({"type": "object", "properties": {}, "additionalProperties": false}),
            ),
            Self::tool(
                "getWorkerStats",
                "Aggregate worker pool statistics.",
                json!({"type": "object", "properties": {}, "additionalProperties": false}),
            ),
            Self::tool(
                "cancelTask",
                "Cancel a queued or running task.",
                json!({
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "string", "description": "Task id to cancel"}
                    },
                    "required": ["task_id"],
                    "additionalProperties": false
                }),
            ),
            Self::tool(
                "registerProject",
                "Register a project directory with the orchestrator (idempotent).",
                json!({
                    "type": "object",
                    "properties": {
                        "project_path": {
                            "type": "string",
                            "description": "Absolute path to the project directory"
                        },
                        "name": {
                            "type": "string",
                            "description": "Project name (default: directory name)"
                        }
                    },
                    "required": ["project_path"],
                    "additionalProperties": false
                }),
            ),
            Self::tool(
                "startFeature",
                "Start a feature workflow on a registered project.",
                json!({
                    "type": "object",
                    "properties": {
                        "project_path": {"type": "string", "description": "Registered project path"},
                        "user_prompt": {"type": "string", "description": "The feature request"},
                        "workflow_type": {
                            "type": "string",
                            "description": "Workflow name (default: feature_development)"
                        }
                    },
                    "required": ["project_path", "user_prompt"],
                    "additionalProperties": false
                }),
            ),
            Self::tool(
                "submitWork",
                "Submit artifacts for a feature's current phase and advance the workflow.",
                json!({
                    "type": "object",
                    "properties": {
                        "project_path": {"type": "string", "description": "Registered project path"},
                        "feature_id": {"type": "string", "description": "Feature id from startFeature"},
                        "phase_id": {"type": "string", "description": "Phase being submitted"},
                        "results": {"type": "object", "description": "Phase artifact payload"}
                    },
                    "required": ["project_path", "feature_id", "phase_id", "results"],
                    "additionalProperties": false
                }),
            ),
            Self::tool(
                "getHealth",
                "Server health: uptime, metrics, and per-component checks.",
                json!({"type": "object", "properties": {}, "additionalProperties": false}),
            ),
        ]
    }

    /// Execute one named tool against the orchestrator.
    ///
    /// Wraps the call in request tracking and a traced operation so every
    /// invocation emits started/finished/exception records under one
    /// correlation id.
    pub async fn dispatch(
        &self,
        name: &'static str,
        arguments: Option<JsonObject>,
    ) -> Result<serde_json::Value, CoreError> {
        let correlation_id = CorrelationId::new();
        self.orchestrator
            .shutdown
            .track_begin(correlation_id.as_str())
            .await?;
        let traced = TracedOperation::start(name, correlation_id.clone());

        let outcome = self.execute(name, arguments).await;

        match &outcome {
            Ok(_) => traced.finish(),
            Err(e) => traced.fail(e.code(), &e.to_string()),
        }
        self.orchestrator
            .shutdown
            .track_end(correlation_id.as_str())
            .await;
        outcome
    }

    async fn execute(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<serde_json::Value, CoreError> {
        match name {
            "delegateTask" => {
                let args: DelegateTaskArgs = parse_args(arguments)?;
                if args.task_description.trim().is_empty() {
                    return Err(CoreError::Validation(
                        "task_description must not be empty".to_string(),
                    ));
                }
                let mut task = Task::new(
                    args.task_type,
                    args.task_description,
                    PathBuf::from(args.project_path),
                );
                if let Some(context) = args.context {
                    task = task.with_context(context);
                }
                if let Some(agent) = args.preferred_agent {
                    task = task.with_preferred_agent(agent);
                }
                let receipt = self.orchestrator.delegate_task(task)?;
                Ok(serde_json::to_value(receipt)?)
            }
            "getTaskStatus" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let task = self.orchestrator.task_status(&args.task_id)?;
                Ok(serde_json::to_value(task)?)
            }
            "listActiveTasks" => {
                let tasks = self.orchestrator.active_tasks();
                Ok(json!({"total": tasks.len(), "tasks": tasks}))
            }
            "getWorkerStats" => {
                let stats = self.orchestrator.worker_stats();
                Ok(serde_json::to_value(stats)?)
            }
            "cancelTask" => {
                let args: TaskIdArgs = parse_args(arguments)?;
                let outcome = self.orchestrator.cancel_task(&args.task_id)?;
                Ok(json!({
                    "cancelled": true,
                    "previous_status": outcome.previous_status,
                }))
            }
            "registerProject" => {
                let args: RegisterProjectArgs = parse_args(arguments)?;
                let project = self
                    .orchestrator
                    .register_project(args.name, PathBuf::from(args.project_path))
                    .await?;
                Ok(json!({
                    "project_id": project.id,
                    "name": project.name,
                    "path": project.path,
                    "status": project.status,
                }))
            }
            "startFeature" => {
                let args: StartFeatureArgs = parse_args(arguments)?;
                if args.user_prompt.trim().is_empty() {
                    return Err(CoreError::Validation(
                        "user_prompt must not be empty".to_string(),
                    ));
                }
                let started = self
                    .orchestrator
                    .start_feature(
                        &PathBuf::from(args.project_path),
                        &args.user_prompt,
                        args.workflow_type.as_deref(),
                    )
                    .await?;
                Ok(serde_json::to_value(started)?)
            }
            "submitWork" => {
                let args: SubmitWorkArgs = parse_args(arguments)?;
                let advance = self
                    .orchestrator
                    .submit_work(
                        &PathBuf::from(args.project_path),
                        &args.feature_id,
                        &args.phase_id,
                        args.results,
                    )
                    .await?;
                Ok(serde_json::to_value(advance)?)
            }
            "getHealth" => Ok(self.orchestrator.health_report().await),
            other => Err(CoreError::Validation(format!("unknown tool: {other}"))),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: Option<JsonObject>,
) -> Result<T, CoreError> {
    let arguments = arguments.unwrap_or_default();
    serde_json::from_value(serde_json::Value::Object(arguments.into_iter().collect()))
        .map_err(|e| CoreError::Validation(format!("invalid arguments: {e}")))
}

/// Convert a successful payload to an MCP tool result.
fn ok_result(payload: serde_json::Value) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(payload.to_string())],
        structured_content: Some(payload),
        is_error: Some(false),
        meta: None,
    }
}

/// Convert a typed error to the structured error envelope.
///
/// Stack traces never cross this boundary; the envelope carries the error
/// code, message, severity, and an optional remediation hint.
fn error_result(error: &CoreError) -> CallToolResult {
    let envelope = json!({
        "error": {
            "code": error.code(),
            "message": error.to_string(),
            "severity": error.severity(),
            "remediation": error.remediation(),
        }
    });
    CallToolResult {
        content: vec![Content::text(error.to_string())],
        structured_content: Some(envelope),
        is_error: Some(true),
        meta: None,
    }
}

#[allow(clippy::manual_async_fn)]
impl ServerHandler for OrchestratorToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..ServerInfo::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            Ok(ListToolsResult {
                tools: Self::tools(),
                next_cursor: None,
            })
        }
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        info!("MCP tool call: {}", request.name);

        const TOOL_NAMES: [&str; 9] = [
            "delegateTask",
            "getTaskStatus",
            "listActiveTasks",
            "getWorkerStats",
            "cancelTask",
            "registerProject",
            "startFeature",
            "submitWork",
            "getHealth",
        ];
        let Some(name) = TOOL_NAMES
            .iter()
            .copied()
            .find(|n| *n == request.name.as_ref())
        else {
            return Err(McpError::invalid_params(
                format!("unknown tool: {}", request.name),
                None,
            ));
        };

        match self.dispatch(name, request.arguments).await {
            Ok(payload) => Ok(ok_result(payload)),
            Err(e) => Ok(error_result(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcrew_core::OrchestratorConfig;
    use std::time::Duration;

    async fn test_server() -> (tempfile::TempDir, OrchestratorToolServer) {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            worker_count: 2,
            queue_capacity: 32,
            shutdown_request_timeout: Duration::from_millis(500),
            dlq_path: Some(dir.path().join("dlq.json")),
            dlq_retry_interval: Duration::from_secs(3600),
            state_root: dir.path().join("registry"),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::start(config).await.unwrap();
        (dir, OrchestratorToolServer::new(orchestrator))
    }

    fn args(value: serde_json::Value) -> Option<JsonObject> {
        Some(value.as_object().unwrap().clone().into_iter().collect())
    }

    #[test]
    fn test_tool_list_is_complete() {
        let tools = OrchestratorToolServer::tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(
            names,
            vec![
                "delegateTask",
                "getTaskStatus",
                "listActiveTasks",
                "getWorkerStats",
                "cancelTask",
                "registerProject",
                "startFeature",
                "submitWork",
                "getHealth",
            ]
        );
        for tool in &tools {
            assert!(tool.description.is_some());
        }
    }

    #[test]
    fn test_delegate_args_defaults() {
        let json = r#"{"task_description": "fix the bug"}"#;
        let parsed: DelegateTaskArgs = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.task_type, "code_generation");
        assert_eq!(parsed.project_path, ".");
        assert!(parsed.context.is_none());
        assert!(parsed.preferred_agent.is_none());
    }

    #[tokio::test]
    async fn test_delegate_and_status_roundtrip() {
        let (_dir, server) = test_server().await;
        let payload = server
            .dispatch(
                "delegateTask",
                args(json!({
                    "task_description": "echo hi",
                    "preferred_agent": "noop-echo",
                })),
            )
            .await
            .unwrap();
        assert_eq!(payload["status"], "QUEUED");
        let task_id = payload["task_id"].as_str().unwrap().to_string();

        let status = server
            .dispatch("getTaskStatus", args(json!({"task_id": task_id})))
            .await
            .unwrap();
        assert_eq!(status["description"], "echo hi");
    }

    #[tokio::test]
    async fn test_delegate_rejects_empty_description() {
        let (_dir, server) = test_server().await;
        let err = server
            .dispatch("delegateTask", args(json!({"task_description": "  "})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Validation");
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (_dir, server) = test_server().await;
        let err = server
            .dispatch("getTaskStatus", args(json!({"task_id": "missing"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[tokio::test]
    async fn test_list_and_stats_tools() {
        let (_dir, server) = test_server().await;
        let listed = server.dispatch("listActiveTasks", None).await.unwrap();
        assert_eq!(listed["total"], 0);

        let stats = server.dispatch("getWorkerStats", None).await.unwrap();
        assert_eq!(stats["max_workers"], 2);
    }

    #[tokio::test]
    async fn test_project_and_workflow_tools() {
        let (dir, server) = test_server().await;
        let project_dir = dir.path().join("proj");
        std::fs::create_dir_all(&project_dir).unwrap();
        let path = project_dir.to_string_lossy().to_string();

        let registered = server
            .dispatch("registerProject", args(json!({"project_path": path})))
            .await
            .unwrap();
        assert_eq!(registered["status"], "ACTIVE");

        let started = server
            .dispatch(
                "startFeature",
                args(json!({"project_path": path, "user_prompt": "add auth"})),
            )
            .await
            .unwrap();
        assert_eq!(started["phase"], "define");
        let feature_id = started["feature_id"].as_str().unwrap();

        let advanced = server
            .dispatch(
                "submitWork",
                args(json!({
                    "project_path": path,
                    "feature_id": feature_id,
                    "phase_id": "define",
                    "results": {"specification": "X"},
                })),
            )
            .await
            .unwrap();
        assert_eq!(advanced["status"], "success");
        assert_eq!(advanced["next_phase"], "decompose");
    }

    #[tokio::test]
    async fn test_start_feature_unregistered_project() {
        let (dir, server) = test_server().await;
        let path = dir.path().join("nowhere").to_string_lossy().to_string();
        let err = server
            .dispatch(
                "startFeature",
                args(json!({"project_path": path, "user_prompt": "x"})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NotFound");
    }

    #[tokio::test]
    async fn test_health_tool() {
        let (_dir, server) = test_server().await;
        let health = server.dispatch("getHealth", None).await.unwrap();
        assert_eq!(health["status"], "ok");
        assert!(health["checks"]["workers"]["max"].is_u64());
    }

    #[tokio::test]
    async fn test_dispatch_rejected_during_shutdown() {
        let (_dir, server) = test_server().await;
        server.orchestrator.shutdown_now().await;
        let err = server.dispatch("getHealth", None).await.unwrap_err();
        assert_eq!(err.code(), "ShuttingDown");
    }

    #[test]
    fn test_error_envelope_shape() {
        let err = CoreError::NotFound("task 't-1'".to_string());
        let result = error_result(&err);
        assert_eq!(result.is_error, Some(true));
        let envelope = result.structured_content.unwrap();
        assert_eq!(envelope["error"]["code"], "NotFound");
        assert_eq!(envelope["error"]["severity"], "warning");
        assert!(envelope["error"]["message"].as_str().unwrap().contains("t-1"));
    }

    #[test]
    fn test_ok_result_carries_structured_content() {
        let result = ok_result(json!({"answer": 42}));
        assert_eq!(result.is_error, Some(false));
        assert_eq!(result.structured_content.unwrap()["answer"], 42);
    }
}
