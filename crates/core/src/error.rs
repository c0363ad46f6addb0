//! Error types for DashCrew Core
//!
//! Every fallible operation in the orchestrator returns [`Error`]. The enum
//! doubles as the error classification surfaced through the tool boundary:
//! [`Error::code`] yields the stable wire code, [`Error::severity`] and
//! [`Error::remediation`] feed the structured error envelope.

use thiserror::Error;

/// Severity attached to structured error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Caller mistake; retry with corrected input.
    Warning,
    /// Operation failed; the server is healthy.
    Error,
    /// The server is degraded (persistence failure, shutdown in progress).
    Critical,
}

/// Core errors for the DashCrew orchestrator
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already in a terminal state: {0}")]
    TerminalState(String),

    #[error("Phase mismatch: submitted '{submitted}', current phase is '{current}'")]
    PhaseMismatch { submitted: String, current: String },

    #[error("Artifact validation failed: {0}")]
    ArtifactValidation(String),

    #[error("Project is read-only: {0}")]
    ReadOnly(String),

    #[error("Invalid project state: {0}")]
    InvalidProjectState(String),

    #[error("Task queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Server is shutting down")]
    ShuttingDown,

    #[error("No agent available for task type '{0}'")]
    NoAgentAvailable(String),

    #[error("Circuit open for scope '{0}'")]
    CircuitOpen(String),

    #[error("Rate limited for scope '{0}'")]
    RateLimited(String),

    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Child exited with code {code}: {detail}")]
    ChildExitedNonZero { code: i32, detail: String },

    #[error("Failed to kill process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code surfaced through the tool boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "Validation",
            Error::NotFound(_) => "NotFound",
            Error::TerminalState(_) => "TerminalState",
            Error::PhaseMismatch { .. } => "PhaseMismatch",
            Error::ArtifactValidation(_) => "ArtifactValidation",
            Error::ReadOnly(_) => "ReadOnly",
            Error::InvalidProjectState(_) => "InvalidProjectState",
            Error::QueueFull(_) => "QueueFull",
            Error::ShuttingDown => "ShuttingDown",
            Error::NoAgentAvailable(_) => "NoAgentAvailable",
            Error::CircuitOpen(_) => "CircuitOpen",
            Error::RateLimited(_) => "RateLimited",
            Error::SpawnFailed { .. } => "SpawnFailed",
            Error::ChildExitedNonZero { .. } => "ChildExitedNonZero",
            Error::KillFailed { .. } => "KillFailed",
            Error::Persistence(_) => "PersistenceError",
            Error::Serialization(_) => "Validation",
            Error::Io(_) => "PersistenceError",
        }
    }

    /// Severity bucket for the structured error envelope.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::TerminalState(_)
            | Error::PhaseMismatch { .. }
            | Error::ArtifactValidation(_)
            | Error::InvalidProjectState(_)
            | Error::Serialization(_) => Severity::Warning,
            Error::QueueFull(_)
            | Error::NoAgentAvailable(_)
            | Error::CircuitOpen(_)
            | Error::RateLimited(_)
            | Error::SpawnFailed { .. }
            | Error::ChildExitedNonZero { .. }
            | Error::KillFailed { .. } => Severity::Error,
            Error::ReadOnly(_)
            | Error::ShuttingDown
            | Error::Persistence(_)
            | Error::Io(_) => Severity::Critical,
        }
    }

    /// Optional remediation hint for callers.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::QueueFull(_) => Some("Wait for queued tasks to drain, then resubmit"),
            Error::ShuttingDown => Some("The server is draining; reconnect after restart"),
            Error::NoAgentAvailable(_) => {
                Some("Install one of the supported coding agents or pass preferred_agent")
            }
            Error::CircuitOpen(_) => Some("The agent is failing repeatedly; retry after cooldown"),
            Error::RateLimited(_) => Some("Reduce submission rate and retry"),
            Error::ReadOnly(_) => {
                Some("Project state persistence failed; fix disk access and re-register")
            }
            Error::PhaseMismatch { .. } => {
                Some("Query the feature's current phase and submit to that phase")
            }
            _ => None,
        }
    }

    /// Whether this error counts as a downstream failure for the circuit
    /// breaker. Admission rejections never trip the breaker.
    pub fn is_outbound_failure(&self) -> bool {
        matches!(
            self,
            Error::SpawnFailed { .. } | Error::ChildExitedNonZero { .. }
        )
    }
}

/// Result type alias for DashCrew Core
pub type Result<T> = std::result::Result<T, Error>;
