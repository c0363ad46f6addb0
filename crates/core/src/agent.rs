//! Agent adapters and the routing policy.
//!
//! Each supported coding assistant is a variant of [`AgentKind`] fulfilling
//! the adapter capability set: `resolve_command` renders a task into the
//! agent's command-line convention and `classify_exit` decides whether a
//! finished child counts as success. Routing maps a task type to an ordered
//! preference list; the first agent whose binary is on PATH wins.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::supervisor::{CommandSpec, RunOutput};

/// How many trailing characters of child output to keep in error details.
const EXIT_DETAIL_MAX_CHARS: usize = 500;

/// A known coding-assistant adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Anthropic Claude Code CLI (`claude -p <prompt>`).
    Claude,
    /// OpenAI Codex CLI (`codex exec <prompt>`).
    Codex,
    /// Google Gemini CLI (`gemini -p <prompt>`).
    Gemini,
    /// Aider (`aider --message <prompt>`).
    Aider,
    /// Test agent that echoes the task description and succeeds.
    NoopEcho,
    /// Test agent that sleeps for the number of seconds in the description.
    NoopSleep,
    /// Test agent that always exits non-zero.
    NoopFail,
}

impl AgentKind {
    /// All known agents, in catalog order.
    pub const ALL: [AgentKind; 7] = [
        AgentKind::Claude,
        AgentKind::Codex,
        AgentKind::Gemini,
        AgentKind::Aider,
        AgentKind::NoopEcho,
        AgentKind::NoopSleep,
        AgentKind::NoopFail,
    ];

    /// Stable agent name (also the rate-limit and circuit scope).
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
            AgentKind::Aider => "aider",
            AgentKind::NoopEcho => "noop-echo",
            AgentKind::NoopSleep => "noop-sleep",
            AgentKind::NoopFail => "noop-fail",
        }
    }

    /// Look up an agent by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }

    /// The executable this agent needs on PATH.
    pub fn binary(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
            AgentKind::Aider => "aider",
            AgentKind::NoopEcho => "echo",
            AgentKind::NoopSleep => "sleep",
            AgentKind::NoopFail => "false",
        }
    }

    /// Whether the agent's binary is installed in this environment.
    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Render a task into this agent's command-line convention.
    ///
    /// Context entries are appended to the prompt as `key: value` lines; the
    /// test agents receive only the bare description.
    pub fn resolve_command(
        &self,
        description: &str,
        context: &serde_json::Map<String, serde_json::Value>,
        cwd: &Path,
    ) -> CommandSpec {
        let prompt = render_prompt(description, context);
        let spec = CommandSpec::new(self.binary(), cwd);
        match self {
            AgentKind::Claude => spec.args(["-p", &prompt]),
            AgentKind::Codex => spec.args(["exec", &prompt]),
            AgentKind::Gemini => spec.args(["-p", &prompt]),
            AgentKind::Aider => spec.args(["--message", &prompt]),
            AgentKind::NoopEcho => spec.args([description]),
            AgentKind::NoopSleep => spec.args([description]),
            AgentKind::NoopFail => spec,
        }
    }

    /// Classify a finished child run.
    ///
    /// Exit code zero is success; anything else (including a timeout or kill
    /// escalation) is [`Error::ChildExitedNonZero`] with a bounded tail of
    /// the child's output as detail.
    pub fn classify_exit(&self, output: &RunOutput) -> Result<()> {
        if output.exit_code == 0 {
            return Ok(());
        }
        let detail = if output.stderr.trim().is_empty() {
            tail(&output.stdout)
        } else {
            tail(&output.stderr)
        };
        Err(Error::ChildExitedNonZero {
            code: output.exit_code,
            detail,
        })
    }
}

fn render_prompt(description: &str, context: &serde_json::Map<String, serde_json::Value>) -> String {
    if context.is_empty() {
        return description.to_string();
    }
    let mut prompt = String::from(description);
    prompt.push_str("\n\nContext:\n");
    for (key, value) in context {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        prompt.push_str(&format!("{key}: {rendered}\n"));
    }
    prompt
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= EXIT_DETAIL_MAX_CHARS {
        return trimmed.to_string();
    }
    let skip = trimmed.chars().count() - EXIT_DETAIL_MAX_CHARS;
    trimmed.chars().skip(skip).collect()
}

/// Routing table from task type to an ordered agent preference list.
pub struct AgentCatalog {
    routes: HashMap<String, Vec<AgentKind>>,
    fallback: Vec<AgentKind>,
}

impl Default for AgentCatalog {
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            "code_generation".to_string(),
            vec![AgentKind::Claude, AgentKind::Codex, AgentKind::Aider],
        );
        routes.insert(
            "research".to_string(),
            vec![AgentKind::Claude, AgentKind::Gemini],
        );
        routes.insert(
            "design".to_string(),
            vec![AgentKind::Claude, AgentKind::Gemini],
        );
        routes.insert(
            "review".to_string(),
            vec![AgentKind::Claude, AgentKind::Gemini],
        );
        routes.insert(
            "test".to_string(),
            vec![AgentKind::Codex, AgentKind::Claude],
        );
        Self {
            routes,
            fallback: vec![AgentKind::Claude, AgentKind::Codex],
        }
    }
}

impl AgentCatalog {
    /// Catalog with the built-in routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the preference list for one task type.
    pub fn set_route(&mut self, task_type: impl Into<String>, agents: Vec<AgentKind>) {
        self.routes.insert(task_type.into(), agents);
    }

    /// Pick the agent for a task.
    ///
    /// A recognized `preferred` name short-circuits routing (spawn failures
    /// will be classified downstream if its binary is missing). Otherwise
    /// the task type's preference list is consulted and the first available
    /// agent wins; an unknown type uses the fallback list.
    pub fn resolve(&self, task_type: &str, preferred: Option<&str>) -> Result<AgentKind> {
        if let Some(name) = preferred {
            if let Some(kind) = AgentKind::from_name(name) {
                return Ok(kind);
            }
        }

        let candidates = self.routes.get(task_type).unwrap_or(&self.fallback);
        candidates
            .iter()
            .copied()
            .find(AgentKind::is_available)
            .ok_or_else(|| Error::NoAgentAvailable(task_type.to_string()))
    }
}
