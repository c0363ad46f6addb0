//! Low-level child process spawning.
//!
//! This module builds the `tokio::process::Command` for agent children with
//! proper stdio wiring and, on Unix, a dedicated process group so the whole
//! child tree can be terminated together. On Linux children additionally
//! request SIGTERM when the orchestrator dies, so agent processes never
//! outlive the server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::trace;

/// Policy for how to handle stdio streams of spawned processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioPolicy {
    /// Null stdin, piped stdout/stderr for capture. The default: agent output
    /// is always streamed back into task results.
    #[default]
    RedirectForCapture,
    /// Inherit stdio from the orchestrator (diagnostics only).
    Inherit,
}

/// Options for spawning a child process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// The program to execute
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Working directory for the process
    pub cwd: PathBuf,
    /// Extra environment variables layered over the inherited environment
    pub env: HashMap<String, String>,
    /// How to handle stdio
    pub stdio_policy: StdioPolicy,
}

impl SpawnOptions {
    /// Create new spawn options with the required fields.
    pub fn new(program: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            stdio_policy: StdioPolicy::default(),
        }
    }

    /// Set the command-line arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add a single environment variable.
    pub fn env_insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the stdio policy.
    pub fn stdio_policy(mut self, policy: StdioPolicy) -> Self {
        self.stdio_policy = policy;
        self
    }
}

/// Spawn a child process with the given options.
///
/// The child inherits the orchestrator's environment (agents need PATH and
/// their own credentials) with `options.env` layered on top. On Unix the
/// child is placed in a new process group; on Linux it additionally receives
/// SIGTERM if the parent dies.
///
/// # Errors
///
/// Returns an error if the process cannot be spawned (missing executable,
/// permission denied, invalid cwd).
pub fn spawn_child(options: SpawnOptions) -> std::io::Result<Child> {
    trace!(
        "spawn_child: {:?} {:?} cwd={:?} stdio={:?}",
        options.program,
        options.args,
        options.cwd,
        options.stdio_policy
    );

    let mut cmd = Command::new(&options.program);
    cmd.args(&options.args);
    cmd.current_dir(&options.cwd);
    cmd.envs(&options.env);

    #[cfg(unix)]
    {
        #[cfg(target_os = "linux")]
        let parent_pid = unsafe { libc::getpid() };

        unsafe {
            cmd.pre_exec(move || {
                // Create new process group for clean termination
                if libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                // Linux-only: signal child when parent dies
                #[cfg(target_os = "linux")]
                {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    // Handle race: if parent already died, exit now
                    if libc::getppid() != parent_pid {
                        libc::raise(libc::SIGTERM);
                    }
                }
                Ok(())
            });
        }
    }

    match options.stdio_policy {
        StdioPolicy::RedirectForCapture => {
            // Null stdin so agents never hang waiting for interactive input.
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
        StdioPolicy::Inherit => {
            cmd.stdin(Stdio::inherit());
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
    }

    // Kill child when the handle is dropped
    cmd.kill_on_drop(true);

    cmd.spawn()
}
