//! Child-process supervision: parallel spawning, output streaming, health
//! sampling, and cross-platform termination.
//!
//! The supervisor owns a handle for every live child until it exits or is
//! killed. Output is surfaced as a finite stream of tagged lines (stdout and
//! stderr merged in arrival order); termination is graceful first (SIGTERM to
//! the child's process group on Unix), escalating to a forced kill after a
//! bounded grace period.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::spawn::{spawn_child, SpawnOptions};

/// Grace period between the termination request and the forced kill.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Exit code reported when a child was killed before producing one.
const KILLED_EXIT_CODE: i32 = -9;

/// A command to run as an agent child process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program name or path (resolved against PATH).
    pub program: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    /// Create a spec with the required fields.
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
        }
    }

    /// Set the command-line arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// One-line rendering for logs.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn to_spawn_options(&self) -> SpawnOptions {
        let mut options = SpawnOptions::new(&self.program, &self.cwd);
        options.args = self.args.clone();
        options.env = self.env.clone();
        options
    }
}

/// Which stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One line of child output with its source tag.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitKind {
    /// Exit code (or a synthetic code when killed by signal).
    pub exit_code: i32,
    /// Whether the forced-kill escalation was needed.
    pub forced: bool,
}

/// Handle to a streaming child: the pid and a finite, non-restartable
/// sequence of output lines that ends when the process exits.
pub struct StreamingChild {
    pub pid: u32,
    pub lines: async_channel::Receiver<OutputLine>,
}

/// Per-command outcome of a parallel spawn.
pub struct SpawnOutcome {
    /// The command's position in the request.
    pub index: usize,
    /// Pid when the spawn succeeded.
    pub pid: Option<u32>,
    /// Classified error when it did not.
    pub error: Option<String>,
    /// Output stream for a successfully spawned child.
    pub lines: Option<async_channel::Receiver<OutputLine>>,
}

/// Collected output of a supervised run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// stdout and stderr merged in arrival order.
    pub merged: Vec<OutputLine>,
    pub duration: Duration,
    /// True when the run ended because of cancellation.
    pub cancelled: bool,
}

impl RunOutput {
    /// Whether the child exited cleanly.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }
}

/// Health snapshot for one child.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub alive: bool,
    pub cpu_pct: f32,
    pub rss_bytes: u64,
    pub status: String,
}

/// Result of a kill request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KillReport {
    /// Whether the process is confirmed terminated.
    pub terminated: bool,
    /// "graceful" or "forced".
    pub method: String,
}

#[derive(Clone)]
struct ChildEntry {
    cancel: CancellationToken,
    exited: watch::Receiver<Option<ExitKind>>,
}

/// Supervisor owning handles to all live agent children.
pub struct ProcessSupervisor {
    children: Mutex<HashMap<u32, ChildEntry>>,
    grace: Duration,
    spawned_total: AtomicU64,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(KILL_GRACE_PERIOD)
    }
}

impl ProcessSupervisor {
    /// Create a supervisor with the given kill grace period.
    pub fn new(grace: Duration) -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            grace,
            spawned_total: AtomicU64::new(0),
        }
    }

    /// Total children ever spawned (success only).
    pub fn spawned_total(&self) -> u64 {
        self.spawned_total.load(Ordering::Relaxed)
    }

    /// Pids of currently live children.
    pub fn live_pids(&self) -> Vec<u32> {
        self.children
            .lock()
            .map(|children| children.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Run a command to completion, collecting its output.
    ///
    /// Suspends until the child exits or `cancel` fires; cancellation
    /// terminates the child (gracefully, then forced after the grace period)
    /// before returning. Spawn failures are classified as
    /// [`Error::SpawnFailed`]; a non-zero exit is returned in the output, not
    /// as an error, so the caller can apply its own exit classification.
    pub async fn run(&self, spec: &CommandSpec, cancel: CancellationToken) -> Result<RunOutput> {
        let start = Instant::now();
        let mut child = spawn_child(spec.to_spawn_options()).map_err(|e| Error::SpawnFailed {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or_default();
        self.spawned_total.fetch_add(1, Ordering::Relaxed);
        debug!(pid, command = %spec.display_line(), "spawned agent child");

        let (line_tx, line_rx) = async_channel::unbounded::<OutputLine>();
        spawn_line_readers(&mut child, line_tx)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        self.register(pid, cancel.clone(), exit_rx);

        let (exit, cancelled) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (ExitKind { exit_code: exit_code_of(status), forced: false }, false),
                Err(e) => {
                    warn!(pid, error = %e, "wait on child failed");
                    (ExitKind { exit_code: KILLED_EXIT_CODE, forced: false }, false)
                }
            },
            _ = cancel.cancelled() => {
                let exit = self.terminate(pid, &mut child).await;
                (exit, true)
            }
        };

        // Readers drop their sender at EOF, closing the channel.
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut merged = Vec::new();
        while let Ok(line) = line_rx.recv().await {
            match line.source {
                OutputSource::Stdout => {
                    stdout.push_str(&line.text);
                    stdout.push('\n');
                }
                OutputSource::Stderr => {
                    stderr.push_str(&line.text);
                    stderr.push('\n');
                }
            }
            merged.push(line);
        }

        let _ = exit_tx.send(Some(exit));
        self.unregister(pid);

        Ok(RunOutput {
            exit_code: exit.exit_code,
            stdout,
            stderr,
            merged,
            duration: start.elapsed(),
            cancelled,
        })
    }

    /// Spawn a command and return its merged output stream.
    ///
    /// The returned stream is a finite, non-restartable sequence of tagged
    /// lines that terminates when the process exits. The child stays
    /// registered with the supervisor until then.
    pub async fn spawn_streaming(self: &std::sync::Arc<Self>, spec: &CommandSpec) -> Result<StreamingChild> {
        let mut child = spawn_child(spec.to_spawn_options()).map_err(|e| Error::SpawnFailed {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or_default();
        self.spawned_total.fetch_add(1, Ordering::Relaxed);

        let (line_tx, line_rx) = async_channel::unbounded::<OutputLine>();
        spawn_line_readers(&mut child, line_tx)?;

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        self.register(pid, cancel.clone(), exit_rx);

        let supervisor = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => ExitKind { exit_code: exit_code_of(status), forced: false },
                    Err(e) => {
                        warn!(pid, error = %e, "wait on streaming child failed");
                        ExitKind { exit_code: KILLED_EXIT_CODE, forced: false }
                    }
                },
                _ = cancel.cancelled() => supervisor.terminate(pid, &mut child).await,
            };
            let _ = exit_tx.send(Some(exit));
            supervisor.unregister(pid);
        });

        Ok(StreamingChild { pid, lines: line_rx })
    }

    /// Spawn several commands in parallel.
    ///
    /// All spawns are launched concurrently and are independent: a failure
    /// yields a per-command error without affecting its siblings.
    pub async fn spawn_parallel(
        self: &std::sync::Arc<Self>,
        specs: &[CommandSpec],
    ) -> Vec<SpawnOutcome> {
        let launches = specs.iter().enumerate().map(|(index, spec)| {
            let supervisor = std::sync::Arc::clone(self);
            async move {
                match supervisor.spawn_streaming(spec).await {
                    Ok(streaming) => SpawnOutcome {
                        index,
                        pid: Some(streaming.pid),
                        error: None,
                        lines: Some(streaming.lines),
                    },
                    Err(e) => SpawnOutcome {
                        index,
                        pid: None,
                        error: Some(e.to_string()),
                        lines: None,
                    },
                }
            }
        });
        futures::future::join_all(launches).await
    }

    /// Sample CPU and memory for a child.
    ///
    /// Never blocks on the child itself; the CPU figure requires two samples
    /// a short interval apart.
    pub async fn health(&self, pid: u32) -> HealthSnapshot {
        let alive = {
            let children = self.children.lock().ok();
            children.is_some_and(|c| {
                c.get(&pid)
                    .is_some_and(|entry| entry.exited.borrow().is_none())
            })
        };

        let sys_pid = sysinfo::Pid::from_u32(pid);
        let mut sys = sysinfo::System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);

        match sys.process(sys_pid) {
            Some(process) => HealthSnapshot {
                pid,
                alive,
                cpu_pct: process.cpu_usage(),
                rss_bytes: process.memory(),
                status: process.status().to_string(),
            },
            None => HealthSnapshot {
                pid,
                alive: false,
                cpu_pct: 0.0,
                rss_bytes: 0,
                status: "exited".to_string(),
            },
        }
    }

    /// Terminate a supervised child: graceful first, forced after the grace
    /// period. Returns whether termination was confirmed and which method
    /// ended the process.
    pub async fn kill(&self, pid: u32) -> Result<KillReport> {
        let entry = {
            let children = self
                .children
                .lock()
                .map_err(|_| Error::KillFailed {
                    pid,
                    reason: "supervisor child table poisoned".to_string(),
                })?;
            children.get(&pid).cloned()
        };
        let Some(entry) = entry else {
            return Err(Error::NotFound(format!("no supervised process {pid}")));
        };

        entry.cancel.cancel();

        let mut exited = entry.exited.clone();
        let deadline = self.grace + Duration::from_secs(2);
        let confirmed = tokio::time::timeout(deadline, async {
            loop {
                if let Some(exit) = *exited.borrow() {
                    return exit;
                }
                if exited.changed().await.is_err() {
                    return ExitKind {
                        exit_code: KILLED_EXIT_CODE,
                        forced: true,
                    };
                }
            }
        })
        .await;

        match confirmed {
            Ok(exit) => Ok(KillReport {
                terminated: true,
                method: if exit.forced { "forced" } else { "graceful" }.to_string(),
            }),
            Err(_) => Err(Error::KillFailed {
                pid,
                reason: format!(
                    "process did not terminate within {:?} of forced kill",
                    deadline
                ),
            }),
        }
    }

    async fn terminate(&self, pid: u32, child: &mut tokio::process::Child) -> ExitKind {
        #[cfg(unix)]
        if pid != 0 {
            // The child leads its own process group; signal the whole group.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => ExitKind {
                exit_code: exit_code_of(status),
                forced: false,
            },
            _ => {
                warn!(pid, "graceful termination timed out; escalating to kill");
                #[cfg(unix)]
                if pid != 0 {
                    unsafe {
                        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                    }
                }
                let _ = child.start_kill();
                let exit_code = match child.wait().await {
                    Ok(status) => exit_code_of(status),
                    Err(_) => KILLED_EXIT_CODE,
                };
                ExitKind {
                    exit_code,
                    forced: true,
                }
            }
        }
    }

    fn register(&self, pid: u32, cancel: CancellationToken, exited: watch::Receiver<Option<ExitKind>>) {
        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, ChildEntry { cancel, exited });
        }
    }

    fn unregister(&self, pid: u32) {
        if let Ok(mut children) = self.children.lock() {
            children.remove(&pid);
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn spawn_line_readers(
    child: &mut tokio::process::Child,
    line_tx: async_channel::Sender<OutputLine>,
) -> Result<()> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Io(std::io::Error::other("stdout pipe not available")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Io(std::io::Error::other("stderr pipe not available")))?;

    let stdout_tx = line_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if stdout_tx
                .send(OutputLine {
                    source: OutputSource::Stdout,
                    text,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(text)) = lines.next_line().await {
            if line_tx
                .send(OutputLine {
                    source: OutputSource::Stderr,
                    text,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });
    Ok(())
}
