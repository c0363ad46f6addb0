//! Dead-letter queue: a persistent, at-least-once retry buffer.
//!
//! Failed operations are parked here with their original context and retried
//! on an exponential backoff schedule until they succeed or exhaust
//! `max_attempts`, at which point they are marked ABANDONED and kept for
//! operator inspection. Every state change flushes the whole queue to a
//! single JSON file; on startup entries caught mid-retry (RETRYING) are
//! promoted back to PENDING.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Default maximum retry attempts per entry.
pub const DEFAULT_DLQ_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_DLQ_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Default cap for exponential backoff.
pub const DEFAULT_DLQ_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Status of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DlqStatus {
    /// Waiting for its next attempt.
    Pending,
    /// A retry is currently in flight.
    Retrying,
    /// Attempts exhausted; kept for inspection until explicitly removed.
    Abandoned,
}

/// One parked operation awaiting retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Identifier of the failed operation (typically a task id).
    pub operation_id: String,
    /// Retry-handler routing key.
    pub operation_type: String,
    /// Original operation context, replayed to the retry handler.
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Error text from the original failure.
    pub error: String,
    /// Attempts performed so far.
    pub attempt: u32,
    /// Attempts allowed before abandoning.
    pub max_attempts: u32,
    /// When the next attempt becomes due.
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub status: DlqStatus,
}

/// Retry behavior configuration.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Base delay; attempt `k` waits `base * 2^(k-1)`.
    pub base_backoff: Duration,
    /// Cap applied to the computed delay.
    pub max_backoff: Duration,
    /// Attempts allowed per entry.
    pub max_attempts: u32,
    /// Apply ±25% uniform jitter to computed delays.
    pub jitter: bool,
    /// Persistence file. `None` keeps the queue in memory only.
    pub path: Option<PathBuf>,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            base_backoff: DEFAULT_DLQ_BASE_BACKOFF,
            max_backoff: DEFAULT_DLQ_MAX_BACKOFF,
            max_attempts: DEFAULT_DLQ_MAX_ATTEMPTS,
            jitter: false,
            path: None,
        }
    }
}

/// Counts by status plus the age of the oldest pending entry.
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub pending: usize,
    pub retrying: usize,
    pub abandoned: usize,
    pub oldest_pending_age_seconds: Option<i64>,
}

/// Async retry callback, registered per operation type.
pub type RetryHandler =
    Arc<dyn Fn(DlqEntry) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

#[derive(Serialize, Deserialize, Default)]
struct PersistedQueue {
    entries: Vec<DlqEntry>,
}

/// Persistent retry buffer with exponential-backoff auto-retry.
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DlqEntry>>,
    handlers: Mutex<HashMap<String, RetryHandler>>,
    config: DlqConfig,
    auto_retry: Mutex<Option<CancellationToken>>,
}

impl DeadLetterQueue {
    /// Create an empty queue.
    pub fn new(config: DlqConfig) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            config,
            auto_retry: Mutex::new(None),
        }
    }

    /// Create a queue and load prior state from the configured file.
    ///
    /// Entries found in RETRYING are promoted back to PENDING (the retry was
    /// interrupted by a crash). A malformed file is renamed aside as
    /// `<name>.corrupt-<timestamp>` and treated as empty.
    pub async fn load(config: DlqConfig) -> Result<Self> {
        let queue = Self::new(config);
        let Some(path) = queue.config.path.clone() else {
            return Ok(queue);
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedQueue>(&bytes) {
                Ok(persisted) => {
                    let mut entries = queue.entries.lock().await;
                    *entries = persisted.entries;
                    let mut promoted = 0usize;
                    for entry in entries.iter_mut() {
                        if entry.status == DlqStatus::Retrying {
                            entry.status = DlqStatus::Pending;
                            promoted += 1;
                        }
                    }
                    if promoted > 0 {
                        info!(promoted, "promoted interrupted DLQ retries back to pending");
                    }
                    drop(entries);
                }
                Err(e) => {
                    let corrupt = path.with_extension(format!(
                        "corrupt-{}",
                        Utc::now().format("%Y%m%dT%H%M%S")
                    ));
                    warn!(
                        path = %path.display(),
                        corrupt = %corrupt.display(),
                        error = %e,
                        "DLQ file malformed; renaming aside and starting empty"
                    );
                    tokio::fs::rename(&path, &corrupt).await?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        Ok(queue)
    }

    /// Register the retry callback for an operation type.
    pub async fn register_handler(&self, operation_type: impl Into<String>, handler: RetryHandler) {
        self.handlers
            .lock()
            .await
            .insert(operation_type.into(), handler);
    }

    /// Park a failed operation for retry.
    ///
    /// The entry starts PENDING with attempt 0 and becomes due after the base
    /// backoff delay.
    pub async fn add(
        &self,
        operation_id: impl Into<String>,
        operation_type: impl Into<String>,
        context: serde_json::Map<String, serde_json::Value>,
        error_text: impl Into<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let entry = DlqEntry {
            operation_id: operation_id.into(),
            operation_type: operation_type.into(),
            context,
            error: error_text.into(),
            attempt: 0,
            max_attempts: self.config.max_attempts,
            next_attempt_at: now + self.backoff_for_attempt(1),
            created_at: now,
            last_attempt_at: None,
            status: DlqStatus::Pending,
        };

        let mut entries = self.entries.lock().await;
        info!(
            operation_id = %entry.operation_id,
            operation_type = %entry.operation_type,
            next_attempt_at = %entry.next_attempt_at,
            "parked operation in dead-letter queue"
        );
        entries.push(entry);
        self.flush_locked(&entries).await
    }

    /// Run one retry sweep over entries due at `now`.
    ///
    /// Due entries are processed oldest-due-first (insertion order breaks
    /// ties). Returns the number of entries whose retry succeeded.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<usize> {
        // Select and mark under the lock; run handlers outside it.
        let due: Vec<DlqEntry> = {
            let mut entries = self.entries.lock().await;
            let mut due = Vec::new();
            for entry in entries.iter_mut() {
                if entry.status == DlqStatus::Pending && entry.next_attempt_at <= now {
                    entry.status = DlqStatus::Retrying;
                    due.push(entry.clone());
                }
            }
            if !due.is_empty() {
                due.sort_by_key(|e| e.next_attempt_at);
                self.flush_locked(&entries).await?;
            }
            due
        };

        if due.is_empty() {
            return Ok(0);
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for entry in due {
            let handler = self
                .handlers
                .lock()
                .await
                .get(&entry.operation_type)
                .cloned();
            let outcome = match handler {
                Some(handler) => handler(entry.clone()).await,
                None => Err(format!(
                    "no retry handler registered for operation type '{}'",
                    entry.operation_type
                )),
            };
            match outcome {
                Ok(()) => {
                    info!(operation_id = %entry.operation_id, "DLQ retry succeeded");
                    succeeded.push(entry.operation_id.clone());
                }
                Err(reason) => {
                    warn!(
                        operation_id = %entry.operation_id,
                        attempt = entry.attempt + 1,
                        reason = %reason,
                        "DLQ retry failed"
                    );
                    failed.push((entry.operation_id.clone(), reason));
                }
            }
        }

        let retried_ok = succeeded.len();
        let mut entries = self.entries.lock().await;
        // Successful retries are removed entirely.
        entries.retain(|e| !succeeded.contains(&e.operation_id));
        for (operation_id, reason) in failed {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.operation_id == operation_id && e.status == DlqStatus::Retrying)
            {
                entry.attempt += 1;
                entry.last_attempt_at = Some(now);
                entry.error = reason;
                if entry.attempt >= entry.max_attempts {
                    entry.status = DlqStatus::Abandoned;
                    error!(
                        operation_id = %entry.operation_id,
                        attempts = entry.attempt,
                        "DLQ entry abandoned after exhausting retries"
                    );
                } else {
                    entry.status = DlqStatus::Pending;
                    entry.next_attempt_at = now + self.backoff_for_attempt(entry.attempt + 1);
                }
            }
        }
        self.flush_locked(&entries).await?;
        Ok(retried_ok)
    }

    /// Counts by status and oldest pending age.
    pub async fn get_stats(&self) -> DlqStats {
        let entries = self.entries.lock().await;
        let now = Utc::now();
        let mut stats = DlqStats {
            pending: 0,
            retrying: 0,
            abandoned: 0,
            oldest_pending_age_seconds: None,
        };
        for entry in entries.iter() {
            match entry.status {
                DlqStatus::Pending => {
                    stats.pending += 1;
                    let age = (now - entry.created_at).num_seconds();
                    stats.oldest_pending_age_seconds = Some(
                        stats
                            .oldest_pending_age_seconds
                            .map_or(age, |prev| prev.max(age)),
                    );
                }
                DlqStatus::Retrying => stats.retrying += 1,
                DlqStatus::Abandoned => stats.abandoned += 1,
            }
        }
        stats
    }

    /// All entries, for inspection.
    pub async fn entries(&self) -> Vec<DlqEntry> {
        self.entries.lock().await.clone()
    }

    /// Remove an abandoned entry after operator inspection.
    pub async fn remove_abandoned(&self, operation_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| !(e.operation_id == operation_id && e.status == DlqStatus::Abandoned));
        if entries.len() == before {
            return Err(Error::NotFound(format!(
                "no abandoned DLQ entry for operation '{operation_id}'"
            )));
        }
        self.flush_locked(&entries).await
    }

    /// Start the background auto-retry worker.
    ///
    /// Sweeps due entries every `interval` until [`DeadLetterQueue::stop_auto_retry`]
    /// is called. Starting twice replaces the previous worker.
    pub async fn start_auto_retry(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        {
            let mut guard = self.auto_retry.lock().await;
            if let Some(prev) = guard.replace(token.clone()) {
                prev.cancel();
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = queue.process_due(Utc::now()).await {
                            error!(error = %e, "DLQ sweep failed");
                        }
                    }
                }
            }
            info!("DLQ auto-retry worker stopped");
        });
    }

    /// Stop the background auto-retry worker, if running.
    pub async fn stop_auto_retry(&self) {
        if let Some(token) = self.auto_retry.lock().await.take() {
            token.cancel();
        }
    }

    /// Flush the queue to its persistence file (no-op when unconfigured).
    pub async fn flush(&self) -> Result<()> {
        let entries = self.entries.lock().await;
        self.flush_locked(&entries).await
    }

    /// Delay before attempt number `attempt` (1-indexed): `base * 2^(attempt-1)`
    /// capped at `max_backoff`, with optional ±25% jitter.
    fn backoff_for_attempt(&self, attempt: u32) -> chrono::Duration {
        let exp = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let base_ms = self.config.base_backoff.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(exp)
            .min(self.config.max_backoff.as_millis() as u64);
        let delay_ms = if self.config.jitter {
            let factor: f64 = 0.75 + rand::random::<f64>() * 0.5;
            (delay_ms as f64 * factor) as u64
        } else {
            delay_ms
        };
        chrono::Duration::milliseconds(delay_ms as i64)
    }

    async fn flush_locked(&self, entries: &[DlqEntry]) -> Result<()> {
        let Some(path) = &self.config.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let persisted = PersistedQueue {
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&persisted)?;
        // Write-then-rename so a crash mid-flush never truncates the file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
