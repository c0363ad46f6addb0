//! Rollback callbacks for partially-completed operations.
//!
//! Each operation id owns an ordered list of compensation steps. On
//! [`CompensationRegistry::compensate`] the steps run in strict reverse
//! registration order (LIFO); a failing step is logged and does not stop the
//! remaining steps. Steps are expected to be idempotent by contract of their
//! registrants; the registry performs no deduplication.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Async rollback callback. Receives the args captured at registration.
pub type CompensationFn =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

struct CompensationStep {
    label: String,
    callback: CompensationFn,
    args: serde_json::Value,
}

/// Outcome of running an operation's compensation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationOutcome {
    /// Steps that completed successfully.
    pub succeeded: usize,
    /// Steps that returned an error.
    pub failed: usize,
}

impl CompensationOutcome {
    /// True iff every registered step succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Per-operation LIFO rollback registry.
#[derive(Default)]
pub struct CompensationRegistry {
    records: Mutex<HashMap<String, Vec<CompensationStep>>>,
}

impl CompensationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a compensation step for `operation_id`.
    pub async fn register(
        &self,
        operation_id: impl Into<String>,
        label: impl Into<String>,
        callback: CompensationFn,
        args: serde_json::Value,
    ) {
        let mut records = self.records.lock().await;
        records
            .entry(operation_id.into())
            .or_default()
            .push(CompensationStep {
                label: label.into(),
                callback,
                args,
            });
    }

    /// Number of steps currently registered for `operation_id`.
    pub async fn pending_steps(&self, operation_id: &str) -> usize {
        self.records
            .lock()
            .await
            .get(operation_id)
            .map_or(0, Vec::len)
    }

    /// Run all compensation steps for `operation_id` in LIFO order.
    ///
    /// Each step runs regardless of earlier failures. The record is removed
    /// whether or not every step succeeded; an unknown operation id yields a
    /// zero outcome.
    pub async fn compensate(&self, operation_id: &str) -> CompensationOutcome {
        let steps = self.records.lock().await.remove(operation_id);
        let Some(steps) = steps else {
            return CompensationOutcome {
                succeeded: 0,
                failed: 0,
            };
        };

        let mut outcome = CompensationOutcome {
            succeeded: 0,
            failed: 0,
        };
        for step in steps.into_iter().rev() {
            match (step.callback)(step.args.clone()).await {
                Ok(()) => {
                    info!(
                        operation_id,
                        step = %step.label,
                        "compensation step succeeded"
                    );
                    outcome.succeeded += 1;
                }
                Err(reason) => {
                    warn!(
                        operation_id,
                        step = %step.label,
                        reason = %reason,
                        "compensation step failed"
                    );
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }
}
