//! Graceful shutdown coordination.
//!
//! The coordinator owns the process-wide shutting-down flag, the in-flight
//! request set tracked at the dispatcher boundary, and the ordered cleanup
//! callbacks. On trigger (signal or explicit request) it stops admission,
//! drains tracked requests up to `request_timeout`, then runs cleanups in
//! registration order, each bounded by `cleanup_timeout`; cleanup failures
//! are logged and never halt the sequence.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Cheap cloneable view of the shutting-down flag.
///
/// Queried by the queue and the dispatcher on every entry; reads are a single
/// relaxed atomic load.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the process as shutting down.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has begun.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Async cleanup callback, run once during shutdown.
pub type CleanupFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Bound on the in-flight request drain.
    pub request_timeout: Duration,
    /// Bound on each cleanup callback.
    pub cleanup_timeout: Duration,
    /// Continue with cleanup when the drain times out.
    pub force_after_timeout: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(10),
            force_after_timeout: true,
        }
    }
}

/// What the shutdown sequence accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every tracked request finished within `request_timeout`.
    pub drained: bool,
    /// Cleanup callbacks that completed successfully.
    pub cleanups_succeeded: usize,
    /// Cleanup callbacks that failed or timed out.
    pub cleanups_failed: usize,
}

/// Signal-driven coordinator for draining and ordered cleanup.
pub struct ShutdownCoordinator {
    flag: ShutdownFlag,
    config: ShutdownConfig,
    in_flight: Mutex<HashSet<String>>,
    in_flight_count: watch::Sender<usize>,
    cleanups: Mutex<Vec<(String, CleanupFn)>>,
    triggered: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator sharing `flag` with the rest of the system.
    pub fn new(config: ShutdownConfig, flag: ShutdownFlag) -> Arc<Self> {
        let (in_flight_count, _) = watch::channel(0);
        Arc::new(Self {
            flag,
            config,
            in_flight: Mutex::new(HashSet::new()),
            in_flight_count,
            cleanups: Mutex::new(Vec::new()),
            triggered: CancellationToken::new(),
        })
    }

    /// The shared shutting-down flag.
    pub fn flag(&self) -> ShutdownFlag {
        self.flag.clone()
    }

    /// Request shutdown (the non-signal entry point).
    pub fn trigger(&self) {
        info!("shutdown requested");
        self.triggered.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.triggered.is_cancelled()
    }

    /// Suspend until shutdown is requested.
    pub async fn wait_for_trigger(&self) {
        self.triggered.cancelled().await;
    }

    /// Listen for the platform's graceful-terminate signal and the
    /// interactive interrupt; either one triggers shutdown.
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut terminate = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received interrupt"),
                    _ = terminate.recv() => info!("received terminate signal"),
                }
            }
            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to wait for ctrl-c");
                    return;
                }
                info!("received interrupt");
            }
            coordinator.trigger();
        });
    }

    /// Begin tracking a request.
    ///
    /// Refused with [`Error::ShuttingDown`] once drain has begun; accepted
    /// requests must be paired with [`ShutdownCoordinator::track_end`].
    pub async fn track_begin(&self, correlation_id: &str) -> Result<()> {
        if self.flag.is_set() {
            return Err(Error::ShuttingDown);
        }
        let mut in_flight = self.in_flight.lock().await;
        in_flight.insert(correlation_id.to_string());
        let _ = self.in_flight_count.send(in_flight.len());
        Ok(())
    }

    /// Finish tracking a request.
    pub async fn track_end(&self, correlation_id: &str) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(correlation_id);
        let _ = self.in_flight_count.send(in_flight.len());
    }

    /// Requests currently tracked.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Register a cleanup callback; callbacks run in registration order.
    pub async fn register_cleanup(&self, label: impl Into<String>, cleanup: CleanupFn) {
        self.cleanups.lock().await.push((label.into(), cleanup));
    }

    /// Run the shutdown sequence:
    ///
    /// 1. set the shutting-down flag (admission stops),
    /// 2. wait for tracked requests up to `request_timeout`,
    /// 3. run cleanups in order, each bounded by `cleanup_timeout`.
    ///
    /// With `force_after_timeout` (the default) an incomplete drain proceeds
    /// to cleanup anyway; otherwise the sequence still proceeds but the
    /// report marks the drain as failed.
    pub async fn run(&self) -> ShutdownReport {
        self.flag.set();
        info!("shutdown: draining in-flight requests");

        let mut drained = self.drain().await;
        if !drained {
            warn!(
                timeout_s = self.config.request_timeout.as_secs_f64(),
                remaining = self.in_flight_count().await,
                force = self.config.force_after_timeout,
                "shutdown drain timed out"
            );
            if !self.config.force_after_timeout {
                // Operator opted out of forcing: keep waiting for the
                // remaining requests before touching cleanup.
                while !self.drain().await {}
                drained = true;
            }
        }

        let cleanups: Vec<(String, CleanupFn)> = {
            let mut registered = self.cleanups.lock().await;
            registered.drain(..).collect()
        };

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for (label, cleanup) in cleanups {
            match tokio::time::timeout(self.config.cleanup_timeout, cleanup()).await {
                Ok(Ok(())) => {
                    info!(cleanup = %label, "cleanup finished");
                    succeeded += 1;
                }
                Ok(Err(reason)) => {
                    error!(cleanup = %label, reason = %reason, "cleanup failed");
                    failed += 1;
                }
                Err(_) => {
                    error!(
                        cleanup = %label,
                        timeout_s = self.config.cleanup_timeout.as_secs_f64(),
                        "cleanup timed out"
                    );
                    failed += 1;
                }
            }
        }

        info!(drained, succeeded, failed, "shutdown sequence complete");
        ShutdownReport {
            drained,
            cleanups_succeeded: succeeded,
            cleanups_failed: failed,
        }
    }

    async fn drain(&self) -> bool {
        let mut count_rx = self.in_flight_count.subscribe();
        let wait = async {
            loop {
                if *count_rx.borrow() == 0 && self.in_flight.lock().await.is_empty() {
                    return;
                }
                if count_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(self.config.request_timeout, wait)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> ShutdownConfig {
        ShutdownConfig {
            request_timeout: Duration::from_millis(300),
            cleanup_timeout: Duration::from_millis(200),
            force_after_timeout: true,
        }
    }

    #[test]
    fn test_flag_roundtrip() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        let clone = flag.clone();
        flag.set();
        assert!(clone.is_set());
    }

    #[tokio::test]
    async fn test_track_refused_after_flag_set() {
        let coordinator = ShutdownCoordinator::new(fast_config(), ShutdownFlag::new());
        coordinator.track_begin("req-1").await.unwrap();
        coordinator.flag().set();

        let err = coordinator.track_begin("req-2").await.unwrap_err();
        assert_eq!(err.code(), "ShuttingDown");
        assert_eq!(coordinator.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_tracked_requests() {
        let coordinator = ShutdownCoordinator::new(fast_config(), ShutdownFlag::new());
        coordinator.track_begin("req-1").await.unwrap();

        let finisher = Arc::clone(&coordinator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            finisher.track_end("req-1").await;
        });

        let report = coordinator.run().await;
        assert!(report.drained);
    }

    #[tokio::test]
    async fn test_drain_times_out_but_proceeds() {
        let coordinator = ShutdownCoordinator::new(fast_config(), ShutdownFlag::new());
        coordinator.track_begin("stuck").await.unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        coordinator
            .register_cleanup(
                "flush",
                Arc::new(move || {
                    let ran = Arc::clone(&ran_clone);
                    Box::pin(async move {
                        ran.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await;

        let report = coordinator.run().await;
        assert!(!report.drained);
        assert_eq!(report.cleanups_succeeded, 1);
        assert!(ran.load(Ordering::SeqCst), "cleanup must run despite stuck drain");
    }

    #[tokio::test]
    async fn test_cleanups_run_in_registration_order() {
        let coordinator = ShutdownCoordinator::new(fast_config(), ShutdownFlag::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            coordinator
                .register_cleanup(
                    name,
                    Arc::new(move || {
                        let order = Arc::clone(&order);
                        Box::pin(async move {
                            order.lock().unwrap().push(name);
                            Ok(())
                        })
                    }),
                )
                .await;
        }

        coordinator.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_halt_sequence() {
        let coordinator = ShutdownCoordinator::new(fast_config(), ShutdownFlag::new());
        let later_ran = Arc::new(AtomicUsize::new(0));

        coordinator
            .register_cleanup(
                "broken",
                Arc::new(|| Box::pin(async { Err("disk on fire".to_string()) })),
            )
            .await;
        let later = Arc::clone(&later_ran);
        coordinator
            .register_cleanup(
                "after",
                Arc::new(move || {
                    let later = Arc::clone(&later);
                    Box::pin(async move {
                        later.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await;

        let report = coordinator.run().await;
        assert_eq!(report.cleanups_failed, 1);
        assert_eq!(report.cleanups_succeeded, 1);
        assert_eq!(later_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hung_cleanup_is_bounded() {
        let coordinator = ShutdownCoordinator::new(fast_config(), ShutdownFlag::new());
        coordinator
            .register_cleanup(
                "hang",
                Arc::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                }),
            )
            .await;

        let start = std::time::Instant::now();
        let report = coordinator.run().await;
        assert_eq!(report.cleanups_failed, 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let coordinator = ShutdownCoordinator::new(fast_config(), ShutdownFlag::new());
        let waiter = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move {
            waiter.wait_for_trigger().await;
        });
        assert!(!coordinator.is_triggered());
        coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
