//! Centralized environment variable names and resolved configuration.
//!
//! All operator-tunable knobs are read from the environment once at startup
//! through the typed helpers below; components receive plain values via
//! [`OrchestratorConfig`] rather than reading the environment themselves.

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Environment Variable Name Constants
// =============================================================================

/// Size of the worker pool (default: 3).
pub const WORKER_COUNT: &str = "WORKER_COUNT";
/// High-water mark for task submission (default: 1024).
pub const QUEUE_CAPACITY: &str = "QUEUE_CAPACITY";
/// Seconds to wait for in-flight requests during shutdown (default: 30).
pub const SHUTDOWN_REQUEST_TIMEOUT_S: &str = "SHUTDOWN_REQUEST_TIMEOUT_S";
/// Seconds allowed per cleanup callback during shutdown (default: 10).
pub const SHUTDOWN_CLEANUP_TIMEOUT_S: &str = "SHUTDOWN_CLEANUP_TIMEOUT_S";
/// Path to the dead-letter queue persistence file.
pub const DLQ_PATH: &str = "DLQ_PATH";
/// Interval between DLQ auto-retry sweeps, in seconds (default: 5).
pub const DLQ_RETRY_INTERVAL_S: &str = "DLQ_RETRY_INTERVAL_S";
/// Default token bucket capacity per scope (default: 60).
pub const RATE_LIMIT_DEFAULT_CAPACITY: &str = "RATE_LIMIT_DEFAULT_CAPACITY";
/// Default token refill rate per scope, tokens/sec (default: 1.0).
pub const RATE_LIMIT_DEFAULT_RATE: &str = "RATE_LIMIT_DEFAULT_RATE";
/// Consecutive failures before a circuit opens (default: 5).
pub const CIRCUIT_FAILURE_THRESHOLD: &str = "CIRCUIT_FAILURE_THRESHOLD";
/// Seconds a circuit stays open before probing (default: 60).
pub const CIRCUIT_COOLDOWN_S: &str = "CIRCUIT_COOLDOWN_S";
/// Root directory for the project path index (default: ~/.dashcrew).
pub const DASHCREW_STATE_ROOT: &str = "DASHCREW_STATE_ROOT";

// =============================================================================
// Typed helpers
// =============================================================================

/// Reads an environment variable as a string, returning `None` if unset.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Reads an environment variable as a `usize`, returning `default` if unset or invalid.
#[must_use]
pub fn env_usize_or_default(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as a `u64`, returning `default` if unset or invalid.
#[must_use]
pub fn env_u64_or_default(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as an `f64`, returning `default` if unset,
/// invalid, negative, or non-finite.
#[must_use]
pub fn env_f64_or_default(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

// =============================================================================
// Resolved configuration
// =============================================================================

/// Resolved orchestrator configuration.
///
/// Built once from the environment (or assembled by hand in tests) and
/// handed to components by value.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of concurrent workers consuming the task queue.
    pub worker_count: usize,
    /// Bounded task queue capacity.
    pub queue_capacity: usize,
    /// Bound on the in-flight request drain during shutdown.
    pub shutdown_request_timeout: Duration,
    /// Bound on each cleanup callback during shutdown.
    pub shutdown_cleanup_timeout: Duration,
    /// DLQ persistence file. `None` keeps the queue in memory only.
    pub dlq_path: Option<PathBuf>,
    /// Interval between DLQ auto-retry sweeps.
    pub dlq_retry_interval: Duration,
    /// Default token bucket capacity per scope.
    pub rate_limit_capacity: u64,
    /// Default token refill rate per scope, tokens/sec.
    pub rate_limit_rate: f64,
    /// Consecutive classified failures before a circuit opens.
    pub circuit_failure_threshold: u32,
    /// Cooldown before an open circuit admits a probe.
    pub circuit_cooldown: Duration,
    /// Root directory for the project path index.
    pub state_root: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_capacity: 1024,
            shutdown_request_timeout: Duration::from_secs(30),
            shutdown_cleanup_timeout: Duration::from_secs(10),
            dlq_path: None,
            dlq_retry_interval: Duration::from_secs(5),
            rate_limit_capacity: 60,
            rate_limit_rate: 1.0,
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            state_root: default_state_root(),
        }
    }
}

impl OrchestratorConfig {
    /// Resolve configuration from the process environment.
    ///
    /// Unset or unparseable variables fall back to their defaults; a worker
    /// count of zero is clamped to one so the pool can always make progress.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_usize_or_default(WORKER_COUNT, defaults.worker_count).max(1),
            queue_capacity: env_usize_or_default(QUEUE_CAPACITY, defaults.queue_capacity).max(1),
            shutdown_request_timeout: Duration::from_secs_f64(env_f64_or_default(
                SHUTDOWN_REQUEST_TIMEOUT_S,
                defaults.shutdown_request_timeout.as_secs_f64(),
            )),
            shutdown_cleanup_timeout: Duration::from_secs_f64(env_f64_or_default(
                SHUTDOWN_CLEANUP_TIMEOUT_S,
                defaults.shutdown_cleanup_timeout.as_secs_f64(),
            )),
            dlq_path: env_string(DLQ_PATH).map(PathBuf::from),
            dlq_retry_interval: Duration::from_secs_f64(env_f64_or_default(
                DLQ_RETRY_INTERVAL_S,
                defaults.dlq_retry_interval.as_secs_f64(),
            )),
            rate_limit_capacity: env_u64_or_default(
                RATE_LIMIT_DEFAULT_CAPACITY,
                defaults.rate_limit_capacity,
            ),
            rate_limit_rate: env_f64_or_default(RATE_LIMIT_DEFAULT_RATE, defaults.rate_limit_rate),
            circuit_failure_threshold: env_u64_or_default(
                CIRCUIT_FAILURE_THRESHOLD,
                defaults.circuit_failure_threshold as u64,
            ) as u32,
            circuit_cooldown: Duration::from_secs_f64(env_f64_or_default(
                CIRCUIT_COOLDOWN_S,
                defaults.circuit_cooldown.as_secs_f64(),
            )),
            state_root: env_string(DASHCREW_STATE_ROOT)
                .map(PathBuf::from)
                .unwrap_or(defaults.state_root),
        }
    }
}

fn default_state_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".dashcrew")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.shutdown_request_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_cleanup_timeout, Duration::from_secs(10));
        assert_eq!(config.dlq_retry_interval, Duration::from_secs(5));
        assert_eq!(config.rate_limit_capacity, 60);
        assert_eq!(config.rate_limit_rate, 1.0);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_cooldown, Duration::from_secs(60));
        assert!(config.dlq_path.is_none());
    }

    #[test]
    fn test_env_usize_invalid_falls_back() {
        // An unset variable yields the default.
        assert_eq!(env_usize_or_default("DASHCREW_TEST_UNSET_USIZE", 7), 7);
    }

    #[test]
    fn test_env_f64_rejects_negative_and_nan() {
        std::env::set_var("DASHCREW_TEST_NEG_F64", "-5.0");
        assert_eq!(env_f64_or_default("DASHCREW_TEST_NEG_F64", 2.5), 2.5);
        std::env::set_var("DASHCREW_TEST_NAN_F64", "NaN");
        assert_eq!(env_f64_or_default("DASHCREW_TEST_NAN_F64", 2.5), 2.5);
        std::env::remove_var("DASHCREW_TEST_NEG_F64");
        std::env::remove_var("DASHCREW_TEST_NAN_F64");
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(WORKER_COUNT, "WORKER_COUNT");
        assert_eq!(QUEUE_CAPACITY, "QUEUE_CAPACITY");
        assert_eq!(DLQ_PATH, "DLQ_PATH");
        assert_eq!(RATE_LIMIT_DEFAULT_CAPACITY, "RATE_LIMIT_DEFAULT_CAPACITY");
        assert_eq!(CIRCUIT_FAILURE_THRESHOLD, "CIRCUIT_FAILURE_THRESHOLD");
    }

    #[test]
    fn test_state_root_defaults_under_home() {
        let config = OrchestratorConfig::default();
        assert!(config.state_root.ends_with(".dashcrew"));
    }
}
