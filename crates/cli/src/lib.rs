//! DashCrew CLI Library
//!
//! Argument parsing and configuration resolution for the `dashcrew` binary,
//! kept out of `main.rs` so it can be unit tested.

use std::path::PathBuf;

use clap::Parser;
use dashcrew_core::OrchestratorConfig;

/// DashCrew - multi-agent orchestration MCP server
#[derive(Parser, Debug, Clone)]
#[command(name = "dashcrew")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Number of concurrent workers (overrides WORKER_COUNT)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Task queue capacity (overrides QUEUE_CAPACITY)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Dead-letter queue persistence file (overrides DLQ_PATH)
    #[arg(long)]
    pub dlq_path: Option<PathBuf>,

    /// Root directory for the project index (overrides DASHCREW_STATE_ROOT)
    #[arg(long)]
    pub state_root: Option<PathBuf>,

    /// Print the resolved configuration and exit without serving
    #[arg(long)]
    pub dry_run: bool,
}

/// Resolve the orchestrator configuration: environment first, CLI overrides
/// on top.
pub fn resolve_config(args: &Args) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::from_env();
    if let Some(workers) = args.workers {
        config.worker_count = workers.max(1);
    }
    if let Some(capacity) = args.queue_capacity {
        config.queue_capacity = capacity.max(1);
    }
    if let Some(path) = &args.dlq_path {
        config.dlq_path = Some(path.clone());
    }
    if let Some(root) = &args.state_root {
        config.state_root = root.clone();
    }
    config
}

/// One-line-per-field rendering of the resolved configuration.
pub fn render_config(config: &OrchestratorConfig) -> String {
    let dlq = config
        .dlq_path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(in-memory)".to_string());
    format!(
        "workers: {}\n\
         queue_capacity: {}\n\
         shutdown_request_timeout_s: {}\n\
         shutdown_cleanup_timeout_s: {}\n\
         dlq_path: {}\n\
         dlq_retry_interval_s: {}\n\
         rate_limit_capacity: {}\n\
         rate_limit_rate: {}\n\
         circuit_failure_threshold: {}\n\
         circuit_cooldown_s: {}\n\
         state_root: {}",
        config.worker_count,
        config.queue_capacity,
        config.shutdown_request_timeout.as_secs_f64(),
        config.shutdown_cleanup_timeout.as_secs_f64(),
        dlq,
        config.dlq_retry_interval.as_secs_f64(),
        config.rate_limit_capacity,
        config.rate_limit_rate,
        config.circuit_failure_threshold,
        config.circuit_cooldown.as_secs_f64(),
        config.state_root.display(),
    )
}
