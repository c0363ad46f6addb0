//! MCP server runner with stdio transport

use std::sync::Arc;

use rmcp::ServiceExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::tool_handler::OrchestratorToolServer;
use dashcrew_core::{Orchestrator, OrchestratorConfig};

/// Get stdin/stdout for stdio transport
fn stdio() -> (tokio::io::Stdin, tokio::io::Stdout) {
    (tokio::io::stdin(), tokio::io::stdout())
}

/// Initialize tracing to stderr (stdout carries the MCP protocol).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok(); // Ignore error if already initialized
}

/// Run the MCP server with stdio transport.
///
/// Starts the orchestrator, serves tool calls until the client disconnects
/// or a shutdown signal arrives, then runs the full shutdown sequence
/// (drain, ordered cleanups, DLQ flush).
pub async fn run_mcp_server(config: OrchestratorConfig) -> anyhow::Result<()> {
    init_tracing();

    info!(
        workers = config.worker_count,
        queue_capacity = config.queue_capacity,
        "Starting DashCrew MCP server"
    );

    let orchestrator = Orchestrator::start(config).await?;
    orchestrator.shutdown.install_signal_handlers();

    let server = OrchestratorToolServer::new(Arc::clone(&orchestrator));
    let running = server.serve(stdio()).await?;

    info!("MCP server running, waiting for client requests...");

    tokio::select! {
        result = running.waiting() => {
            result?;
            info!("MCP client disconnected");
            orchestrator.shutdown.trigger();
        }
        _ = orchestrator.shutdown.wait_for_trigger() => {
            info!("shutdown signal received");
        }
    }

    let report = orchestrator.shutdown.run().await;
    info!(
        drained = report.drained,
        cleanups = report.cleanups_succeeded,
        failures = report.cleanups_failed,
        "MCP server shut down"
    );

    Ok(())
}
