//! DashCrew CLI
//!
//! Entry point for the `dashcrew` MCP server binary.

use anyhow::Result;
use clap::Parser;

use dashcrew_cli::{render_config, resolve_config, Args};
use dashcrew_mcp_server::run_mcp_server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = resolve_config(&args);

    if args.dry_run {
        println!("{}", render_config(&config));
        return Ok(());
    }

    run_mcp_server(config).await
}
