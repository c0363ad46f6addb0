//! DashCrew MCP Server
//!
//! Exposes the DashCrew orchestrator as MCP tools over stdio. The host
//! conversational agent calls `delegateTask` and friends; the server
//! dispatches work to locally-installed coding agents and reports back.

pub mod server;
pub mod tool_handler;

pub use server::{init_tracing, run_mcp_server};
pub use tool_handler::OrchestratorToolServer;
