//! Wire the MCP server to the process's stdio.
//!
//! stdout carries only JSON-RPC frames (logging is already routed to
//! stderr in `main`). The server runs until the coordinator closes stdin
//! or the process receives Ctrl+C.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use apiary_core::Hub;
use apiary_core::mcp::McpServer;

pub async fn run_stdio(hub: Arc<Hub>) -> Result<()> {
    let cancel = CancellationToken::new();

    // Ctrl+C cancels the serve loop; EOF on stdin ends it naturally.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    tracing::info!("mcp server on stdio, waiting for initialize");
    McpServer::new(hub, writer).run(reader, cancel).await?;
    tracing::info!("mcp server finished");
    Ok(())
}
