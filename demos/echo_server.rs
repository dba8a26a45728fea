//! Echo server.
//!
//! Demonstrates:
//! - Building a session config with lifecycle and message hooks
//! - Rejecting handshakes in the before-upgrade hook
//! - Serving connections with `WsServer`
//! - Pooled message buffers and connections
//!
//! Usage:
//!   cargo run --example echo_server
//!   cargo run --example echo_server -- --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use common::{Args, LISTEN_ADDR};
use duplex_ws::{ConnectionPool, SessionConfig, UpgradeDecision, WsServer};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    println!("=== Echo Server ===\n");

    // ========================================================================
    // Configure
    // ========================================================================

    let config = SessionConfig::builder()
        .before_upgrade(|request, _| {
            if request.uri().path() == "/ws" {
                UpgradeDecision::proceed_with(request.uri().query().unwrap_or_default().to_string())
            } else {
                UpgradeDecision::reject(404, "only /ws is served")
            }
        })
        .on_connected(|conn, _| {
            let query = conn
                .attachment()
                .and_then(|a| a.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            println!("[+] {} connected (query: {query:?})", conn.id());
        })
        .on_disconnected(|conn, _| {
            println!("[-] {} disconnected", conn.id());
        })
        .on_message(|conn, message, _| {
            println!(
                "[>] {} sent {} bytes ({})",
                conn.id(),
                message.len(),
                message.frame_kind()
            );
            if let Err(e) = conn.try_send(message) {
                println!("[!] echo to {} dropped: {e}", conn.id());
            }
        })
        .heartbeat_interval(Duration::from_secs(1))
        .pooled_buffers()
        .connection_pool(ConnectionPool::new())
        .build()?;

    // ========================================================================
    // Serve
    // ========================================================================

    let server = WsServer::bind(LISTEN_ADDR, config).await?;
    println!("Listening on {}/ws", server.ws_url());
    println!("Press Ctrl+C to exit...");

    tokio::signal::ctrl_c().await?;

    println!("\nShutting down {} connection(s)...", server.connection_count());
    server.shutdown().await;
    println!("Done");

    Ok(())
}
