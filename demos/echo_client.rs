//! Echo client with auto-reconnect.
//!
//! Demonstrates:
//! - Sending from the connected hook with `try_send`
//! - Heartbeat pings from the client side
//! - Reconnecting after the server goes away
//!
//! Start `echo_server` first, or start it later and watch the client
//! reconnect.
//!
//! Usage:
//!   cargo run --example echo_client
//!   cargo run --example echo_client -- ws://127.0.0.1:11771/ws?name=demo --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use common::{Args, SERVER_URL};
use duplex_ws::{ClientSession, SessionConfig};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    println!("=== Echo Client ===\n");

    let url = args.url.unwrap_or_else(|| SERVER_URL.to_string());

    let config = SessionConfig::builder()
        .headers(|_| vec![("x-demo".to_string(), "echo_client".to_string())])
        .on_connected(|conn, _| {
            println!("[+] connected as {}", conn.id());
            let greeting = conn.alloc_buffer();
            greeting.write(b"Hello");
            if let Err(e) = conn.try_send(greeting) {
                println!("[!] greeting dropped: {e}");
            }
        })
        .on_disconnected(|conn, _| {
            println!("[-] {} disconnected", conn.id());
        })
        .on_message(|_, message, _| {
            println!("[<] {}", String::from_utf8_lossy(&message.read_all()));
        })
        .on_before_send_ping(|conn, _| {
            println!("[~] ping ({}ms since last frame)", conn.last_activity().as_millis());
        })
        .heartbeat_interval(Duration::from_secs(1))
        .ping_interval(Duration::from_secs(5))
        .reconnect_interval(Duration::from_secs(2))
        .build()?;

    println!("Dialing {url}");
    println!("Press Ctrl+C to exit...");

    let handle = ClientSession::new(url, config).spawn();
    tokio::signal::ctrl_c().await?;

    handle.stop();
    let exit = handle.join().await?;
    println!(
        "\nStopped after {} dial attempt(s), {} connection(s)",
        exit.dial_attempts, exit.connections
    );

    Ok(())
}
