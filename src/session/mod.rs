//! Session drivers.
//!
//! A driver obtains transports and runs connections over them:
//!
//! | Role | Driver | Transport source |
//! |------|--------|------------------|
//! | Server | [`serve`] / [`WsServer`] | Accepted and upgraded streams |
//! | Client | [`ClientSession`] | [`Connector`](crate::transport::Connector) with reconnect |
//!
//! Both take connections from the configured
//! [`ConnectionPool`](crate::ConnectionPool) when there is one.

// ============================================================================
// Submodules
// ============================================================================

/// Client driver with reconnect loop.
pub mod client;

/// Server driver and WebSocket listener.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use client::{ClientExit, ClientHandle, ClientSession};
pub use server::{WsServer, serve, serve_until};

// ============================================================================
// Helpers
// ============================================================================

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::connection::Connection;

/// Takes a connection from the configured pool, or creates one.
fn acquire(config: &Arc<SessionConfig>) -> Arc<Connection> {
    match config.connection_pool() {
        Some(pool) => pool.get(config),
        None => Connection::new(Arc::clone(config)),
    }
}
