//! duplex-ws - Duplex WebSocket connection manager.
//!
//! This library owns full-duplex, message-oriented sessions over WebSocket
//! (or any framed transport), for both the accepting and the dialing side.
//!
//! # Architecture
//!
//! Every open [`Connection`] runs three tasks over one transport:
//!
//! - **Receive loop**: reads frames, answers pings, hands messages to hooks
//! - **Send loop**: the only writer, drains a bounded FIFO queue
//! - **Heartbeat loop**: detects silent peers, sends client pings
//!
//! Key design principles:
//!
//! - Messages travel in reference-counted [`MessageBuffer`]s, optionally
//!   recycled through a [`BufferPool`]
//! - Connections are reference counted and recycled through a
//!   [`ConnectionPool`] once released and closed
//! - Producers wait when the outbound queue is full
//! - The client driver reconnects after a fixed interval until stopped
//!
//! # Quick Start
//!
//! ```no_run
//! use duplex_ws::{Result, SessionConfig, WsServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Echo every message back to its sender
//!     let config = SessionConfig::builder()
//!         .on_message(|conn, msg, _attachment| {
//!             let _ = conn.try_send(msg);
//!         })
//!         .build()?;
//!
//!     let server = WsServer::bind("127.0.0.1:9000", config).await?;
//!     println!("Listening on {}", server.ws_url());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`buffer`] | [`MessageBuffer`] and [`BufferPool`] |
//! | [`config`] | [`SessionConfig`], hooks and tunables |
//! | [`connection`] | [`Connection`] state machine and [`ConnectionPool`] |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`frame`] | Frame kinds and frames |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`session`] | Server and client drivers |
//! | [`transport`] | Transport traits, WebSocket, in-memory, dial, upgrade |

// ============================================================================
// Modules
// ============================================================================

/// Reference-counted message buffers and their pool.
pub mod buffer;

/// Session configuration: hooks, tunables, pools, proxy.
///
/// Use [`SessionConfig::builder()`] to create a configuration.
pub mod config;

/// Connection state machine, loops and pool.
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Frame kinds exchanged with transports.
pub mod frame;

/// Type-safe identifiers.
pub mod identifiers;

/// Server and client session drivers.
pub mod session;

/// Transport layer.
///
/// Framed duplex transports and the operations that establish them.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Buffer types
pub use buffer::{BufferPool, MessageBuffer};

// Configuration types
pub use config::{Attachment, Hooks, SessionConfig, SessionConfigBuilder, Tunables};

// Connection types
pub use connection::{CloseReason, Connection, ConnectionPool, ConnectionState, Role};

// Error types
pub use error::{Error, Result};

// Frame types
pub use frame::{Frame, FrameKind};

// Identifier types
pub use identifiers::ConnectionId;

// Session drivers
pub use session::{ClientExit, ClientHandle, ClientSession, WsServer, serve, serve_until};

// Transport types
pub use transport::{
    Connector, FrameReader, FrameWriter, MemoryTransport, ProxyConfig, ProxyType, Transport,
    UpgradeDecision, UpgradeRequest, WsConnector, WsTransport,
};
