//! Error types for the duplex connection manager.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use duplex_ws::{Connection, Result};
//!
//! async fn greet(conn: &Connection) -> Result<()> {
//!     conn.send_text("hello").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidUrl`], [`Error::Proxy`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::Rejected`] |
//! | Send path | [`Error::BufferOverflow`], [`Error::QueueFull`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a [`SessionConfig`](crate::SessionConfig) is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Target URL could not be parsed or uses an unsupported scheme.
    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        message: String,
    },

    /// Proxy negotiation failed.
    #[error("Proxy error: {message}")]
    Proxy {
        /// Description of the proxy failure.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport failure (dial, upgrade, read or write).
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The connection is not open.
    ///
    /// Returned when sending on a connection that is idle or shutting down,
    /// and by readers when the peer went away.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The before-upgrade hook rejected the handshake.
    #[error("Upgrade rejected with status {status}")]
    Rejected {
        /// HTTP status sent back to the peer.
        status: u16,
    },

    /// Payload does not fit into a fixed-size pooled buffer.
    #[error("Buffer overflow: {needed} bytes needed, {available} available")]
    BufferOverflow {
        /// Bytes the write required.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// Outbound queue is at capacity and the caller asked not to wait.
    #[error("Outbound queue full ({capacity} messages)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid URL error.
    #[inline]
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a proxy error.
    #[inline]
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates an upgrade rejection error.
    #[inline]
    pub fn rejected(status: u16) -> Self {
        Self::Rejected { status }
    }

    /// Creates a buffer overflow error.
    #[inline]
    pub fn buffer_overflow(needed: usize, available: usize) -> Self {
        Self::BufferOverflow { needed, available }
    }

    /// Creates a queue full error.
    #[inline]
    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this error came from the transport.
    ///
    /// Transport errors always end the current connection.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::Proxy { .. }
                | Self::Io(_)
                | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
