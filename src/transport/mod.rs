//! Transport layer.
//!
//! A transport is an established duplex link that reads and writes whole
//! frames. Connections split it into a reader owned by the receive loop and a
//! writer owned by the send loop, so there is exactly one writer per link.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   dial / upgrade    ┌──────────────────────┐
//! │ Session      │────────────────────►│ Box<dyn Transport>   │
//! │ Driver       │                     └──────────┬───────────┘
//! └──────────────┘                          split │
//!                                   ┌─────────────┴─────────────┐
//!                                   ▼                           ▼
//!                          Box<dyn FrameReader>        Box<dyn FrameWriter>
//!                            (receive loop)               (send loop)
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `websocket` | RFC 6455 transport over `tokio-tungstenite` |
//! | `memory` | In-process transport pair |
//! | `proxy` | Proxy configuration and tunnelling |
//! | `dial` | Client-side dial operation |
//! | `upgrade` | Server-side upgrade operation |

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::Result;
use crate::frame::{Frame, FrameKind};

// ============================================================================
// Submodules
// ============================================================================

/// Client-side dial operation.
pub mod dial;

/// In-process transport pair.
pub mod memory;

/// Proxy configuration and tunnelling.
pub mod proxy;

/// Server-side upgrade operation.
pub mod upgrade;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use dial::{Connector, WsConnector, dial};
pub use memory::MemoryTransport;
pub use proxy::{ProxyConfig, ProxyType};
pub use upgrade::{UpgradeDecision, UpgradeRequest, Upgraded, upgrade};
pub use websocket::WsTransport;

// ============================================================================
// Capability Traits
// ============================================================================

/// Read half of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Reads the next complete frame.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) at end of stream
    /// - any transport error; the reader is unusable afterwards
    async fn read_frame(&mut self) -> Result<Frame>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Writes one frame. Control kinds ignore `payload`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the frame could not be written.
    async fn write_frame(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<()>;

    /// Closes the link. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close handshake failed.
    async fn close(&mut self) -> Result<()>;
}

/// An established duplex link.
pub trait Transport: Send + 'static {
    /// Splits the link into its read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}
