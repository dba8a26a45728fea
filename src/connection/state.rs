//! Connection states, roles and close reasons.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a [`Connection`](super::Connection).
///
/// ```text
/// Idle ──bind──► Open ──failure/close──► Closing ──loops joined──► Closed
///   └──────────────── dial failed ─────────────────────────────────►┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed or recycled, no transport bound.
    Idle,
    /// Transport bound, loops running.
    Open,
    /// Shutdown raised, loops draining.
    Closing,
    /// Transport released, loops joined.
    Closed,
}

impl ConnectionState {
    /// Returns `true` while loops may be running.
    #[inline]
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::Closing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

// ============================================================================
// Role
// ============================================================================

/// Which side initiated the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dialing side; sends pings when a ping interval is configured.
    Client,
    /// Accepting side; only answers pings and tracks liveness.
    Server,
}

impl Role {
    /// Returns `true` if this side sends liveness probes.
    #[inline]
    #[must_use]
    pub const fn probes(self) -> bool {
        matches!(self, Self::Client)
    }
}

// ============================================================================
// CloseReason
// ============================================================================

/// Why an open period ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Peer sent a close frame.
    PeerClosed,
    /// Read error or end of stream.
    ReadFailed,
    /// Write error.
    WriteFailed,
    /// No inbound activity within the heartbeat timeout.
    HeartbeatTimeout,
    /// [`Connection::close`](super::Connection::close) or a queued close frame.
    Local,
    /// The owning driver was stopped.
    Stopped,
    /// A loop task panicked, usually inside a hook.
    LoopPanicked,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PeerClosed => "peer closed",
            Self::ReadFailed => "read failed",
            Self::WriteFailed => "write failed",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::Local => "closed locally",
            Self::Stopped => "stopped",
            Self::LoopPanicked => "loop panicked",
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
