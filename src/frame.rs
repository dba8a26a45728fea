//! Frame kinds and frames exchanged with a transport.
//!
//! | Kind | Payload | Effect |
//! |------|---------|--------|
//! | `Text` | UTF-8 data | Delivered to the message hook |
//! | `Binary` | Raw data | Delivered to the message hook |
//! | `Ping` | Empty | Liveness; answered with `Pong` |
//! | `Pong` | Empty | Liveness |
//! | `Close` | Empty | Ends the connection |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// FrameKind
// ============================================================================

/// Tag distinguishing data frames from protocol control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// UTF-8 text data.
    #[default]
    Text,
    /// Binary data.
    Binary,
    /// Liveness probe.
    Ping,
    /// Liveness answer.
    Pong,
    /// Orderly shutdown.
    Close,
}

impl FrameKind {
    /// Returns `true` for `Text` and `Binary`.
    #[inline]
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }

    /// Returns `true` for `Ping`, `Pong` and `Close`.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        !self.is_data()
    }

    /// Returns the lowercase name of the kind.
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One complete frame read from a transport.
///
/// Readers never hand out partial frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Payload; empty for control frames.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame.
    #[inline]
    #[must_use]
    pub fn new(kind: FrameKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Creates a payload-less control frame.
    #[inline]
    #[must_use]
    pub fn control(kind: FrameKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// Creates a text frame.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, text.into().into_bytes())
    }

    /// Creates a binary frame.
    #[inline]
    #[must_use]
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(FrameKind::Binary, data)
    }
}

// ============================================================================
// Tests
// ============================================================================
