//! In-process transport.
//!
//! [`MemoryTransport::pair`] returns two connected ends backed by bounded
//! tokio channels. A writer waits when the peer's inbox is full, so a peer
//! that stops reading stalls the writer exactly like a slow socket would.
//! Dropping or closing one end makes the other end's reads fail with
//! [`Error::ConnectionClosed`] and its writes fail too.
//!
//! Besides being a [`Transport`], each end can be driven directly with
//! [`send_frame`](MemoryTransport::send_frame) and
//! [`recv_frame`](MemoryTransport::recv_frame), which is how tests script a
//! peer.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameKind};

use super::{FrameReader, FrameWriter, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Inbox size used by [`MemoryTransport::pair`].
const DEFAULT_INBOX: usize = 1024;

// ============================================================================
// MemoryTransport
// ============================================================================

/// One end of an in-process link.
#[derive(Debug)]
pub struct MemoryTransport {
    outbox: mpsc::Sender<Frame>,
    inbox: mpsc::Receiver<Frame>,
}

impl MemoryTransport {
    /// Creates two connected ends with a roomy inbox.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_INBOX)
    }

    /// Creates two connected ends whose inboxes hold `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self {
                outbox: b_tx,
                inbox: a_rx,
            },
            Self {
                outbox: a_tx,
                inbox: b_rx,
            },
        )
    }

    /// Sends a frame to the other end.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the other end is gone.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.outbox
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Receives the next frame, or `None` once the other end is gone.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.inbox.recv().await
    }
}

impl Transport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let Self { outbox, inbox } = *self;
        (
            Box::new(MemoryReader { inbox }),
            Box::new(MemoryWriter {
                outbox: Some(outbox),
            }),
        )
    }
}

// ============================================================================
// Halves
// ============================================================================

struct MemoryReader {
    inbox: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<Frame> {
        self.inbox.recv().await.ok_or(Error::ConnectionClosed)
    }
}

struct MemoryWriter {
    outbox: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_frame(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<()> {
        let outbox = self.outbox.as_ref().ok_or(Error::ConnectionClosed)?;

        let frame = if kind.is_data() {
            Frame::new(kind, payload)
        } else {
            Frame::control(kind)
        };

        outbox
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        if kind == FrameKind::Close {
            self.outbox = None;
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.outbox = None;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
