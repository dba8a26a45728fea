//! Send and receive loops.
//!
//! The send loop is the only writer of a transport: it drains the outbound
//! queue in FIFO order until shutdown. The receive loop is the only reader:
//! it answers pings, records liveness and hands data frames to the message
//! hook. Both race every transport call against the shutdown signal.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::buffer::MessageBuffer;
use crate::config::SessionConfig;
use crate::error::Error;
use crate::frame::{Frame, FrameKind};
use crate::transport::{FrameReader, FrameWriter};

use super::Connection;
use super::shutdown::Shutdown;
use super::state::CloseReason;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for the closing handshake once the send loop is done.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Send Loop
// ============================================================================

pub(super) async fn send_loop(
    conn: Arc<Connection>,
    mut writer: Box<dyn FrameWriter>,
    mut queue: mpsc::Receiver<MessageBuffer>,
    shutdown: Arc<Shutdown>,
) {
    loop {
        let buffer = tokio::select! {
            biased;
            () = shutdown.raised() => break,
            next = queue.recv() => match next {
                Some(buffer) => buffer,
                None => break,
            },
        };

        let kind = buffer.frame_kind();
        let payload = if kind.is_data() {
            buffer.to_vec()
        } else {
            Vec::new()
        };

        let written = tokio::select! {
            biased;
            () = shutdown.raised() => break,
            result = writer.write_frame(kind, payload) => result,
        };
        buffer.release();

        if let Err(e) = written {
            debug!(id = %conn.id(), error = %e, %kind, "Write failed");
            shutdown.trigger(CloseReason::WriteFailed);
            break;
        }
        trace!(id = %conn.id(), %kind, "Frame written");

        if kind == FrameKind::Close {
            shutdown.trigger(CloseReason::Local);
            break;
        }
    }

    match timeout(WRITER_CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(id = %conn.id(), error = %e, "Transport close failed"),
        Err(_) => debug!(id = %conn.id(), "Transport close timed out"),
    }

    queue.close();
    let mut dropped = 0usize;
    while let Ok(buffer) = queue.try_recv() {
        buffer.release();
        dropped += 1;
    }
    if dropped > 0 {
        debug!(id = %conn.id(), dropped, "Released unsent messages");
    }
}

// ============================================================================
// Receive Loop
// ============================================================================

pub(super) async fn recv_loop(
    conn: Arc<Connection>,
    mut reader: Box<dyn FrameReader>,
    outbound: mpsc::Sender<MessageBuffer>,
    shutdown: Arc<Shutdown>,
    config: Arc<SessionConfig>,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            () = shutdown.raised() => return,
            frame = reader.read_frame() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(Error::ConnectionClosed) => {
                debug!(id = %conn.id(), "Transport stream ended");
                break CloseReason::ReadFailed;
            }
            Err(e) => {
                debug!(id = %conn.id(), error = %e, "Read failed");
                break CloseReason::ReadFailed;
            }
        };

        match frame.kind {
            FrameKind::Ping => {
                conn.liveness().touch();
                let pong = MessageBuffer::control(FrameKind::Pong);
                tokio::select! {
                    biased;
                    () = shutdown.raised() => return,
                    sent = outbound.send(pong) => if sent.is_err() { return },
                }
            }
            FrameKind::Pong => conn.liveness().touch(),
            FrameKind::Close => {
                debug!(id = %conn.id(), "Close frame received");
                break CloseReason::PeerClosed;
            }
            FrameKind::Text | FrameKind::Binary => {
                conn.liveness().touch();
                dispatch(&conn, &config, frame);
            }
        }
    };

    shutdown.trigger(reason);
}

/// Copies a data frame into a message buffer and runs the message hook.
fn dispatch(conn: &Arc<Connection>, config: &SessionConfig, frame: Frame) {
    let message = config.alloc_buffer();
    let accepted = message.write(&frame.payload);
    if accepted < frame.payload.len() {
        warn!(
            id = %conn.id(),
            size = frame.payload.len(),
            capacity = message.capacity(),
            "Inbound message truncated to buffer size"
        );
    }
    message.set_frame_kind(frame.kind);

    if let Some(hook) = &config.hooks().on_message {
        hook(conn, message.add_ref(), config.attachment());
    }
    message.release();
}
