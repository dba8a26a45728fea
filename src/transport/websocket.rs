//! WebSocket transport.
//!
//! Wraps a `tokio_tungstenite::WebSocketStream` over any async byte stream
//! and maps tungstenite messages onto [`Frame`]s.
//!
//! tungstenite also answers pings by itself while reading; the pong the
//! connection queues in addition is an unsolicited pong, which RFC 6455
//! allows.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::trace;

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameKind};

use super::{FrameReader, FrameWriter, Transport};

// ============================================================================
// WsTransport
// ============================================================================

/// WebSocket link over stream `S`.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    /// Wraps an established WebSocket stream.
    #[inline]
    #[must_use]
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (sink, stream) = self.stream.split();
        (
            Box::new(WsReader { stream }),
            Box::new(WsWriter { sink, closed: false }),
        )
    }
}

// ============================================================================
// WsReader
// ============================================================================

struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return Err(Error::ConnectionClosed);
                }
                Some(Err(e)) => return Err(e.into()),
            };

            let frame = match message {
                Message::Text(text) => Frame::new(FrameKind::Text, text.as_str().as_bytes()),
                Message::Binary(data) => Frame::new(FrameKind::Binary, data.to_vec()),
                Message::Ping(_) => Frame::control(FrameKind::Ping),
                Message::Pong(_) => Frame::control(FrameKind::Pong),
                Message::Close(_) => Frame::control(FrameKind::Close),
                // Raw frames only surface when writing raw frames ourselves
                Message::Frame(_) => continue,
            };

            trace!(kind = %frame.kind, len = frame.payload.len(), "Frame read");
            return Ok(frame);
        }
    }
}

// ============================================================================
// WsWriter
// ============================================================================

struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, kind: FrameKind, payload: Vec<u8>) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        let message = match kind {
            FrameKind::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|_| Error::connection("text frame payload is not valid UTF-8"))?;
                Message::Text(text.into())
            }
            FrameKind::Binary => Message::Binary(payload.into()),
            FrameKind::Ping => Message::Ping(Default::default()),
            FrameKind::Pong => Message::Pong(Default::default()),
            FrameKind::Close => Message::Close(None),
        };

        self.sink.send(message).await?;

        if kind == FrameKind::Close {
            self.closed = true;
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
