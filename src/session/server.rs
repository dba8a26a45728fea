//! Server-side session driver.
//!
//! [`serve`] runs one connection over an already established transport.
//! [`WsServer`] adds the listener: it accepts TCP streams, upgrades them with
//! the before-upgrade hook and serves each on its own task.
//!
//! # Connection Flow
//!
//! 1. Accept a TCP stream
//! 2. Run the WebSocket handshake (the before-upgrade hook may reject it)
//! 3. Take a connection from the pool, attach the hook's value
//! 4. Run it until it closes, then drop the initial reference

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Attachment, SessionConfig};
use crate::connection::{CloseReason, Connection, Role};
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::{Transport, Upgraded, upgrade};

use super::acquire;

// ============================================================================
// serve
// ============================================================================

/// Serves one connection over `transport` until it closes.
///
/// The connection comes from the configured pool (or is created), carries
/// `attachment`, and its initial reference is released on return.
///
/// # Errors
///
/// Only fails if the pooled connection is unexpectedly still running.
pub async fn serve(
    transport: Box<dyn Transport>,
    config: &Arc<SessionConfig>,
    attachment: Option<Attachment>,
) -> Result<CloseReason> {
    serve_until(transport, config, attachment, None).await
}

/// Like [`serve`], but also closes when `stop` is cancelled.
///
/// # Errors
///
/// See [`serve`].
pub async fn serve_until(
    transport: Box<dyn Transport>,
    config: &Arc<SessionConfig>,
    attachment: Option<Attachment>,
    stop: Option<&CancellationToken>,
) -> Result<CloseReason> {
    let conn = acquire(config);
    conn.set_attachment(attachment);
    let result = conn.run(transport, Role::Server, stop).await;
    conn.release();
    result
}

// ============================================================================
// WsServer
// ============================================================================

/// WebSocket listener serving every accepted connection.
///
/// The accept loop runs until [`shutdown`](Self::shutdown) is called.
///
/// # Example
///
/// ```no_run
/// use duplex_ws::{SessionConfig, WsServer};
///
/// # async fn example() -> duplex_ws::Result<()> {
/// let config = SessionConfig::builder()
///     .on_message(|conn, msg, _| {
///         let _ = conn.try_send(msg);
///     })
///     .build()?;
///
/// let server = WsServer::bind("127.0.0.1:0", config).await?;
/// println!("listening on {}", server.ws_url());
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct WsServer {
    local_addr: SocketAddr,
    config: Arc<SessionConfig>,
    connections: Mutex<FxHashMap<ConnectionId, Arc<Connection>>>,
    drained: Notify,
    stop: CancellationToken,
}

impl WsServer {
    /// Binds a listener and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(addr: impl ToSocketAddrs, config: Arc<SessionConfig>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            local_addr,
            config,
            connections: Mutex::new(FxHashMap::default()),
            drained: Notify::new(),
            stop: CancellationToken::new(),
        });

        let accepting = Arc::clone(&server);
        tokio::spawn(async move {
            accepting.accept_loop(listener).await;
        });

        info!(%local_addr, "WebSocket server listening");

        Ok(server)
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the URL clients dial.
    ///
    /// Format: `ws://{local_addr}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Returns the number of open connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns the open connections.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Stops accepting and closes every connection.
    ///
    /// Returns once all served connections reached `Closed`. Handshakes still
    /// in progress are abandoned and never reach `on_connected`.
    pub async fn shutdown(&self) {
        info!(local_addr = %self.local_addr, "WebSocket server shutting down");
        self.stop.cancel();

        loop {
            let drained = self.drained.notified();
            if self.connections.lock().is_empty() {
                break;
            }
            drained.await;
        }

        info!(local_addr = %self.local_addr, "WebSocket server shutdown complete");
    }
}

// ============================================================================
// WsServer - Accept Loop
// ============================================================================

impl WsServer {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        debug!("Accept loop started");

        loop {
            let accepted = tokio::select! {
                () = self.stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        match server.handle_connection(stream, addr).await {
                            Ok(()) => {}
                            Err(Error::Rejected { status }) => {
                                debug!(%addr, status, "Handshake rejected");
                            }
                            Err(e) => warn!(error = %e, %addr, "Connection handling failed"),
                        }
                    });
                }
                Err(e) => error!(error = %e, "Accept failed"),
            }
        }

        debug!("Accept loop terminated");
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(%addr, "New TCP connection");
        stream.set_nodelay(true)?;

        let upgraded = tokio::select! {
            biased;
            () = self.stop.cancelled() => {
                debug!(%addr, "Server stopping, dropping pending handshake");
                return Ok(());
            }
            upgraded = upgrade(stream, &self.config) => upgraded?,
        };
        let Upgraded {
            transport,
            attachment,
        } = upgraded;

        let conn = acquire(&self.config);
        let id = conn.id();
        conn.set_attachment(attachment);

        // Checked under the map lock so shutdown either sees this entry or
        // this task sees the stop.
        {
            let mut connections = self.connections.lock();
            if self.stop.is_cancelled() {
                drop(connections);
                conn.release();
                debug!(%addr, "Server stopping, dropping upgraded connection");
                return Ok(());
            }
            connections.insert(id, Arc::clone(&conn));
        }
        info!(%id, %addr, "WebSocket connection accepted");

        let result = conn.run(transport, Role::Server, Some(&self.stop)).await;

        let drained = {
            let mut connections = self.connections.lock();
            connections.remove(&id);
            connections.is_empty()
        };
        conn.release();
        if drained {
            self.drained.notify_waiters();
        }

        let reason = result?;
        debug!(%id, %addr, %reason, "Connection finished");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::connection::ConnectionPool;
    use crate::frame::{Frame, FrameKind};
    use crate::transport::{MemoryTransport, UpgradeDecision, dial};

    fn echo_config(pool: Option<ConnectionPool>) -> Arc<SessionConfig> {
        let mut builder = SessionConfig::builder().on_message(|conn, message, _| {
            let _ = conn.try_send(message);
        });
        if let Some(pool) = pool {
            builder = builder.connection_pool(pool);
        }
        builder.build().unwrap()
    }

    async fn until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_serve_echoes_and_recycles() {
        let pool = ConnectionPool::new();
        let config = echo_config(Some(pool.clone()));
        let (local, mut peer) = MemoryTransport::pair();

        let served = {
            let config = Arc::clone(&config);
            tokio::spawn(async move { serve(Box::new(local), &config, None).await })
        };

        peer.send_frame(Frame::text("ping me")).await.unwrap();
        assert_eq!(peer.recv_frame().await, Some(Frame::text("ping me")));

        peer.send_frame(Frame::control(FrameKind::Close)).await.unwrap();
        assert_eq!(served.await.unwrap().unwrap(), CloseReason::PeerClosed);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_serve_sets_connection_attachment() {
        let seen = Arc::new(Mutex::new(None));
        let config = {
            let seen = Arc::clone(&seen);
            SessionConfig::builder()
                .on_connected(move |conn, _| {
                    let user = conn
                        .attachment()
                        .and_then(|a| a.downcast_ref::<String>().cloned());
                    *seen.lock() = user;
                    conn.close();
                })
                .build()
                .unwrap()
        };
        let (local, _peer) = MemoryTransport::pair();

        let attachment: Attachment = Arc::new("bob".to_string());
        serve(Box::new(local), &config, Some(attachment)).await.unwrap();

        assert_eq!(seen.lock().as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_serve_until_stop() {
        let config = SessionConfig::new();
        let (local, _peer) = MemoryTransport::pair();
        let stop = CancellationToken::new();
        stop.cancel();

        let reason = serve_until(Box::new(local), &config, None, Some(&stop))
            .await
            .unwrap();
        assert_eq!(reason, CloseReason::Stopped);
    }

    #[tokio::test]
    async fn test_ws_server_echo_and_shutdown() {
        let server = WsServer::bind("127.0.0.1:0", echo_config(None)).await.unwrap();
        assert!(server.ws_url().starts_with("ws://127.0.0.1:"));

        let transport = dial(&server.ws_url(), &SessionConfig::new()).await.unwrap();
        let (mut reader, mut writer) = transport.split();

        writer.write_frame(FrameKind::Text, b"echo".to_vec()).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), Frame::text("echo"));
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.connections()[0].state(), crate::ConnectionState::Open);

        server.shutdown().await;

        assert_eq!(server.connection_count(), 0);
        loop {
            match reader.read_frame().await {
                Ok(frame) if frame.kind == FrameKind::Close => continue,
                Ok(other) => panic!("unexpected frame {other:?}"),
                Err(_) => break,
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_upgrade_starts_no_connection() {
        let connected = Arc::new(AtomicUsize::new(0));
        let config = {
            let connected = Arc::clone(&connected);
            SessionConfig::builder()
                .before_upgrade(|_, _| UpgradeDecision::reject(403, "go away"))
                .on_connected(move |_, _| {
                    connected.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap()
        };
        let server = WsServer::bind("127.0.0.1:0", config).await.unwrap();

        let result = dial(&server.ws_url(), &SessionConfig::new()).await;

        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(server.connection_count(), 0);
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pending_handshake() {
        let connected = Arc::new(AtomicUsize::new(0));
        let config = {
            let connected = Arc::clone(&connected);
            SessionConfig::builder()
                .on_connected(move |_, _| {
                    connected.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap()
        };
        let server = WsServer::bind("127.0.0.1:0", config).await.unwrap();

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown().await;

        let url = format!("{}/ws", server.ws_url());
        let handshake = tokio_tungstenite::client_async(url, stream).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handshake.is_err());
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_disconnect_removes_connection() {
        let server = WsServer::bind("127.0.0.1:0", echo_config(None)).await.unwrap();

        let transport = dial(&server.ws_url(), &SessionConfig::new()).await.unwrap();
        until(|| server.connection_count() == 1).await;

        drop(transport);
        until(|| server.connection_count() == 0).await;

        server.shutdown().await;
    }
}
