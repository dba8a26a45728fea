//! Client-side session driver.
//!
//! [`ClientSession::run`] keeps one connection alive across reconnects:
//!
//! ```text
//! dial ──ok──► run until Closed ──┐
//!   └──err──► disconnected hook ──┴──► stopped? ──no──► sleep reconnect interval ──► dial
//!                                          └──yes──► exit
//! ```
//!
//! A stop raised while connected or while sleeping ends the loop at once.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::transport::{Connector, WsConnector};

use super::acquire;

// ============================================================================
// ClientExit
// ============================================================================

/// Summary returned when the client loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientExit {
    /// Dial attempts that completed, successfully or not.
    pub dial_attempts: u32,
    /// Dials that produced an open connection.
    pub connections: u32,
}

// ============================================================================
// ClientSession
// ============================================================================

/// Client driver with auto-reconnect.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use duplex_ws::{ClientSession, SessionConfig};
///
/// # async fn example() -> duplex_ws::Result<()> {
/// let config = SessionConfig::builder()
///     .on_connected(|conn, _| {
///         let buffer = conn.alloc_buffer();
///         buffer.write(b"hello");
///         let _ = conn.try_send(buffer);
///     })
///     .reconnect_interval(Duration::from_secs(1))
///     .build()?;
///
/// let handle = ClientSession::new("ws://127.0.0.1:9000/ws", config).spawn();
/// tokio::time::sleep(Duration::from_secs(10)).await;
/// handle.stop();
/// let exit = handle.join().await?;
/// println!("{} dial attempts", exit.dial_attempts);
/// # Ok(())
/// # }
/// ```
pub struct ClientSession {
    connector: Arc<dyn Connector>,
    config: Arc<SessionConfig>,
}

impl ClientSession {
    /// Creates a session dialing a WebSocket URL.
    #[must_use]
    pub fn new(url: impl Into<String>, config: Arc<SessionConfig>) -> Self {
        Self::with_connector(Arc::new(WsConnector::new(url)), config)
    }

    /// Creates a session using a custom connector.
    #[must_use]
    pub fn with_connector(connector: Arc<dyn Connector>, config: Arc<SessionConfig>) -> Self {
        Self { connector, config }
    }

    /// Returns the session configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    /// Runs the dial/reconnect loop until `stop` is cancelled.
    ///
    /// Dial and transport failures are absorbed into reconnects.
    pub async fn run(&self, stop: CancellationToken) -> ClientExit {
        let endpoint = self.connector.target();
        let delay = self.config.tunables().reconnect_interval();
        let conn = acquire(&self.config);
        let mut exit = ClientExit::default();

        loop {
            let dialed = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                dialed = self.connector.connect(&self.config) => dialed,
            };
            exit.dial_attempts += 1;

            match dialed {
                Ok(transport) => {
                    exit.connections += 1;
                    match conn.run(transport, Role::Client, Some(&stop)).await {
                        Ok(reason) => info!(endpoint, id = %conn.id(), %reason, "Connection closed"),
                        Err(e) => warn!(endpoint, error = %e, "Connection could not run"),
                    }
                }
                Err(e) => {
                    if e.is_transport_error() {
                        warn!(endpoint, attempt = exit.dial_attempts, error = %e, "Dial failed");
                    } else {
                        error!(endpoint, attempt = exit.dial_attempts, error = %e, "Dial misconfigured");
                    }
                    conn.dial_failed();
                }
            }

            if stop.is_cancelled() {
                break;
            }

            debug!(
                endpoint,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting after delay"
            );
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        conn.release();
        info!(endpoint, attempts = exit.dial_attempts, "Client session stopped");
        exit
    }

    /// Runs the loop on a new task.
    #[must_use]
    pub fn spawn(self) -> ClientHandle {
        let stop = CancellationToken::new();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move { self.run(stop).await })
        };
        ClientHandle { stop, task }
    }
}

// ============================================================================
// ClientHandle
// ============================================================================

/// Handle to a spawned [`ClientSession`].
pub struct ClientHandle {
    stop: CancellationToken,
    task: JoinHandle<ClientExit>,
}

impl ClientHandle {
    /// Raises the stop signal. The loop exits without sleeping.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Returns `true` once the loop has exited.
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the loop task panicked.
    pub async fn join(self) -> Result<ClientExit> {
        self.task
            .await
            .map_err(|e| Error::connection(format!("client session task failed: {e}")))
    }
}

// ============================================================================
// Tests
// ============================================================================
