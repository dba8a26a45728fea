//! Connection type.
//!
//! # Send API
//!
//! | Method | Blocking | Frame kind |
//! |--------|----------|------------|
//! | [`send`](Connection::send) | waits for queue space | buffer's own |
//! | [`try_send`](Connection::try_send) | fails with `QueueFull` | buffer's own |
//! | [`send_text_buffer`](Connection::send_text_buffer) | waits | text |
//! | [`send_binary_buffer`](Connection::send_binary_buffer) | waits | binary |
//! | [`send_text`](Connection::send_text) | waits | text |
//! | [`send_bytes`](Connection::send_bytes) | waits | binary |
//! | [`send_json`](Connection::send_json) | waits | text |
//! | [`send_close`](Connection::send_close) | waits | close |
//!
//! Hooks run on the connection's own tasks and cannot `.await`; they should
//! use [`try_send`](Connection::try_send).

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::buffer::MessageBuffer;
use crate::config::{Attachment, SessionConfig};
use crate::error::{Error, Result};
use crate::frame::FrameKind;
use crate::identifiers::ConnectionId;
use crate::transport::Transport;

use super::heartbeat::{self, Liveness};
use super::io;
use super::pool::PoolRef;
use super::shutdown::Shutdown;
use super::state::{CloseReason, ConnectionState, Role};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug)]
struct Lifecycle {
    refs: usize,
    state: ConnectionState,
    running: bool,
    recycled: bool,
}

impl Lifecycle {
    fn fresh() -> Self {
        Self {
            refs: 1,
            state: ConnectionState::Idle,
            running: false,
            recycled: false,
        }
    }

    /// Claims the connection for its pool once nothing holds or runs it.
    fn take_recyclable(&mut self) -> bool {
        if self.refs == 0 && !self.running && !self.recycled {
            self.recycled = true;
            true
        } else {
            false
        }
    }
}

/// Handles valid for one open period.
struct Link {
    outbound: mpsc::Sender<MessageBuffer>,
    shutdown: Arc<Shutdown>,
    capacity: usize,
}

/// Config held by pooled connections between uses.
fn detached_config() -> Arc<SessionConfig> {
    static DETACHED: OnceLock<Arc<SessionConfig>> = OnceLock::new();
    Arc::clone(DETACHED.get_or_init(SessionConfig::new))
}

// ============================================================================
// Connection
// ============================================================================

/// A duplex message connection.
///
/// Always handled as `Arc<Connection>`. The `Arc` keeps the memory alive;
/// the explicit reference count decides when the connection may be reused.
///
/// # Example
///
/// ```no_run
/// use duplex_ws::{Connection, MemoryTransport, Role, SessionConfig};
///
/// # async fn example() -> duplex_ws::Result<()> {
/// let (local, _peer) = MemoryTransport::pair();
/// let conn = Connection::new(SessionConfig::new());
///
/// let runner = {
///     let conn = conn.clone();
///     tokio::spawn(async move { conn.run(Box::new(local), Role::Client, None).await })
/// };
///
/// conn.send_text("hello").await?;
/// conn.close();
/// # let _ = runner.await;
/// conn.release();
/// # Ok(())
/// # }
/// ```
pub struct Connection {
    id: ConnectionId,
    config: RwLock<Arc<SessionConfig>>,
    attachment: RwLock<Option<Attachment>>,
    lifecycle: Mutex<Lifecycle>,
    link: Mutex<Option<Link>>,
    liveness: Liveness,
    pool: Mutex<Option<PoolRef>>,
}

impl Connection {
    /// Creates an idle connection with one reference.
    #[must_use]
    pub fn new(config: Arc<SessionConfig>) -> Arc<Self> {
        Self::build(config, None)
    }

    pub(crate) fn with_pool(config: Arc<SessionConfig>, pool: PoolRef) -> Arc<Self> {
        Self::build(config, Some(pool))
    }

    fn build(config: Arc<SessionConfig>, pool: Option<PoolRef>) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            config: RwLock::new(config),
            attachment: RwLock::new(None),
            lifecycle: Mutex::new(Lifecycle::fresh()),
            link: Mutex::new(None),
            liveness: Liveness::new(),
            pool: Mutex::new(pool),
        })
    }

    /// Prepares a pooled connection for its next user.
    pub(crate) fn reset(&self, config: Arc<SessionConfig>, pool: PoolRef) {
        *self.lifecycle.lock() = Lifecycle::fresh();
        *self.config.write() = config;
        *self.attachment.write() = None;
        *self.link.lock() = None;
        *self.pool.lock() = Some(pool);
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    /// Returns `true` if the connection accepts messages.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.shutdown.is_raised())
    }

    /// Returns `true` while [`run`](Self::run) is in progress.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().running
    }

    /// Returns the explicit reference count.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.lifecycle.lock().refs
    }

    /// Returns the per-connection attachment.
    #[must_use]
    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.read().clone()
    }

    /// Replaces the per-connection attachment.
    pub fn set_attachment(&self, attachment: Option<Attachment>) {
        *self.attachment.write() = attachment;
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> Arc<SessionConfig> {
        Arc::clone(&self.config.read())
    }

    /// Returns the number of messages waiting in the outbound queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.link
            .lock()
            .as_ref()
            .map_or(0, |link| link.capacity - link.outbound.capacity())
    }

    /// Returns the time since the last inbound frame.
    #[must_use]
    pub fn last_activity(&self) -> Duration {
        self.liveness.idle()
    }

    /// Allocates a message buffer the way this connection does.
    #[must_use]
    pub fn alloc_buffer(&self) -> MessageBuffer {
        self.config.read().alloc_buffer()
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }
}

// ============================================================================
// Connection - Reference Counting
// ============================================================================

impl Connection {
    /// Adds a reference.
    pub fn add_ref(&self) {
        self.lifecycle.lock().refs += 1;
    }

    /// Drops a reference.
    ///
    /// The last release of a connection that is not running returns it to
    /// its pool. Releasing an open connection does not close it.
    ///
    /// # Panics
    ///
    /// Panics if the reference count is already zero.
    pub fn release(self: &Arc<Self>) {
        let recycle = {
            let mut lifecycle = self.lifecycle.lock();
            assert!(
                lifecycle.refs > 0,
                "connection {} released more times than it was referenced",
                self.id
            );
            lifecycle.refs -= 1;
            lifecycle.take_recyclable()
        };

        if recycle {
            self.recycle();
        }
    }

    /// Marks the connection as pooled. `Ok(false)` if it already is.
    pub(crate) fn claim_for_pool(&self) -> Result<bool> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.running {
            return Err(Error::connection(format!(
                "connection {} is still running and cannot be pooled",
                self.id
            )));
        }
        if lifecycle.recycled {
            return Ok(false);
        }
        lifecycle.recycled = true;
        Ok(true)
    }

    pub(crate) fn detach(&self) {
        *self.config.write() = detached_config();
        *self.attachment.write() = None;
    }

    fn recycle(self: &Arc<Self>) {
        let pool = self.pool.lock().as_ref().and_then(PoolRef::upgrade);
        self.detach();
        match pool {
            Some(pool) => {
                trace!(id = %self.id, "Connection returned to pool");
                pool.push_idle(Arc::clone(self));
            }
            None => trace!(id = %self.id, "Connection retired"),
        }
    }
}

// ============================================================================
// Connection - Send API
// ============================================================================

impl Connection {
    fn link_handles(&self) -> Result<(mpsc::Sender<MessageBuffer>, Arc<Shutdown>, usize)> {
        match self.link.lock().as_ref() {
            Some(link) if !link.shutdown.is_raised() => Ok((
                link.outbound.clone(),
                Arc::clone(&link.shutdown),
                link.capacity,
            )),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Queues a buffer, waiting while the queue is full.
    ///
    /// The buffer is sent with its own frame kind. The queue takes over the
    /// handle; on error it is released.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is not open or
    /// closes while waiting.
    pub async fn send(&self, buffer: MessageBuffer) -> Result<()> {
        let (outbound, shutdown, _) = self.link_handles()?;
        tokio::select! {
            biased;
            () = shutdown.raised() => Err(Error::ConnectionClosed),
            sent = outbound.send(buffer) => sent.map_err(|_| Error::ConnectionClosed),
        }
    }

    /// Queues a buffer without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::QueueFull`] if the outbound queue is at capacity
    /// - [`Error::ConnectionClosed`] if the connection is not open
    pub fn try_send(&self, buffer: MessageBuffer) -> Result<()> {
        let (outbound, _, capacity) = self.link_handles()?;
        outbound.try_send(buffer).map_err(|e| match e {
            TrySendError::Full(_) => Error::queue_full(capacity),
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    /// Tags the buffer as text and queues it.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_text_buffer(&self, buffer: MessageBuffer) -> Result<()> {
        buffer.set_frame_kind(FrameKind::Text);
        self.send(buffer).await
    }

    /// Tags the buffer as binary and queues it.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_binary_buffer(&self, buffer: MessageBuffer) -> Result<()> {
        buffer.set_frame_kind(FrameKind::Binary);
        self.send(buffer).await
    }

    /// Copies `text` into a new buffer and queues it as a text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferOverflow`] if the text exceeds a pooled buffer
    /// - see [`send`](Self::send)
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let buffer = self.filled(text.as_bytes())?;
        self.send_text_buffer(buffer).await
    }

    /// Copies `bytes` into a new buffer and queues it as a binary frame.
    ///
    /// # Errors
    ///
    /// - [`Error::BufferOverflow`] if the data exceeds a pooled buffer
    /// - see [`send`](Self::send)
    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        let buffer = self.filled(bytes)?;
        self.send_binary_buffer(buffer).await
    }

    /// Serializes `value` into a new buffer and queues it as a text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if serialization fails
    /// - [`Error::BufferOverflow`] if the document exceeds a pooled buffer
    /// - see [`send`](Self::send)
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let buffer = self.alloc_buffer();
        buffer.write_json(value)?;
        self.send_text_buffer(buffer).await
    }

    /// Queues a close frame. The connection closes once it is written.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_close(&self) -> Result<()> {
        self.send(MessageBuffer::control(FrameKind::Close)).await
    }

    /// Requests shutdown without waiting for queued messages.
    ///
    /// No-op unless the connection is open.
    pub fn close(&self) {
        if let Some(link) = self.link.lock().as_ref()
            && link.shutdown.trigger(CloseReason::Local)
        {
            debug!(id = %self.id, "Close requested");
        }
    }

    fn filled(&self, bytes: &[u8]) -> Result<MessageBuffer> {
        let buffer = self.alloc_buffer();
        let accepted = buffer.write(bytes);
        if accepted < bytes.len() {
            return Err(Error::buffer_overflow(bytes.len(), accepted));
        }
        Ok(buffer)
    }
}

// ============================================================================
// Connection - Lifecycle
// ============================================================================

impl Connection {
    /// Binds `transport` and runs the connection until it closes.
    ///
    /// Fires the connected hook, spawns the loops, waits for the first
    /// terminal condition, joins the loops, releases queued messages and
    /// fires the disconnected hook. Cancelling `stop` closes the
    /// connection with [`CloseReason::Stopped`].
    ///
    /// A connection may be run again after it closed; the client driver
    /// reuses one connection across reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the connection is already running.
    pub async fn run(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
        role: Role,
        stop: Option<&CancellationToken>,
    ) -> Result<CloseReason> {
        let config = self.config();
        let capacity = config.tunables().queue_capacity;
        let shutdown = Arc::new(Shutdown::new(stop));
        let (outbound, queue) = mpsc::channel(capacity);

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.running {
                return Err(Error::connection(format!(
                    "connection {} is already running",
                    self.id
                )));
            }
            lifecycle.running = true;
            lifecycle.state = ConnectionState::Open;
        }

        *self.link.lock() = Some(Link {
            outbound: outbound.clone(),
            shutdown: Arc::clone(&shutdown),
            capacity,
        });
        self.liveness.touch();
        debug!(id = %self.id, ?role, "Connection open");

        if let Some(hook) = &config.hooks().on_connected {
            hook(self, config.attachment());
        }

        let (reader, writer) = transport.split();
        let mut loops = JoinSet::new();
        loops.spawn(io::recv_loop(
            Arc::clone(self),
            reader,
            outbound.clone(),
            Arc::clone(&shutdown),
            Arc::clone(&config),
        ));
        loops.spawn(io::send_loop(
            Arc::clone(self),
            writer,
            queue,
            Arc::clone(&shutdown),
        ));
        if config.tunables().heartbeat_interval().is_some() {
            loops.spawn(heartbeat::heartbeat_loop(
                Arc::clone(self),
                Arc::clone(&config),
                Arc::clone(&shutdown),
                outbound.clone(),
                role,
            ));
        }
        drop(outbound);

        loop {
            tokio::select! {
                () = shutdown.raised() => break,
                joined = loops.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        error!(id = %self.id, error = %e, "Connection loop panicked");
                        shutdown.trigger(CloseReason::LoopPanicked);
                    }
                    None => break,
                },
            }
        }

        self.lifecycle.lock().state = ConnectionState::Closing;
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(id = %self.id, error = %e, "Connection loop panicked during shutdown");
            }
        }

        let reason = shutdown.reason();
        *self.link.lock() = None;
        self.lifecycle.lock().state = ConnectionState::Closed;
        debug!(id = %self.id, %reason, "Connection closed");

        if let Some(hook) = &config.hooks().on_disconnected {
            hook(self, config.attachment());
        }

        let recycle = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.running = false;
            lifecycle.take_recyclable()
        };
        if recycle {
            self.recycle();
        }

        Ok(reason)
    }

    /// Records a failed dial: straight to `Closed`, disconnected hook fires.
    pub(crate) fn dial_failed(self: &Arc<Self>) {
        self.lifecycle.lock().state = ConnectionState::Closed;
        let config = self.config();
        if let Some(hook) = &config.hooks().on_disconnected {
            hook(self, config.attachment());
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.lifecycle.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &lifecycle.state)
            .field("refs", &lifecycle.refs)
            .field("running", &lifecycle.running)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::task::JoinHandle;
    use tokio::time::Instant;
    use tokio_test::{assert_pending, assert_ready_ok};

    use crate::config::DEFAULT_QUEUE_CAPACITY;
    use crate::connection::ConnectionPool;
    use crate::frame::Frame;
    use crate::transport::MemoryTransport;

    fn start(
        config: Arc<SessionConfig>,
        role: Role,
        transport: MemoryTransport,
    ) -> (Arc<Connection>, JoinHandle<Result<CloseReason>>) {
        let conn = Connection::new(config);
        let runner = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.run(Box::new(transport), role, None).await })
        };
        (conn, runner)
    }

    async fn until(condition: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn test_send_on_idle_connection_fails() {
        let conn = Connection::new(SessionConfig::new());
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.is_open());

        let result = conn.send_text("nobody listens").await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(matches!(
            conn.try_send(conn.alloc_buffer()),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (local, mut peer) = MemoryTransport::pair();
        let (conn, _runner) = start(SessionConfig::new(), Role::Server, local);
        until(|| conn.is_open()).await;

        conn.send_text("one").await.unwrap();
        conn.send_bytes(&[2, 2]).await.unwrap();
        conn.send_json(&serde_json::json!({"n": 3})).await.unwrap();

        assert_eq!(peer.recv_frame().await, Some(Frame::text("one")));
        assert_eq!(peer.recv_frame().await, Some(Frame::binary(vec![2, 2])));
        assert_eq!(peer.recv_frame().await, Some(Frame::text(r#"{"n":3}"#)));
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_fire_once_per_open_period() {
        let connected = counter();
        let disconnected = counter();
        let config = {
            let connected = Arc::clone(&connected);
            let disconnected = Arc::clone(&disconnected);
            SessionConfig::builder()
                .on_connected(move |_, _| {
                    connected.fetch_add(1, Ordering::SeqCst);
                })
                .on_disconnected(move |conn, _| {
                    assert_eq!(conn.state(), ConnectionState::Closed);
                    disconnected.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap()
        };

        let (local, peer) = MemoryTransport::pair();
        let (conn, runner) = start(config, Role::Server, local);
        until(|| conn.is_open()).await;

        peer.send_frame(Frame::control(FrameKind::Close)).await.unwrap();
        conn.close();
        let reason = runner.await.unwrap().unwrap();

        assert!(matches!(reason, CloseReason::PeerClosed | CloseReason::Local));
        conn.close();
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_close_frame_ends_connection() {
        let (local, peer) = MemoryTransport::pair();
        let (conn, runner) = start(SessionConfig::new(), Role::Server, local);
        until(|| conn.is_open()).await;

        peer.send_frame(Frame::control(FrameKind::Close)).await.unwrap();

        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::PeerClosed);
        assert!(!conn.is_open());
        assert!(matches!(conn.send_text("late").await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_peer_drop_is_read_failure() {
        let (local, peer) = MemoryTransport::pair();
        let (_conn, runner) = start(SessionConfig::new(), Role::Client, local);

        drop(peer);

        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::ReadFailed);
    }

    #[tokio::test]
    async fn test_queued_close_frame_is_written_then_closes() {
        let (local, mut peer) = MemoryTransport::pair();
        let (conn, runner) = start(SessionConfig::new(), Role::Client, local);
        until(|| conn.is_open()).await;

        conn.send_text("bye").await.unwrap();
        conn.send_close().await.unwrap();

        assert_eq!(peer.recv_frame().await, Some(Frame::text("bye")));
        assert_eq!(peer.recv_frame().await, Some(Frame::control(FrameKind::Close)));
        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::Local);
    }

    #[tokio::test]
    async fn test_stop_token_closes_as_stopped() {
        let (local, _peer) = MemoryTransport::pair();
        let conn = Connection::new(SessionConfig::new());
        let stop = CancellationToken::new();
        let runner = {
            let conn = Arc::clone(&conn);
            let stop = stop.clone();
            tokio::spawn(async move { conn.run(Box::new(local), Role::Client, Some(&stop)).await })
        };
        until(|| conn.is_open()).await;

        stop.cancel();

        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::Stopped);
    }

    #[tokio::test]
    async fn test_run_twice_concurrently_fails() {
        let (local, _peer) = MemoryTransport::pair();
        let (second, _peer2) = MemoryTransport::pair();
        let (conn, _runner) = start(SessionConfig::new(), Role::Server, local);
        until(|| conn.is_open()).await;

        let result = conn.run(Box::new(second), Role::Server, None).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_inbound_ping_is_answered_with_pong() {
        let (local, mut peer) = MemoryTransport::pair();
        let (conn, _runner) = start(SessionConfig::new(), Role::Server, local);
        until(|| conn.is_open()).await;

        peer.send_frame(Frame::control(FrameKind::Ping)).await.unwrap();

        assert_eq!(peer.recv_frame().await, Some(Frame::control(FrameKind::Pong)));
    }

    #[tokio::test]
    async fn test_message_hook_can_retain_buffer() {
        let kept = Arc::new(Mutex::new(Vec::new()));
        let config = {
            let kept = Arc::clone(&kept);
            SessionConfig::builder()
                .on_message(move |_, message, _| kept.lock().push(message))
                .build()
                .unwrap()
        };

        let (local, peer) = MemoryTransport::pair();
        let (_conn, _runner) = start(config, Role::Server, local);

        peer.send_frame(Frame::binary(vec![1, 2, 3])).await.unwrap();
        until(|| !kept.lock().is_empty()).await;

        let message = kept.lock().pop().unwrap();
        assert_eq!(message.ref_count(), 1);
        assert_eq!(message.frame_kind(), FrameKind::Binary);
        assert_eq!(message.to_vec(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_oversized_inbound_message_is_truncated() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let config = {
            let sizes = Arc::clone(&sizes);
            SessionConfig::builder()
                .buffer_size(4)
                .pooled_buffers()
                .on_message(move |_, message, _| sizes.lock().push(message.len()))
                .build()
                .unwrap()
        };

        let (local, peer) = MemoryTransport::pair();
        let (_conn, _runner) = start(config, Role::Server, local);

        peer.send_frame(Frame::text("truncated")).await.unwrap();
        until(|| !sizes.lock().is_empty()).await;

        assert_eq!(sizes.lock().as_slice(), &[4]);
    }

    #[tokio::test]
    async fn test_send_text_overflowing_pooled_buffer_fails() {
        let config = SessionConfig::builder()
            .buffer_size(4)
            .pooled_buffers()
            .build()
            .unwrap();
        let (local, _peer) = MemoryTransport::pair();
        let (conn, _runner) = start(config, Role::Client, local);
        until(|| conn.is_open()).await;

        let result = conn.send_text("too long").await;
        assert!(matches!(
            result,
            Err(Error::BufferOverflow {
                needed: 8,
                available: 4
            })
        ));
        assert_eq!(conn.queued(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_peer_reads() {
        let (local, mut peer) = MemoryTransport::pair_with_capacity(1);
        let (conn, _runner) = start(SessionConfig::new(), Role::Server, local);
        until(|| conn.is_open()).await;

        // One frame lands in the peer inbox, the next one stalls the writer.
        for _ in 0..DEFAULT_QUEUE_CAPACITY {
            conn.try_send(conn.alloc_buffer()).unwrap();
        }
        until(|| conn.queued() == DEFAULT_QUEUE_CAPACITY - 2).await;
        conn.try_send(conn.alloc_buffer()).unwrap();
        conn.try_send(conn.alloc_buffer()).unwrap();

        assert!(matches!(
            conn.try_send(conn.alloc_buffer()),
            Err(Error::QueueFull { capacity: 100 })
        ));
        assert_eq!(conn.queued(), DEFAULT_QUEUE_CAPACITY);

        let mut blocked = tokio_test::task::spawn(conn.send_text("overflow"));
        assert_pending!(blocked.poll());
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        assert_pending!(blocked.poll());

        assert!(peer.recv_frame().await.is_some());
        until(|| blocked.is_woken()).await;
        assert_ready_ok!(blocked.poll());
    }

    #[tokio::test]
    async fn test_unsent_messages_released_on_close() {
        let pool = crate::buffer::BufferPool::new(16);
        let config = SessionConfig::builder()
            .buffer_size(16)
            .buffer_pool(pool.clone())
            .build()
            .unwrap();
        let (local, _peer) = MemoryTransport::pair_with_capacity(1);
        let (conn, runner) = start(config, Role::Server, local);
        until(|| conn.is_open()).await;

        for _ in 0..10 {
            conn.try_send(conn.alloc_buffer()).unwrap();
        }
        conn.close();
        runner.await.unwrap().unwrap();

        assert_eq!(pool.idle_count(), 10);
    }

    #[tokio::test]
    async fn test_panicking_hook_ends_connection() {
        let config = SessionConfig::builder()
            .on_message(|_, _, _| panic!("hook failure"))
            .build()
            .unwrap();
        let (local, peer) = MemoryTransport::pair();
        let (_conn, runner) = start(config, Role::Server, local);

        peer.send_frame(Frame::text("boom")).await.unwrap();

        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::LoopPanicked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_within_one_tick() {
        let config = SessionConfig::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .heartbeat_timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let (local, _peer) = MemoryTransport::pair();
        let started = Instant::now();
        let (_conn, runner) = start(config, Role::Server, local);

        let reason = runner.await.unwrap().unwrap();

        assert_eq!(reason, CloseReason::HeartbeatTimeout);
        let elapsed = started.elapsed();
        assert!(elapsed > Duration::from_millis(300), "closed early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(400), "closed late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_pongs_keep_connection_alive() {
        let config = SessionConfig::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .heartbeat_timeout(Duration::from_millis(300))
            .build()
            .unwrap();
        let (local, peer) = MemoryTransport::pair();
        let (conn, _runner) = start(config, Role::Server, local);

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            peer.send_frame(Frame::control(FrameKind::Pong)).await.unwrap();
        }

        assert!(conn.is_open());
        assert!(conn.last_activity() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_pings_on_rounded_cadence() {
        let before_ping = counter();
        let ticks = counter();
        let config = {
            let before_ping = Arc::clone(&before_ping);
            let ticks = Arc::clone(&ticks);
            SessionConfig::builder()
                .heartbeat_interval(Duration::from_millis(100))
                .heartbeat_timeout(Duration::from_secs(60))
                .ping_interval(Duration::from_millis(250))
                .on_before_send_ping(move |_, _| {
                    before_ping.fetch_add(1, Ordering::SeqCst);
                })
                .on_heartbeat(move |_, _| {
                    ticks.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap()
        };
        let (local, mut peer) = MemoryTransport::pair();
        let started = Instant::now();
        let (_conn, _runner) = start(config, Role::Client, local);

        assert_eq!(peer.recv_frame().await, Some(Frame::control(FrameKind::Ping)));

        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(before_ping.load(Ordering::SeqCst), 1);
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_never_pings() {
        let config = SessionConfig::builder()
            .heartbeat_interval(Duration::from_millis(100))
            .heartbeat_timeout(Duration::from_secs(60))
            .ping_interval(Duration::from_millis(100))
            .build()
            .unwrap();
        let (local, mut peer) = MemoryTransport::pair();
        let (_conn, _runner) = start(config, Role::Server, local);

        let frame = tokio::time::timeout(Duration::from_secs(2), peer.recv_frame()).await;
        assert!(frame.is_err(), "server sent {frame:?}");
    }

    #[tokio::test]
    async fn test_release_while_open_keeps_connection_running() {
        let pool = ConnectionPool::new();
        let config = SessionConfig::builder()
            .connection_pool(pool.clone())
            .build()
            .unwrap();
        let conn = pool.get(&config);
        let (local, mut peer) = MemoryTransport::pair();
        let runner = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.run(Box::new(local), Role::Server, None).await })
        };
        until(|| conn.is_open()).await;

        conn.release();
        assert_eq!(conn.ref_count(), 0);
        assert!(conn.is_open());
        assert_eq!(pool.idle_count(), 0);

        conn.send_text("still here").await.unwrap();
        assert_eq!(peer.recv_frame().await, Some(Frame::text("still here")));

        conn.close();
        runner.await.unwrap().unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_release_after_close_returns_to_pool() {
        let pool = ConnectionPool::new();
        let config = SessionConfig::builder()
            .connection_pool(pool.clone())
            .build()
            .unwrap();
        let conn = pool.get(&config);
        let id = conn.id();
        let (local, _peer) = MemoryTransport::pair();
        let runner = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.run(Box::new(local), Role::Server, None).await })
        };
        until(|| conn.is_open()).await;

        conn.close();
        runner.await.unwrap().unwrap();
        assert_eq!(pool.idle_count(), 0);

        conn.release();
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.get(&config);
        assert_eq!(reused.id(), id);
        assert_eq!(reused.ref_count(), 1);
        assert_eq!(reused.state(), ConnectionState::Idle);
        assert!(Arc::ptr_eq(&reused.config(), &config));
    }

    #[test]
    #[should_panic(expected = "released more times")]
    fn test_release_below_zero_panics() {
        let conn = Connection::new(SessionConfig::new());
        conn.release();
        conn.release();
    }

    #[test]
    fn test_add_ref_defers_recycling() {
        let pool = ConnectionPool::new();
        let config = SessionConfig::new();
        let conn = pool.get(&config);

        conn.add_ref();
        conn.release();
        assert_eq!(pool.idle_count(), 0);
        conn.release();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_dial_failure_fires_disconnected() {
        let disconnected = counter();
        let config = {
            let disconnected = Arc::clone(&disconnected);
            SessionConfig::builder()
                .on_disconnected(move |_, _| {
                    disconnected.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap()
        };
        let conn = Connection::new(config);

        conn.dial_failed();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }
}
