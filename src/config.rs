//! Session configuration.
//!
//! A [`SessionConfig`] bundles the user hooks, the timing tunables, optional
//! pools, an optional proxy and an opaque attachment. It is built once with
//! [`SessionConfig::builder()`] and then shared read-only as
//! `Arc<SessionConfig>` by every connection of a session.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use duplex_ws::SessionConfig;
//!
//! # fn example() -> duplex_ws::Result<()> {
//! let config = SessionConfig::builder()
//!     .on_message(|conn, msg, _attachment| {
//!         println!("{} sent {} bytes", conn.id(), msg.len());
//!     })
//!     .heartbeat_interval(Duration::from_secs(1))
//!     .ping_interval(Duration::from_secs(5))
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Defaults
//!
//! | Tunable | Default |
//! |---------|---------|
//! | heartbeat interval | disabled |
//! | heartbeat timeout | 3 × heartbeat interval |
//! | ping interval | disabled |
//! | reconnect interval | 5s |
//! | buffer size | 16 KiB |
//! | outbound queue capacity | 100 |

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferPool, MessageBuffer};
use crate::connection::{Connection, ConnectionPool};
use crate::error::{Error, Result};
use crate::transport::proxy::ProxyConfig;
use crate::transport::upgrade::{UpgradeDecision, UpgradeRequest};

// ============================================================================
// Constants
// ============================================================================

/// Reconnect delay used when none is configured.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Message buffer size used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Outbound queue bound used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Heartbeat timeout as a multiple of the heartbeat interval.
const DEFAULT_TIMEOUT_FACTOR: u32 = 3;

// ============================================================================
// Hook Types
// ============================================================================

/// Opaque user value handed to every hook.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// Lifecycle hook: connected, disconnected, heartbeat tick, before ping.
pub type ConnectionHook = Arc<dyn Fn(&Arc<Connection>, Option<&Attachment>) + Send + Sync>;

/// Message hook.
///
/// The buffer handle passed in is the hook's own reference: keep it to
/// retain the message, drop it when done.
pub type MessageHook =
    Arc<dyn Fn(&Arc<Connection>, MessageBuffer, Option<&Attachment>) + Send + Sync>;

/// Client-side hook returning extra handshake headers.
pub type HeadersHook = Arc<dyn Fn(Option<&Attachment>) -> Vec<(String, String)> + Send + Sync>;

/// Server-side hook deciding whether a handshake may proceed.
pub type BeforeUpgradeHook =
    Arc<dyn Fn(&UpgradeRequest, Option<&Attachment>) -> UpgradeDecision + Send + Sync>;

// ============================================================================
// Hooks
// ============================================================================

/// Set of optional user callbacks.
///
/// An absent hook is a no-op. Hooks run on the connection's loop tasks and
/// must not block or panic; a panicking hook ends the loop it runs on.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Called when a connection reaches `Open`, before its loops start.
    pub on_connected: Option<ConnectionHook>,
    /// Called once when a connection reaches `Closed`, or when a dial fails.
    pub on_disconnected: Option<ConnectionHook>,
    /// Called for every inbound text or binary frame.
    pub on_message: Option<MessageHook>,
    /// Called on every heartbeat tick.
    pub on_heartbeat: Option<ConnectionHook>,
    /// Called right before a ping is queued.
    pub on_before_send_ping: Option<ConnectionHook>,
    /// Supplies handshake headers (client role).
    pub headers: Option<HeadersHook>,
    /// Accepts or rejects a handshake (server role).
    pub before_upgrade: Option<BeforeUpgradeHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_heartbeat", &self.on_heartbeat.is_some())
            .field("on_before_send_ping", &self.on_before_send_ping.is_some())
            .field("headers", &self.headers.is_some())
            .field("before_upgrade", &self.before_upgrade.is_some())
            .finish()
    }
}

// ============================================================================
// Tunables
// ============================================================================

/// Timing and sizing knobs.
///
/// Durations are milliseconds so the struct can be loaded from JSON; zero
/// means "unset" for every field.
///
/// ```
/// use duplex_ws::Tunables;
///
/// let tunables = Tunables::from_json(r#"{"heartbeat_interval_ms": 1000}"#).unwrap();
/// assert_eq!(tunables.heartbeat_timeout().unwrap().as_millis(), 3000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Heartbeat tick; 0 disables the heartbeat loop.
    pub heartbeat_interval_ms: u64,
    /// Silence tolerated before the peer is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// Ping cadence, rounded up to whole heartbeat ticks; 0 disables pings.
    pub ping_interval_ms: u64,
    /// Delay between client reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Size of pooled message buffers and of fresh allocations.
    pub buffer_size: usize,
    /// Bound of the outbound queue.
    pub queue_capacity: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 0,
            heartbeat_timeout_ms: 0,
            ping_interval_ms: 0,
            reconnect_interval_ms: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Tunables {
    /// Parses tunables from a JSON document; missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Returns the heartbeat tick, or `None` if the heartbeat is disabled.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Returns the effective heartbeat timeout.
    ///
    /// `None` when the heartbeat is disabled.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        let interval = self.heartbeat_interval()?;
        if self.heartbeat_timeout_ms > 0 {
            Some(Duration::from_millis(self.heartbeat_timeout_ms))
        } else {
            Some(
                interval
                    .checked_mul(DEFAULT_TIMEOUT_FACTOR)
                    .unwrap_or(Duration::MAX),
            )
        }
    }

    /// Returns the ping cadence, or `None` if pings are disabled.
    #[must_use]
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    /// Returns the number of heartbeat ticks between two pings.
    ///
    /// Never less than one tick.
    #[must_use]
    pub fn ping_every_ticks(&self) -> Option<u64> {
        if self.heartbeat_interval_ms == 0 || self.ping_interval_ms == 0 {
            return None;
        }
        Some(self.ping_interval_ms.div_ceil(self.heartbeat_interval_ms).max(1))
    }

    /// Returns the effective reconnect delay.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        if self.reconnect_interval_ms > 0 {
            Duration::from_millis(self.reconnect_interval_ms)
        } else {
            DEFAULT_RECONNECT_INTERVAL
        }
    }

    /// Checks the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be greater than zero"));
        }
        if self.buffer_size == 0 {
            return Err(Error::config("buffer_size must be greater than zero"));
        }
        if self.ping_interval_ms > 0 && self.heartbeat_interval_ms == 0 {
            return Err(Error::config(
                "ping_interval requires a heartbeat_interval; pings are sent on heartbeat ticks",
            ));
        }
        if self.heartbeat_timeout_ms > 0 && self.heartbeat_interval_ms == 0 {
            return Err(Error::config(
                "heartbeat_timeout requires a heartbeat_interval",
            ));
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// SessionConfig
// ============================================================================

/// Shared, read-only configuration of a session.
pub struct SessionConfig {
    hooks: Hooks,
    tunables: Tunables,
    buffer_pool: Option<BufferPool>,
    connection_pool: Option<ConnectionPool>,
    proxy: Option<ProxyConfig>,
    attachment: Option<Attachment>,
}

impl SessionConfig {
    /// Returns a builder with default settings.
    #[inline]
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Returns a configuration with no hooks and default tunables.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hooks: Hooks::default(),
            tunables: Tunables::default(),
            buffer_pool: None,
            connection_pool: None,
            proxy: None,
            attachment: None,
        })
    }

    /// Returns the hooks.
    #[inline]
    #[must_use]
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Returns the tunables.
    #[inline]
    #[must_use]
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Returns the shared buffer pool, if any.
    #[inline]
    #[must_use]
    pub fn buffer_pool(&self) -> Option<&BufferPool> {
        self.buffer_pool.as_ref()
    }

    /// Returns the shared connection pool, if any.
    #[inline]
    #[must_use]
    pub fn connection_pool(&self) -> Option<&ConnectionPool> {
        self.connection_pool.as_ref()
    }

    /// Returns the proxy, if any.
    #[inline]
    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Returns the opaque attachment, if any.
    #[inline]
    #[must_use]
    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Allocates a message buffer from the pool, or a growable one of the
    /// configured buffer size.
    #[must_use]
    pub fn alloc_buffer(&self) -> MessageBuffer {
        match &self.buffer_pool {
            Some(pool) => pool.get(),
            None => MessageBuffer::with_capacity(self.tunables.buffer_size),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("hooks", &self.hooks)
            .field("tunables", &self.tunables)
            .field("buffer_pool", &self.buffer_pool)
            .field("connection_pool", &self.connection_pool.is_some())
            .field("proxy", &self.proxy)
            .field("attachment", &self.attachment.is_some())
            .finish()
    }
}

// ============================================================================
// SessionConfigBuilder
// ============================================================================

/// Builder for [`SessionConfig`].
#[derive(Default)]
pub struct SessionConfigBuilder {
    hooks: Hooks,
    tunables: Tunables,
    buffer_pool: Option<BufferPool>,
    connection_pool: Option<ConnectionPool>,
    proxy: Option<ProxyConfig>,
    attachment: Option<Attachment>,
    pool_buffers: bool,
}

impl SessionConfigBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connected hook.
    #[must_use]
    pub fn on_connected(
        mut self,
        hook: impl Fn(&Arc<Connection>, Option<&Attachment>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_connected = Some(Arc::new(hook));
        self
    }

    /// Sets the disconnected hook.
    #[must_use]
    pub fn on_disconnected(
        mut self,
        hook: impl Fn(&Arc<Connection>, Option<&Attachment>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_disconnected = Some(Arc::new(hook));
        self
    }

    /// Sets the message hook.
    #[must_use]
    pub fn on_message(
        mut self,
        hook: impl Fn(&Arc<Connection>, MessageBuffer, Option<&Attachment>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_message = Some(Arc::new(hook));
        self
    }

    /// Sets the heartbeat tick hook.
    #[must_use]
    pub fn on_heartbeat(
        mut self,
        hook: impl Fn(&Arc<Connection>, Option<&Attachment>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_heartbeat = Some(Arc::new(hook));
        self
    }

    /// Sets the hook called before each ping is queued.
    #[must_use]
    pub fn on_before_send_ping(
        mut self,
        hook: impl Fn(&Arc<Connection>, Option<&Attachment>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_before_send_ping = Some(Arc::new(hook));
        self
    }

    /// Sets the handshake headers hook (client role).
    #[must_use]
    pub fn headers(
        mut self,
        hook: impl Fn(Option<&Attachment>) -> Vec<(String, String)> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.headers = Some(Arc::new(hook));
        self
    }

    /// Sets the before-upgrade hook (server role).
    #[must_use]
    pub fn before_upgrade(
        mut self,
        hook: impl Fn(&UpgradeRequest, Option<&Attachment>) -> UpgradeDecision + Send + Sync + 'static,
    ) -> Self {
        self.hooks.before_upgrade = Some(Arc::new(hook));
        self
    }

    /// Replaces all tunables at once.
    #[must_use]
    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Sets the heartbeat tick; zero disables the heartbeat.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.tunables.heartbeat_interval_ms = millis(interval);
        self
    }

    /// Sets the heartbeat timeout.
    #[must_use]
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.tunables.heartbeat_timeout_ms = millis(timeout);
        self
    }

    /// Sets the ping cadence; zero disables pings.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.tunables.ping_interval_ms = millis(interval);
        self
    }

    /// Sets the client reconnect delay.
    #[must_use]
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.tunables.reconnect_interval_ms = millis(interval);
        self
    }

    /// Sets the message buffer size.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.tunables.buffer_size = size;
        self
    }

    /// Sets the outbound queue bound.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.tunables.queue_capacity = capacity;
        self
    }

    /// Shares a buffer pool between connections.
    #[must_use]
    pub fn buffer_pool(mut self, pool: BufferPool) -> Self {
        self.buffer_pool = Some(pool);
        self
    }

    /// Creates a private buffer pool sized by [`buffer_size`](Self::buffer_size)
    /// at build time, unless a pool was supplied.
    #[must_use]
    pub fn pooled_buffers(mut self) -> Self {
        self.pool_buffers = true;
        self
    }

    /// Shares a connection pool between sessions.
    #[must_use]
    pub fn connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.connection_pool = Some(pool);
        self
    }

    /// Routes client dials through a proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Sets the value passed to every hook.
    #[must_use]
    pub fn attachment(mut self, value: impl Any + Send + Sync) -> Self {
        self.attachment = Some(Arc::new(value));
        self
    }

    /// Validates and builds the shared configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the tunables are inconsistent or the
    /// proxy is not usable for dialing.
    pub fn build(self) -> Result<Arc<SessionConfig>> {
        self.tunables.validate()?;

        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }

        let buffer_pool = match self.buffer_pool {
            Some(pool) => Some(pool),
            None if self.pool_buffers => Some(BufferPool::new(self.tunables.buffer_size)),
            None => None,
        };

        Ok(Arc::new(SessionConfig {
            hooks: self.hooks,
            tunables: self.tunables,
            buffer_pool,
            connection_pool: self.connection_pool,
            proxy: self.proxy,
            attachment: self.attachment,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunables() {
        let tunables = Tunables::default();
        assert!(tunables.heartbeat_interval().is_none());
        assert!(tunables.heartbeat_timeout().is_none());
        assert!(tunables.ping_interval().is_none());
        assert_eq!(tunables.reconnect_interval(), DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(tunables.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(tunables.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_timeout_defaults_to_three_intervals() {
        let config = SessionConfig::builder()
            .heartbeat_interval(Duration::from_millis(200))
            .build()
            .unwrap();
        assert_eq!(
            config.tunables().heartbeat_timeout(),
            Some(Duration::from_millis(600))
        );
    }

    #[test]
    fn test_huge_interval_timeout_does_not_overflow() {
        let config = SessionConfig::builder()
            .heartbeat_interval(Duration::MAX)
            .build()
            .unwrap();
        let interval = config.tunables().heartbeat_interval().unwrap();
        let timeout = config.tunables().heartbeat_timeout().unwrap();
        assert!(timeout >= interval);
    }

    #[test]
    fn test_explicit_timeout_wins() {
        let tunables = Tunables {
            heartbeat_interval_ms: 100,
            heartbeat_timeout_ms: 250,
            ..Tunables::default()
        };
        assert_eq!(tunables.heartbeat_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_ping_cadence_rounds_up_to_ticks() {
        let tunables = Tunables {
            heartbeat_interval_ms: 1000,
            ping_interval_ms: 2500,
            ..Tunables::default()
        };
        assert_eq!(tunables.ping_every_ticks(), Some(3));

        let finer = Tunables {
            heartbeat_interval_ms: 1000,
            ping_interval_ms: 10,
            ..Tunables::default()
        };
        assert_eq!(finer.ping_every_ticks(), Some(1));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let tunables = Tunables::from_json(r#"{"ping_interval_ms": 5000, "heartbeat_interval_ms": 1000}"#)
            .unwrap();
        assert_eq!(tunables.ping_every_ticks(), Some(5));
        assert_eq!(tunables.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(Tunables::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let result = SessionConfig::builder().queue_capacity(0).build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn test_ping_without_heartbeat_rejected() {
        let result = SessionConfig::builder()
            .ping_interval(Duration::from_secs(1))
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval"));
    }

    #[test]
    fn test_alloc_buffer_uses_pool() {
        let pool = BufferPool::new(64);
        let config = SessionConfig::builder()
            .buffer_pool(pool.clone())
            .build()
            .unwrap();
        let buf = config.alloc_buffer();
        assert!(buf.is_pooled());
        assert_eq!(buf.capacity(), 64);

        let plain = SessionConfig::new().alloc_buffer();
        assert!(!plain.is_pooled());
        assert!(plain.capacity() >= DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_pooled_buffers_sized_by_buffer_size() {
        let config = SessionConfig::builder()
            .buffer_size(128)
            .pooled_buffers()
            .build()
            .unwrap();
        assert_eq!(config.buffer_pool().map(BufferPool::buffer_size), Some(128));
    }

    #[test]
    fn test_attachment_downcasts() {
        let config = SessionConfig::builder().attachment(42u32).build().unwrap();
        let value = config
            .attachment()
            .and_then(|a| a.downcast_ref::<u32>())
            .copied();
        assert_eq!(value, Some(42));
    }

    #[test]
    fn test_hooks_debug_shows_presence() {
        let config = SessionConfig::builder()
            .on_connected(|_, _| {})
            .build()
            .unwrap();
        let debug = format!("{:?}", config.hooks());
        assert!(debug.contains("on_connected: true"));
        assert!(debug.contains("on_message: false"));
    }
}
