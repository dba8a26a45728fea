//! Connection pool.
//!
//! Idle connections wait here between uses. A connection remembers the pool
//! it came from through a weak handle, so an idle connection never keeps
//! its pool alive.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::SessionConfig;
use crate::error::Result;

use super::Connection;

// ============================================================================
// ConnectionPool
// ============================================================================

/// Unbounded pool of idle connections.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    idle: Mutex<Vec<Arc<Connection>>>,
}

/// Weak back-reference from a connection to its pool.
#[derive(Clone)]
pub(crate) struct PoolRef(Weak<Inner>);

impl PoolRef {
    pub(crate) fn upgrade(&self) -> Option<ConnectionPool> {
        self.0.upgrade().map(|inner| ConnectionPool { inner })
    }
}

impl ConnectionPool {
    /// Creates an empty pool.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an idle connection bound to `config`, with one reference.
    ///
    /// Reuses a pooled connection when one is available.
    #[must_use]
    pub fn get(&self, config: &Arc<SessionConfig>) -> Arc<Connection> {
        let reused = self.inner.idle.lock().pop();
        match reused {
            Some(conn) => {
                conn.reset(Arc::clone(config), self.downgrade());
                trace!(id = %conn.id(), "Reusing pooled connection");
                conn
            }
            None => Connection::with_pool(Arc::clone(config), self.downgrade()),
        }
    }

    /// Returns a connection to the pool.
    ///
    /// Putting a connection that is already pooled is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`](crate::Error::Connection) if the
    /// connection is still running.
    pub fn put(&self, conn: Arc<Connection>) -> Result<()> {
        if conn.claim_for_pool()? {
            conn.detach();
            self.push_idle(conn);
        }
        Ok(())
    }

    /// Returns the number of idle connections.
    #[inline]
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub(crate) fn push_idle(&self, conn: Arc<Connection>) {
        self.inner.idle.lock().push(conn);
    }

    fn downgrade(&self) -> PoolRef {
        PoolRef(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
