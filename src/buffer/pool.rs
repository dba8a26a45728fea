//! Pool of message buffer storage.
//!
//! The pool keeps cleared `Vec<u8>` allocations of one fixed size and hands
//! them out wrapped in a [`MessageBuffer`]. It has no upper bound and is a
//! throughput optimization only.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::message::MessageBuffer;

// ============================================================================
// BufferPool
// ============================================================================

/// Shared pool of fixed-size message buffers.
///
/// Cloning yields another handle to the same pool. Safe for concurrent
/// `get`/`put` from any thread.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

struct Inner {
    buffer_size: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates an empty pool whose buffers hold `buffer_size` bytes.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer_size,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns a cleared buffer, allocating if the pool is empty.
    #[must_use]
    pub fn get(&self) -> MessageBuffer {
        let data = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_size));
        MessageBuffer::pooled(data, self.inner.buffer_size, self.clone())
    }

    /// Gives a buffer reference back.
    ///
    /// The storage reaches the pool once every other holder has released it
    /// too.
    #[inline]
    pub fn put(&self, buffer: MessageBuffer) {
        buffer.release();
    }

    /// Returns the fixed size of buffers from this pool.
    #[inline]
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Returns the number of buffers waiting for reuse.
    #[inline]
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Takes back storage whose last reference was released.
    pub(crate) fn recycle(&self, mut data: Vec<u8>) {
        data.clear();
        trace!(capacity = data.capacity(), "Buffer returned to pool");
        self.inner.idle.lock().push(data);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("idle", &self.idle_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn test_get_allocates_when_empty() {
        let pool = BufferPool::new(32);
        let buf = pool.get();
        assert!(buf.is_pooled());
        assert_eq!(buf.capacity(), 32);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_put_then_get_reuses_storage() {
        let pool = BufferPool::new(32);
        let buf = pool.get();
        buf.write(b"abc");
        pool.put(buf);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.get();
        assert_eq!(pool.idle_count(), 0);
        assert!(again.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let pool = BufferPool::new(8);
        let other = pool.clone();
        other.get().release();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_concurrent_get_put() {
        let pool = BufferPool::new(16);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let buf = pool.get();
                        buf.write(b"x");
                        pool.put(buf);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(pool.idle_count() >= 1);
        assert!(pool.idle_count() <= 8);
    }
}
