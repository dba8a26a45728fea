//! Reference-counted message buffer.
//!
//! A [`MessageBuffer`] is a handle to shared byte storage tagged with a
//! [`FrameKind`]. Every handle is one reference:
//!
//! - [`MessageBuffer::add_ref`] takes another reference and returns its handle
//! - [`MessageBuffer::release`] (or dropping the handle) gives one back
//!
//! When the last reference goes away the storage is cleared and returned to
//! the [`BufferPool`] it came from, or freed if it was allocated directly.
//!
//! # Capacity Policy
//!
//! | Origin | Writes past capacity |
//! |--------|----------------------|
//! | [`BufferPool::get`] | Truncated; `write` returns the accepted length |
//! | [`MessageBuffer::with_capacity`] | Storage grows |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::frame::FrameKind;

use super::pool::BufferPool;

// ============================================================================
// Shared Storage
// ============================================================================

/// Bytes plus read cursor and frame tag.
#[derive(Debug, Default)]
struct Storage {
    data: Vec<u8>,
    cursor: usize,
    kind: FrameKind,
}

/// State shared by every handle of one buffer.
struct Shared {
    storage: Mutex<Storage>,
    refs: AtomicUsize,
    /// Fixed size for pooled buffers, `None` when growable.
    limit: Option<usize>,
    pool: Option<BufferPool>,
}

// ============================================================================
// MessageBuffer
// ============================================================================

/// Reusable byte container with an explicit reference count.
///
/// Handles are not `Clone`; a second handle only comes from
/// [`add_ref`](Self::add_ref), so the counter equals the number of live
/// handles.
///
/// # Example
///
/// ```
/// use duplex_ws::{FrameKind, MessageBuffer};
///
/// let buf = MessageBuffer::with_capacity(16);
/// buf.write(b"hello");
/// buf.set_frame_kind(FrameKind::Binary);
///
/// let kept = buf.add_ref();
/// assert_eq!(kept.ref_count(), 2);
/// buf.release();
/// assert_eq!(kept.read_all(), b"hello");
/// ```
pub struct MessageBuffer {
    shared: Arc<Shared>,
}

// ============================================================================
// MessageBuffer - Constructors
// ============================================================================

impl MessageBuffer {
    /// Allocates an unpooled, growable buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_parts(Vec::with_capacity(capacity), None, None)
    }

    /// Allocates an unpooled buffer holding `bytes`.
    #[must_use]
    pub fn from_bytes(kind: FrameKind, bytes: &[u8]) -> Self {
        let buffer = Self::from_parts(bytes.to_vec(), None, None);
        buffer.set_frame_kind(kind);
        buffer
    }

    /// Allocates an empty, unpooled buffer for a payload-less control frame.
    #[must_use]
    pub fn control(kind: FrameKind) -> Self {
        let buffer = Self::from_parts(Vec::new(), None, None);
        buffer.set_frame_kind(kind);
        buffer
    }

    /// Wraps storage handed out by a pool.
    pub(crate) fn pooled(data: Vec<u8>, limit: usize, pool: BufferPool) -> Self {
        Self::from_parts(data, Some(limit), Some(pool))
    }

    fn from_parts(data: Vec<u8>, limit: Option<usize>, pool: Option<BufferPool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage: Mutex::new(Storage {
                    data,
                    cursor: 0,
                    kind: FrameKind::default(),
                }),
                refs: AtomicUsize::new(1),
                limit,
                pool,
            }),
        }
    }
}

// ============================================================================
// MessageBuffer - Reference Counting
// ============================================================================

impl MessageBuffer {
    /// Takes an additional reference and returns its handle.
    #[must_use = "dropping the returned handle releases the reference immediately"]
    pub fn add_ref(&self) -> Self {
        self.shared.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Gives this reference back.
    ///
    /// Equivalent to dropping the handle.
    #[inline]
    pub fn release(self) {
        drop(self);
    }

    /// Returns the number of live references.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::Acquire)
    }

    /// Returns `true` if the storage came from a [`BufferPool`].
    #[inline]
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.shared.pool.is_some()
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        let previous = self.shared.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "MessageBuffer released with zero references");

        if previous != 1 {
            return;
        }

        if let Some(pool) = &self.shared.pool {
            let data = {
                let mut storage = self.shared.storage.lock();
                storage.cursor = 0;
                storage.kind = FrameKind::default();
                mem::take(&mut storage.data)
            };
            pool.recycle(data);
        }
    }
}

// ============================================================================
// MessageBuffer - Content
// ============================================================================

impl MessageBuffer {
    /// Appends bytes and returns how many were accepted.
    ///
    /// Pooled buffers stop at their fixed size; unpooled buffers grow.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut storage = self.shared.storage.lock();
        let accepted = match self.shared.limit {
            Some(limit) => bytes.len().min(limit.saturating_sub(storage.data.len())),
            None => bytes.len(),
        };
        storage.data.extend_from_slice(&bytes[..accepted]);
        accepted
    }

    /// Serializes `value` as JSON and appends it.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if serialization fails
    /// - [`Error::BufferOverflow`] if the document does not fit a pooled
    ///   buffer; nothing is written in that case
    pub fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize> {
        let json = serde_json::to_vec(value)?;

        if let Some(limit) = self.shared.limit {
            let available = limit.saturating_sub(self.len());
            if json.len() > available {
                return Err(Error::buffer_overflow(json.len(), available));
            }
        }

        Ok(self.write(&json))
    }

    /// Reads from the cursor into `out`, advancing the cursor.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut storage = self.shared.storage.lock();
        let start = storage.cursor;
        let count = out.len().min(storage.data.len() - start);
        out[..count].copy_from_slice(&storage.data[start..start + count]);
        storage.cursor += count;
        count
    }

    /// Returns everything from the cursor to the end, advancing the cursor.
    pub fn read_all(&self) -> Vec<u8> {
        let mut storage = self.shared.storage.lock();
        let start = storage.cursor;
        storage.cursor = storage.data.len();
        storage.data[start..].to_vec()
    }

    /// Copies the whole valid content, ignoring the cursor.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.shared.storage.lock().data.clone()
    }

    /// Runs `f` over the valid content without copying.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.shared.storage.lock().data)
    }

    /// Moves the cursor back to the start.
    pub fn rewind(&self) {
        self.shared.storage.lock().cursor = 0;
    }

    /// Drops the content, keeping the allocation.
    pub fn clear(&self) {
        let mut storage = self.shared.storage.lock();
        storage.data.clear();
        storage.cursor = 0;
    }

    /// Returns the valid length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.storage.lock().data.len()
    }

    /// Returns `true` if the buffer holds no data.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the fixed size of a pooled buffer, or the current allocation.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared
            .limit
            .unwrap_or_else(|| self.shared.storage.lock().data.capacity())
    }

    /// Returns the frame kind tag.
    #[inline]
    #[must_use]
    pub fn frame_kind(&self) -> FrameKind {
        self.shared.storage.lock().kind
    }

    /// Sets the frame kind tag.
    #[inline]
    pub fn set_frame_kind(&self, kind: FrameKind) {
        self.shared.storage.lock().kind = kind;
    }
}

impl fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.shared.storage.lock();
        f.debug_struct("MessageBuffer")
            .field("kind", &storage.kind)
            .field("len", &storage.data.len())
            .field("cursor", &storage.cursor)
            .field("refs", &self.shared.refs.load(Ordering::Relaxed))
            .field("pooled", &self.shared.pool.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
