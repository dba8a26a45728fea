//! Message buffers and their pool.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | Reference-counted [`MessageBuffer`] |
//! | `pool` | [`BufferPool`] of fixed-size storage |

// ============================================================================
// Submodules
// ============================================================================

/// Reference-counted message buffer.
pub mod message;

/// Buffer storage pool.
pub mod pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::MessageBuffer;
pub use pool::BufferPool;
