//! Connection state machine and loops.
//!
//! A [`Connection`] owns one transport while it is open and runs three tasks
//! over it:
//!
//! | Task | Role |
//! |------|------|
//! | receive loop | Reads frames, answers pings, dispatches messages |
//! | send loop | Sole writer; drains the bounded outbound queue in order |
//! | heartbeat loop | Liveness timeout, client pings, tick hook |
//!
//! The first loop to hit a terminal condition raises a shared shutdown
//! signal; [`Connection::run`] then joins the loops, drains the queue and
//! fires the disconnected hook exactly once.
//!
//! Connections are reference counted with [`Connection::add_ref`] and
//! [`Connection::release`]. A connection that reaches zero references while
//! not running goes back to its [`ConnectionPool`], if it came from one.

// ============================================================================
// Submodules
// ============================================================================

/// Connection type, send API and run orchestration.
pub mod core;

/// Heartbeat loop and liveness clock.
mod heartbeat;

/// Send and receive loops.
mod io;

/// Connection pool.
pub mod pool;

/// Broadcast shutdown signal.
mod shutdown;

/// States, roles and close reasons.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use core::Connection;
pub use pool::ConnectionPool;
pub use state::{CloseReason, ConnectionState, Role};
