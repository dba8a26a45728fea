//! Broadcast shutdown signal shared by the loops of one open period.
//!
//! Wraps a [`CancellationToken`]: every loop awaits the same token, so one
//! `trigger` wakes all of them without any loop consuming the signal. The
//! first trigger also records why the period ended.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::state::CloseReason;

// ============================================================================
// Shutdown
// ============================================================================

#[derive(Debug)]
pub(crate) struct Shutdown {
    token: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

impl Shutdown {
    /// Creates a signal, cancelled automatically when `parent` is.
    pub(crate) fn new(parent: Option<&CancellationToken>) -> Self {
        Self {
            token: parent.map_or_else(CancellationToken::new, CancellationToken::child_token),
            reason: Mutex::new(None),
        }
    }

    /// Raises the signal. Returns `true` for the first trigger only.
    pub(crate) fn trigger(&self, reason: CloseReason) -> bool {
        let first = {
            let mut slot = self.reason.lock();
            if slot.is_none() && !self.token.is_cancelled() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        };
        self.token.cancel();
        first
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn raised(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Why the period ended; a parent cancellation reads as `Stopped`.
    pub(crate) fn reason(&self) -> CloseReason {
        self.reason.lock().unwrap_or(CloseReason::Stopped)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[tokio::test]
    async fn test_all_waiters_observe_one_trigger() {
        let shutdown = Arc::new(Shutdown::new(None));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shutdown = Arc::clone(&shutdown);
                tokio::spawn(async move { shutdown.raised().await })
            })
            .collect();

        assert!(shutdown.trigger(CloseReason::WriteFailed));
        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[test]
    fn test_first_reason_wins() {
        let shutdown = Shutdown::new(None);
        assert!(shutdown.trigger(CloseReason::ReadFailed));
        assert!(!shutdown.trigger(CloseReason::HeartbeatTimeout));
        assert_eq!(shutdown.reason(), CloseReason::ReadFailed);
    }

    #[test]
    fn test_parent_cancellation_reads_as_stopped() {
        let parent = CancellationToken::new();
        let shutdown = Shutdown::new(Some(&parent));
        parent.cancel();

        assert!(shutdown.is_raised());
        assert!(!shutdown.trigger(CloseReason::ReadFailed));
        assert_eq!(shutdown.reason(), CloseReason::Stopped);
    }
}
