//! Heartbeat loop and liveness clock.
//!
//! Every tick the loop runs, in order:
//!
//! 1. **Timeout check**: if no inbound frame arrived for longer than the
//!    heartbeat timeout, the connection is shut down.
//! 2. **Probe**: on the client side, once the ping cadence has elapsed, the
//!    before-send-ping hook runs and a ping is queued.
//! 3. **Tick hook**: the heartbeat hook runs.
//!
//! The deadline is soft: a dead peer is detected at most one tick after the
//! timeout expires.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{trace, warn};

use crate::buffer::MessageBuffer;
use crate::config::SessionConfig;
use crate::frame::FrameKind;

use super::Connection;
use super::shutdown::Shutdown;
use super::state::{CloseReason, Role};

// ============================================================================
// Liveness
// ============================================================================

/// Monotonic timestamp of the last inbound activity.
///
/// Stored as milliseconds since construction; updates use `fetch_max` so a
/// late writer never moves the clock backwards.
#[derive(Debug)]
pub(crate) struct Liveness {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Records inbound activity now.
    pub(crate) fn touch(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// Time since the last recorded activity.
    pub(crate) fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }
}

// ============================================================================
// Heartbeat Loop
// ============================================================================

pub(super) async fn heartbeat_loop(
    conn: Arc<Connection>,
    config: Arc<SessionConfig>,
    shutdown: Arc<Shutdown>,
    outbound: mpsc::Sender<MessageBuffer>,
    role: Role,
) {
    let tunables = config.tunables();
    let Some(interval) = tunables.heartbeat_interval() else {
        return;
    };
    let timeout = tunables.heartbeat_timeout();
    let ping_every = if role.probes() {
        tunables.ping_every_ticks()
    } else {
        None
    };

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            biased;
            () = shutdown.raised() => break,
            _ = ticker.tick() => {}
        }
        ticks += 1;

        if let Some(timeout) = timeout {
            let idle = conn.liveness().idle();
            if idle > timeout {
                warn!(
                    id = %conn.id(),
                    idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                    timeout_ms = tunables.heartbeat_timeout_ms,
                    "Heartbeat timeout, closing connection"
                );
                shutdown.trigger(CloseReason::HeartbeatTimeout);
                break;
            }
        }

        if ping_every.is_some_and(|every| ticks % every == 0) {
            if let Some(hook) = &config.hooks().on_before_send_ping {
                hook(&conn, config.attachment());
            }

            let ping = MessageBuffer::control(FrameKind::Ping);
            tokio::select! {
                biased;
                () = shutdown.raised() => break,
                sent = outbound.send(ping) => if sent.is_err() { break },
            }
            trace!(id = %conn.id(), tick = ticks, "Ping queued");
        }

        if let Some(hook) = &config.hooks().on_heartbeat {
            hook(&conn, config.attachment());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
