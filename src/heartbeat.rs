//! Heartbeat liveness state machine.
//!
//! Driven by `real_elapsed` on every channel tick:
//!
//! ```text
//! Idle ──interval──► heartbeat sent (awaiting ack)
//!   ▲                     │
//!   │ inbound traffic     │ interval, still silent: miss_count += 1, send again
//!   └─────────────────────┤
//!                         ▼
//!            miss_count == threshold: expired
//! ```
//!
//! The first interval after traffic is not a miss: it only sends a heartbeat.
//! Each later silent interval is one miss.

use std::time::Duration;

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of misses that closes the channel.
pub const DEFAULT_MISS_HEARTBEAT_THRESHOLD: u32 = 5;

/// What the channel must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Nothing to do.
    Idle,
    /// Send a heartbeat. `missed` carries the new miss count when the
    /// previous one went unanswered.
    Send {
        /// Miss count after this interval, if it was a miss.
        missed: Option<u32>,
    },
    /// The miss threshold was reached. Close the channel.
    Expired {
        /// Final miss count.
        missed: u32,
    },
}

/// Elapsed time and miss count for one channel.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    interval: Duration,
    miss_threshold: u32,
    elapsed: Duration,
    miss_count: u32,
    awaiting_ack: bool,
}

impl HeartbeatState {
    /// Create a state machine.
    ///
    /// A zero `interval` disables heartbeats. A zero `miss_threshold` keeps
    /// probing forever without expiring.
    pub fn new(interval: Duration, miss_threshold: u32) -> Self {
        Self {
            interval,
            miss_threshold,
            elapsed: Duration::ZERO,
            miss_count: 0,
            awaiting_ack: false,
        }
    }

    /// Whether heartbeats are sent at all.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Advance by `real_elapsed`.
    pub fn tick(&mut self, real_elapsed: Duration) -> HeartbeatTick {
        if !self.is_enabled() {
            return HeartbeatTick::Idle;
        }

        self.elapsed += real_elapsed;
        if self.elapsed < self.interval {
            return HeartbeatTick::Idle;
        }
        self.elapsed = Duration::ZERO;

        if !self.awaiting_ack {
            self.awaiting_ack = true;
            return HeartbeatTick::Send { missed: None };
        }

        self.miss_count += 1;
        if self.miss_threshold > 0 && self.miss_count >= self.miss_threshold {
            return HeartbeatTick::Expired {
                missed: self.miss_count,
            };
        }

        HeartbeatTick::Send {
            missed: Some(self.miss_count),
        }
    }

    /// Record inbound traffic.
    ///
    /// Always clears the miss count; the elapsed time is cleared only when
    /// `reset_elapsed` is set.
    pub fn on_liveness(&mut self, reset_elapsed: bool) {
        self.miss_count = 0;
        self.awaiting_ack = false;
        if reset_elapsed {
            self.elapsed = Duration::ZERO;
        }
    }

    /// Full reset for a new connection.
    pub fn reset(&mut self) {
        self.on_liveness(true);
    }

    /// Consecutive unanswered intervals.
    #[inline]
    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    /// Time since the last heartbeat or reset.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MISS_HEARTBEAT_THRESHOLD)
    }
}
