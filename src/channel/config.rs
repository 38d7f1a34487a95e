//! Per-channel configuration.

use std::time::Duration;

use crate::error::{NetworkError, Result};
use crate::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MISS_HEARTBEAT_THRESHOLD};
use crate::protocol::DEFAULT_BUFFER_CAPACITY;

/// Default number of frames queued for the writer task.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Channel tunables.
///
/// ```
/// use std::time::Duration;
/// use tickwire::channel::ChannelConfig;
///
/// let config = ChannelConfig::default()
///     .with_heartbeat_interval(Duration::from_secs(2))
///     .with_miss_heartbeat_threshold(3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Time between heartbeats. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Misses that close the channel. Zero never closes.
    pub miss_heartbeat_threshold: u32,
    /// Whether inbound traffic also restarts the heartbeat interval.
    pub reset_heartbeat_on_receive: bool,
    /// Initial receive buffer capacity in bytes.
    pub receive_buffer_capacity: usize,
    /// Initial send buffer capacity in bytes.
    pub send_buffer_capacity: usize,
    /// Frames the writer task may have queued before `send` fails.
    pub outbound_queue_capacity: usize,
}

impl ChannelConfig {
    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the miss threshold.
    pub fn with_miss_heartbeat_threshold(mut self, threshold: u32) -> Self {
        self.miss_heartbeat_threshold = threshold;
        self
    }

    /// Set whether inbound traffic restarts the heartbeat interval.
    pub fn with_reset_heartbeat_on_receive(mut self, reset: bool) -> Self {
        self.reset_heartbeat_on_receive = reset;
        self
    }

    /// Set both buffer capacities.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.receive_buffer_capacity = capacity;
        self.send_buffer_capacity = capacity;
        self
    }

    /// Set the outbound queue capacity.
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Check the values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero outbound queue capacity.
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue_capacity == 0 {
            return Err(NetworkError::InvalidConfig(
                "outbound_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            miss_heartbeat_threshold: DEFAULT_MISS_HEARTBEAT_THRESHOLD,
            reset_heartbeat_on_receive: true,
            receive_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            send_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        }
    }
}
