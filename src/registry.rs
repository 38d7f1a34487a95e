//! Named channel registry.
//!
//! The registry owns one event hub shared by every channel it creates and
//! ticks all of them from a single [`ChannelRegistry::update`] call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelConfig};
use crate::error::{NetworkError, Result};
use crate::events::{ChannelEvent, EventHub, SubscriptionId};
use crate::handler::HandlerPipeline;

/// Owns channels by name and fans their events out to subscribers.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Channel>>,
    events: Arc<EventHub<ChannelEvent>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ChannelExists` if `name` is taken, or `InvalidConfig` for an
    /// `rpc_timeout` below the minimum.
    pub fn create_channel(
        &self,
        name: &str,
        pipeline: Arc<HandlerPipeline>,
        rpc_timeout: Option<Duration>,
    ) -> Result<Channel> {
        self.create_channel_with_config(name, pipeline, ChannelConfig::default(), rpc_timeout)
    }

    /// Create a channel.
    ///
    /// # Errors
    ///
    /// Same as [`ChannelRegistry::create_channel`].
    pub fn create_channel_with_config(
        &self,
        name: &str,
        pipeline: Arc<HandlerPipeline>,
        config: ChannelConfig,
        rpc_timeout: Option<Duration>,
    ) -> Result<Channel> {
        let mut channels = self.channels.write();
        if channels.contains_key(name) {
            return Err(NetworkError::ChannelExists(name.to_string()));
        }

        let channel = Channel::with_config(name, pipeline, config, rpc_timeout)?;
        channel.attach_events(self.events.clone());
        channels.insert(name.to_string(), channel.clone());

        info!(channel = %name, rpc = rpc_timeout.is_some(), "Channel created");
        Ok(channel)
    }

    /// Close and remove a channel without emitting events for it.
    ///
    /// Returns false if no channel has that name.
    pub fn destroy_channel(&self, name: &str) -> bool {
        let Some(channel) = self.channels.write().remove(name) else {
            return false;
        };

        channel.detach_events();
        channel.close();
        info!(channel = %name, "Channel destroyed");
        true
    }

    /// Look up a channel.
    pub fn get_channel(&self, name: &str) -> Option<Channel> {
        self.channels.read().get(name).cloned()
    }

    /// Check if a channel exists.
    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.read().contains_key(name)
    }

    /// Snapshot of every channel.
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.read().values().cloned().collect()
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Check if the registry has no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Tick every channel.
    ///
    /// Channels are ticked from a snapshot, so event handlers may create or
    /// destroy channels.
    pub fn update(&self, elapsed: Duration, real_elapsed: Duration) {
        for channel in self.channels() {
            channel.update(elapsed, real_elapsed);
        }
    }

    /// Subscribe to events from every channel of this registry.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Shared event hub.
    pub fn events(&self) -> &Arc<EventHub<ChannelEvent>> {
        &self.events
    }

    /// Destroy every channel and drop all subscriptions.
    pub fn shutdown(&self) {
        let channels: Vec<(String, Channel)> = self.channels.write().drain().collect();
        for (name, channel) in channels {
            channel.detach_events();
            channel.close();
            debug!(channel = %name, "Channel destroyed on shutdown");
        }
        self.events.clear();
    }
}
