//! Subscriber lists and channel-level events.
//!
//! [`EventHub`] may be subscribed to and unsubscribed from on any thread
//! while the tick thread emits. Emission snapshots the subscriber list under
//! the lock and invokes callbacks after releasing it, so a callback may
//! itself subscribe, unsubscribe or emit.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::NetworkErrorCode;

/// Opaque value passed to `connect` and handed back in the Connected event.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Thread-safe list of event callbacks.
pub struct EventHub<E> {
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventHub<E> {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback`. Callbacks run in subscription order.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Invoke every callback with `event`.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Subscriber<E>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Check if there are no callbacks.
    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Remove every callback.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.len())
            .finish()
    }
}

/// Discriminant of [`ChannelEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    /// See [`ChannelEvent::Connected`].
    Connected,
    /// See [`ChannelEvent::Closed`].
    Closed,
    /// See [`ChannelEvent::MissHeartBeat`].
    MissHeartBeat,
    /// See [`ChannelEvent::Error`].
    Error,
}

/// Connection lifecycle notification.
#[derive(Clone)]
pub enum ChannelEvent {
    /// The transport is up.
    Connected {
        /// Channel that connected.
        channel: Channel,
        /// Value passed to `connect`.
        user_data: Option<UserData>,
    },
    /// The channel closed: peer end-of-stream, `close()`, or heartbeat expiry.
    Closed {
        /// Channel that closed.
        channel: Channel,
    },
    /// A heartbeat interval elapsed without inbound traffic.
    MissHeartBeat {
        /// Channel that missed.
        channel: Channel,
        /// Consecutive misses so far.
        miss_count: u32,
    },
    /// The channel failed and is already disconnected.
    Error {
        /// Channel that failed.
        channel: Channel,
        /// Failure category.
        code: NetworkErrorCode,
        /// OS error code of the transport failure, if any.
        transport_code: Option<i32>,
        /// Human readable detail.
        message: String,
    },
}

impl ChannelEvent {
    /// Channel the event belongs to.
    pub fn channel(&self) -> &Channel {
        match self {
            ChannelEvent::Connected { channel, .. }
            | ChannelEvent::Closed { channel }
            | ChannelEvent::MissHeartBeat { channel, .. }
            | ChannelEvent::Error { channel, .. } => channel,
        }
    }

    /// Event discriminant.
    pub fn kind(&self) -> ChannelEventKind {
        match self {
            ChannelEvent::Connected { .. } => ChannelEventKind::Connected,
            ChannelEvent::Closed { .. } => ChannelEventKind::Closed,
            ChannelEvent::MissHeartBeat { .. } => ChannelEventKind::MissHeartBeat,
            ChannelEvent::Error { .. } => ChannelEventKind::Error,
        }
    }
}

impl fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEvent::Connected { channel, user_data } => f
                .debug_struct("Connected")
                .field("channel", &channel.name())
                .field("user_data", &user_data.is_some())
                .finish(),
            ChannelEvent::Closed { channel } => f
                .debug_struct("Closed")
                .field("channel", &channel.name())
                .finish(),
            ChannelEvent::MissHeartBeat {
                channel,
                miss_count,
            } => f
                .debug_struct("MissHeartBeat")
                .field("channel", &channel.name())
                .field("miss_count", miss_count)
                .finish(),
            ChannelEvent::Error {
                channel,
                code,
                transport_code,
                message,
            } => f
                .debug_struct("Error")
                .field("channel", &channel.name())
                .field("code", code)
                .field("transport_code", transport_code)
                .field("message", message)
                .finish(),
        }
    }
}
