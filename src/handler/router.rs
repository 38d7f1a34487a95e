//! Dispatch of inbound messages by message type id.
//!
//! Messages that are neither heartbeats nor matched RPC replies land here.
//! Handlers receive the channel they arrived on, so they can reply.
//!
//! # Example
//!
//! ```ignore
//! channel.on::<ChatMessage, _>(|channel, chat| {
//!     tracing::info!(text = %chat.text, "chat");
//!     let _ = channel.send(&ChatAck::new(chat.unique_id));
//! });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::message::{Message, MessageType};

/// Handler invoked for a routed inbound message.
pub type MessageHandler = Arc<dyn Fn(&Channel, Arc<dyn Message>) + Send + Sync>;

/// Wrap a handler that expects the concrete type `M`.
///
/// Messages of another concrete type under the same id are dropped with a
/// warning.
pub fn typed<M, F>(handler: F) -> MessageHandler
where
    M: Message,
    F: Fn(&Channel, &M) + Send + Sync + 'static,
{
    Arc::new(move |channel: &Channel, message: Arc<dyn Message>| {
        match message.downcast_ref::<M>() {
            Some(typed) => handler(channel, typed),
            None => warn!(
                channel = %channel.name(),
                message_type_id = message.message_type_id(),
                expected = std::any::type_name::<M>(),
                "Handler received unexpected message type"
            ),
        }
    })
}

/// Routing table keyed by message type id, with an optional fallback.
#[derive(Clone, Default)]
pub struct MessageRouter {
    routes: HashMap<u32, MessageHandler>,
    fallback: Option<MessageHandler>,
}

impl MessageRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `message_type_id` to `handler`, replacing any earlier handler.
    pub fn route(&mut self, message_type_id: u32, handler: MessageHandler) {
        if self.routes.insert(message_type_id, handler).is_some() {
            debug!(message_type_id, "Replaced message handler");
        }
    }

    /// Route the type id of `M` to a typed handler.
    pub fn route_type<M, F>(&mut self, handler: F)
    where
        M: MessageType,
        F: Fn(&Channel, &M) + Send + Sync + 'static,
    {
        self.route(M::TYPE_ID, typed(handler));
    }

    /// Handler for messages without a route.
    pub fn set_fallback(&mut self, handler: MessageHandler) {
        self.fallback = Some(handler);
    }

    /// Remove the route for `message_type_id`.
    pub fn remove(&mut self, message_type_id: u32) -> bool {
        self.routes.remove(&message_type_id).is_some()
    }

    /// Handler for `message_type_id`, falling back to the default.
    ///
    /// Returns a clone so the caller can invoke it without holding any lock
    /// around the router.
    pub fn resolve(&self, message_type_id: u32) -> Option<MessageHandler> {
        self.routes
            .get(&message_type_id)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Check if a dedicated route exists.
    pub fn has_route(&self, message_type_id: u32) -> bool {
        self.routes.contains_key(&message_type_id)
    }

    /// Number of dedicated routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if there are no dedicated routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
