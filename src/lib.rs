//! # tickwire
//!
//! Tick-driven framed packet channels over TCP.
//!
//! Every message travels as a 14-byte big-endian header followed by a
//! body. Channels parse inbound frames, keep the connection alive with
//! heartbeats and correlate request/response pairs, all from a
//! non-blocking `update` the host application calls once per tick.
//!
//! ## Architecture
//!
//! - **Protocol**: header codec, receive cursor, frame assembly
//! - **Handler pipeline**: seven replaceable strategies for serializing,
//!   deserializing, compressing and building heartbeats
//! - **Channel**: connection state, heartbeat, RPC, message routing
//! - **Registry**: named channels sharing one event hub
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tickwire::{ChannelEvent, ChannelRegistry, HandlerPipeline, MessageTypes};
//!
//! #[tokio::main]
//! async fn main() -> tickwire::Result<()> {
//!     let mut types = MessageTypes::new();
//!     types.register::<ChatMessage>();
//!
//!     let registry = ChannelRegistry::new();
//!     registry.subscribe(|event| {
//!         if let ChannelEvent::Connected { channel, .. } = event {
//!             println!("{} connected", channel.name());
//!         }
//!     });
//!
//!     let pipeline = Arc::new(HandlerPipeline::with_defaults(types));
//!     let channel = registry.create_channel("chat", pipeline, Some(Duration::from_secs(5)))?;
//!     channel.on::<ChatMessage, _>(|_, chat| println!("{}", chat.text));
//!     channel.connect("127.0.0.1:7000".parse().unwrap(), None)?;
//!
//!     let mut ticker = tokio::time::interval(Duration::from_millis(16));
//!     loop {
//!         ticker.tick().await;
//!         registry.update(Duration::from_millis(16), Duration::from_millis(16));
//!     }
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod error;
pub mod events;
pub mod handler;
pub mod heartbeat;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod rpc;

pub use channel::{Channel, ChannelConfig, ChannelState};
pub use error::{Capability, NetworkError, NetworkErrorCode, Result};
pub use events::{ChannelEvent, ChannelEventKind, EventHub, SubscriptionId, UserData};
pub use handler::{HandlerPipeline, PipelineConfig};
pub use message::{Heartbeat, Message, MessageType, MessageTypes};
pub use registry::ChannelRegistry;
pub use rpc::{RpcError, RpcEvent, RpcHandle, RpcOutcome};
