//! Integration tests for tickwire.
//!
//! Two registries talk over loopback TCP, ticked from the test body.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use tickwire::codec::MsgPackCodec;
use tickwire::{
    Channel, ChannelConfig, ChannelEvent, ChannelRegistry, ChannelState, HandlerPipeline, Message,
    MessageType, MessageTypes, NetworkErrorCode, RpcError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chat {
    #[serde(skip)]
    unique_id: u32,
    text: String,
}

impl Message for Chat {
    fn message_type_id(&self) -> u32 {
        Self::TYPE_ID
    }

    fn unique_id(&self) -> u32 {
        self.unique_id
    }

    fn set_unique_id(&mut self, unique_id: u32) {
        self.unique_id = unique_id;
    }

    fn encode(&self) -> tickwire::Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MessageType for Chat {
    const TYPE_ID: u32 = 1001;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatReply {
    #[serde(skip)]
    unique_id: u32,
    error_code: i32,
    text: String,
}

impl Message for ChatReply {
    fn message_type_id(&self) -> u32 {
        Self::TYPE_ID
    }

    fn unique_id(&self) -> u32 {
        self.unique_id
    }

    fn set_unique_id(&mut self, unique_id: u32) {
        self.unique_id = unique_id;
    }

    fn error_code(&self) -> Option<i32> {
        Some(self.error_code)
    }

    fn encode(&self) -> tickwire::Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MessageType for ChatReply {
    const TYPE_ID: u32 = 1002;
}

const TICK: Duration = Duration::from_millis(16);
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

fn pipeline() -> Arc<HandlerPipeline> {
    let mut types = MessageTypes::new();
    types.register::<Chat>().register::<ChatReply>();
    Arc::new(HandlerPipeline::with_defaults(types))
}

fn chat(unique_id: u32, text: &str) -> Chat {
    Chat {
        unique_id,
        text: text.to_string(),
    }
}

/// Tick both registries until `done` holds.
async fn pump(registries: &[&ChannelRegistry], mut done: impl FnMut() -> bool) {
    for _ in 0..2000 {
        for registry in registries {
            registry.update(Duration::ZERO, Duration::ZERO);
        }
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

/// Record event names per registry.
fn record(registry: &ChannelRegistry) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    registry.subscribe(move |event| {
        let name = match event {
            ChannelEvent::Connected { channel, .. } => format!("{}:connected", channel.name()),
            ChannelEvent::Closed { channel } => format!("{}:closed", channel.name()),
            ChannelEvent::MissHeartBeat {
                channel,
                miss_count,
            } => format!("{}:miss:{}", channel.name(), miss_count),
            ChannelEvent::Error { channel, code, .. } => {
                format!("{}:error:{:?}", channel.name(), code)
            }
        };
        sink.lock().push(name);
    });
    log
}

struct Pair {
    client_registry: ChannelRegistry,
    server_registry: ChannelRegistry,
    client: Channel,
    server: Channel,
}

/// Connect a client channel to a server channel over loopback.
async fn connect_pair(config: ChannelConfig) -> Pair {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client_registry = ChannelRegistry::new();
    let server_registry = ChannelRegistry::new();
    let client = client_registry
        .create_channel_with_config("client", pipeline(), config.clone(), Some(RPC_TIMEOUT))
        .unwrap();
    let server = server_registry
        .create_channel_with_config("server", pipeline(), config, Some(RPC_TIMEOUT))
        .unwrap();

    client.connect(addr, None).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    server.connect_stream(stream, None).unwrap();

    pump(&[&client_registry, &server_registry], || {
        client.is_connected() && server.is_connected()
    })
    .await;

    Pair {
        client_registry,
        server_registry,
        client,
        server,
    }
}

fn serve_uppercase(server: &Channel) {
    server.on::<Chat, _>(|channel, request| {
        let reply = ChatReply {
            unique_id: request.unique_id,
            error_code: 0,
            text: request.text.to_uppercase(),
        };
        if let Err(error) = channel.send(&reply) {
            panic!("reply failed: {error}");
        }
    });
}

#[tokio::test]
async fn test_rpc_round_trip_over_tcp() {
    let pair = connect_pair(ChannelConfig::default()).await;
    serve_uppercase(&pair.server);

    let handle = pair.client.call(chat(7, "ping")).unwrap();
    pump(&[&pair.client_registry, &pair.server_registry], || {
        handle.try_result().is_some()
    })
    .await;

    let response = handle.await.unwrap();
    let reply = response.downcast_ref::<ChatReply>().unwrap();
    assert_eq!(reply.unique_id, 7);
    assert_eq!(reply.text, "PING");
    assert_eq!(pair.client.pending_calls(), 0);
}

#[tokio::test]
async fn test_large_payload_is_compressed_and_restored() {
    let pair = connect_pair(ChannelConfig::default()).await;
    serve_uppercase(&pair.server);

    let text = "tick".repeat(2000);
    let handle = pair.client.call(chat(1, &text)).unwrap();
    pump(&[&pair.client_registry, &pair.server_registry], || {
        handle.try_result().is_some()
    })
    .await;

    let response = handle.await.unwrap();
    assert_eq!(
        response.downcast_ref::<ChatReply>().unwrap().text,
        text.to_uppercase()
    );
}

#[tokio::test]
async fn test_many_messages_arrive_in_order() {
    let pair = connect_pair(ChannelConfig::default()).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        pair.server.on::<Chat, _>(move |_, message| {
            received.lock().push(message.unique_id);
        });
    }

    for unique_id in 1..=200 {
        pair.client.send(&chat(unique_id, "burst")).unwrap();
    }
    pump(&[&pair.client_registry, &pair.server_registry], || {
        received.lock().len() == 200
    })
    .await;

    let expected: Vec<u32> = (1..=200).collect();
    assert_eq!(*received.lock(), expected);
}

#[tokio::test]
async fn test_events_fan_out_through_registry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ChannelRegistry::new();
    let log = record(&registry);
    let channel = registry.create_channel("client", pipeline(), None).unwrap();

    channel.connect(addr, None).unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    pump(&[&registry], || channel.is_connected()).await;

    drop(stream);
    pump(&[&registry], || !channel.is_connected()).await;

    assert_eq!(*log.lock(), vec!["client:connected", "client:closed"]);
}

#[tokio::test]
async fn test_connect_refused_reports_error() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let registry = ChannelRegistry::new();
    let transport_code = Arc::new(Mutex::new(None));
    {
        let transport_code = transport_code.clone();
        registry.subscribe(move |event| {
            if let ChannelEvent::Error {
                code,
                transport_code: os_code,
                ..
            } = event
            {
                assert_eq!(*code, NetworkErrorCode::ConnectError);
                *transport_code.lock() = Some(*os_code);
            }
        });
    }
    let channel = registry.create_channel("client", pipeline(), None).unwrap();

    channel.connect(addr, None).unwrap();
    assert_eq!(channel.state(), ChannelState::Connecting);
    pump(&[&registry], || transport_code.lock().is_some()).await;

    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert!(transport_code.lock().unwrap().is_some());
}

#[tokio::test]
async fn test_remote_destroy_fails_pending_call() {
    let pair = connect_pair(ChannelConfig::default()).await;
    let client_log = record(&pair.client_registry);
    let server_log = record(&pair.server_registry);
    let failures = Arc::new(AtomicUsize::new(0));
    {
        let failures = failures.clone();
        pair.client
            .subscribe_rpc(move |event| {
                if let tickwire::RpcEvent::Failed { error, .. } = event {
                    assert_eq!(*error, RpcError::ChannelClosed);
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
    }

    // the server reads the request but never answers
    let seen = Arc::new(AtomicUsize::new(0));
    {
        let seen = seen.clone();
        pair.server.on::<Chat, _>(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    }
    let handle = pair.client.call(chat(3, "unanswered")).unwrap();
    pump(&[&pair.client_registry, &pair.server_registry], || {
        seen.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(pair.server_registry.destroy_channel("server"));

    pump(&[&pair.client_registry], || !pair.client.is_connected()).await;

    assert!(matches!(handle.await, Err(RpcError::ChannelClosed)));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(*client_log.lock(), vec!["client:closed"]);
    assert!(server_log.lock().is_empty());
}

#[tokio::test]
async fn test_heartbeats_keep_idle_connection_alive() {
    let config = ChannelConfig::default()
        .with_heartbeat_interval(Duration::from_millis(200))
        .with_miss_heartbeat_threshold(2);
    let pair = connect_pair(config).await;
    let client_log = record(&pair.client_registry);
    let server_log = record(&pair.server_registry);

    for _ in 0..10 {
        pair.client_registry.update(TICK, Duration::from_millis(120));
        pair.server_registry.update(TICK, Duration::from_millis(120));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(pair.client.is_connected());
    assert!(pair.server.is_connected());
    assert!(client_log.lock().is_empty());
    assert!(server_log.lock().is_empty());
}

#[tokio::test]
async fn test_silent_peer_expires() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ChannelRegistry::new();
    let log = record(&registry);
    let config = ChannelConfig::default()
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_miss_heartbeat_threshold(2);
    let channel = registry
        .create_channel_with_config("client", pipeline(), config, None)
        .unwrap();

    channel.connect(addr, None).unwrap();
    let (_silent, _) = listener.accept().await.unwrap();
    pump(&[&registry], || channel.is_connected()).await;

    for _ in 0..3 {
        registry.update(TICK, Duration::from_secs(1));
    }

    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(
        *log.lock(),
        vec!["client:connected", "client:miss:1", "client:miss:2", "client:closed"]
    );
}

#[tokio::test]
async fn test_reconnect_after_peer_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let registry = ChannelRegistry::new();
    let channel = registry.create_channel("client", pipeline(), None).unwrap();

    channel.connect(addr, None).unwrap();
    let (first, _) = listener.accept().await.unwrap();
    pump(&[&registry], || channel.is_connected()).await;
    drop(first);
    pump(&[&registry], || !channel.is_connected()).await;

    channel.connect(addr, None).unwrap();
    let (_second, _) = listener.accept().await.unwrap();
    pump(&[&registry], || channel.is_connected()).await;
    assert_eq!(registry.len(), 1);
}
