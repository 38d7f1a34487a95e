//! Connection channel - one transport with its framing, heartbeat and RPC state.
//!
//! A [`Channel`] is a cheap cloneable handle. All receive parsing, heartbeat
//! scheduling and RPC timeout eviction happen inside [`Channel::update`],
//! which never blocks; socket I/O runs on tokio tasks underneath.
//!
//! # Locking
//!
//! Two locks guard the mutable state:
//! - `session`: state, receive buffer, heartbeat, transport link
//! - `outbound`: send buffer and the writer queue
//!
//! They are only ever nested as `session` then `outbound`. Events, message
//! handlers and RPC completions run after `session` is released, so a
//! callback may freely call back into the channel.
//!
//! # Heartbeats
//!
//! Any inbound frame counts as liveness. A heartbeat request from the peer
//! is decoded like any body and answered with a heartbeat ack; acks are
//! never answered.
//!
//! # Example
//!
//! ```ignore
//! let channel = registry.create_channel("game", pipeline, Some(Duration::from_secs(5)))?;
//! channel.connect("127.0.0.1:7000".parse()?, None)?;
//!
//! loop {
//!     registry.update(frame_time, real_frame_time);
//! }
//! ```

mod config;
mod link;

pub use config::{ChannelConfig, DEFAULT_OUTBOUND_QUEUE_CAPACITY};

use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, error, info, trace, warn};

use self::link::{Link, LinkEvent, LINK_EVENT_CAPACITY};
use crate::error::{NetworkError, NetworkErrorCode, Result};
use crate::events::{ChannelEvent, EventHub, SubscriptionId, UserData};
use crate::handler::HandlerPipeline;
use crate::heartbeat::{HeartbeatState, HeartbeatTick};
use crate::message::{Heartbeat, Message, MessageType};
use crate::protocol::{Frame, ReceiveBuffer, SendBuffer};
use crate::rpc::{RpcError, RpcEvent, RpcHandle, RpcState};

/// Transport events handled per [`Channel::update`].
const MAX_LINK_EVENTS_PER_UPDATE: usize = LINK_EVENT_CAPACITY;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// No transport.
    Disconnected,
    /// Transport requested, not yet established.
    Connecting,
    /// Transport up; `send` and `call` are accepted.
    Connected,
    /// Tearing down.
    Closing,
}

/// Handle to one logical connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    config: ChannelConfig,
    pipeline: Arc<HandlerPipeline>,
    rpc: Option<RpcState>,
    router: RwLock<crate::handler::MessageRouter>,
    events: RwLock<Option<Arc<EventHub<ChannelEvent>>>>,
    outbound: Mutex<Outbound>,
    session: Mutex<Session>,
}

struct Outbound {
    buffer: SendBuffer,
    /// Present only while connected.
    tx: Option<mpsc::Sender<Bytes>>,
}

struct Session {
    state: ChannelState,
    receive: ReceiveBuffer,
    heartbeat: HeartbeatState,
    link: Option<Link>,
    user_data: Option<UserData>,
}

/// Work collected under the session lock and run after releasing it.
enum Deferred {
    Dispatch(Arc<dyn Message>),
    FailPending,
    Emit(Notice),
}

enum Notice {
    Connected(Option<UserData>),
    Closed,
    MissHeartBeat(u32),
    Error {
        code: NetworkErrorCode,
        transport_code: Option<i32>,
        message: String,
    },
}

/// A receive or heartbeat failure that ends the connection.
struct Fault {
    code: NetworkErrorCode,
    error: NetworkError,
}

impl Fault {
    fn new(code: NetworkErrorCode, error: NetworkError) -> Self {
        let code = match error {
            NetworkError::MissingStrategy(_) => NetworkErrorCode::MissingStrategy,
            _ => code,
        };
        Self { code, error }
    }

    fn into_notice(self) -> Notice {
        Notice::Error {
            code: self.code,
            transport_code: self.error.transport_code(),
            message: self.error.to_string(),
        }
    }
}

impl Channel {
    /// Create a disconnected channel with the default configuration.
    ///
    /// `rpc_timeout` enables [`Channel::call`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `rpc_timeout` is below the 3 s minimum.
    pub fn new(
        name: impl Into<String>,
        pipeline: Arc<HandlerPipeline>,
        rpc_timeout: Option<Duration>,
    ) -> Result<Self> {
        Self::with_config(name, pipeline, ChannelConfig::default(), rpc_timeout)
    }

    /// Create a disconnected channel.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an invalid `config` or an `rpc_timeout`
    /// below the 3 s minimum.
    pub fn with_config(
        name: impl Into<String>,
        pipeline: Arc<HandlerPipeline>,
        config: ChannelConfig,
        rpc_timeout: Option<Duration>,
    ) -> Result<Self> {
        config.validate()?;
        let rpc = rpc_timeout.map(RpcState::new).transpose()?;

        let session = Session {
            state: ChannelState::Disconnected,
            receive: ReceiveBuffer::with_capacity(config.receive_buffer_capacity),
            heartbeat: HeartbeatState::new(config.heartbeat_interval, config.miss_heartbeat_threshold),
            link: None,
            user_data: None,
        };
        let outbound = Outbound {
            buffer: SendBuffer::with_capacity(config.send_buffer_capacity),
            tx: None,
        };

        Ok(Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                config,
                pipeline,
                rpc,
                router: RwLock::new(Default::default()),
                events: RwLock::new(Some(Arc::new(EventHub::new()))),
                outbound: Mutex::new(outbound),
                session: Mutex::new(session),
            }),
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Shared handler pipeline.
    pub fn pipeline(&self) -> &Arc<HandlerPipeline> {
        &self.inner.pipeline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.session.lock().state
    }

    /// Check if the transport is up.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Consecutive unanswered heartbeat intervals.
    pub fn missed_heartbeats(&self) -> u32 {
        self.inner.session.lock().heartbeat.miss_count()
    }

    /// Check if two handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Connect over TCP on the current tokio runtime.
    ///
    /// Returns once the connection attempt is started; the outcome arrives
    /// as a Connected or Error event during a later `update`.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` outside a tokio runtime, `Busy` unless the
    /// channel is disconnected.
    pub fn connect(&self, addr: SocketAddr, user_data: Option<UserData>) -> Result<()> {
        let runtime = current_runtime()?;
        let capacity = self.inner.config.outbound_queue_capacity;
        self.open(user_data, || Link::connect_tcp(&runtime, addr, capacity))?;
        info!(channel = %self.inner.name, %addr, "Connecting");
        Ok(())
    }

    /// Attach an already established stream (TLS, in-memory duplex, ...).
    ///
    /// # Errors
    ///
    /// Same as [`Channel::connect`].
    pub fn connect_stream<S>(&self, stream: S, user_data: Option<UserData>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let runtime = current_runtime()?;
        let capacity = self.inner.config.outbound_queue_capacity;
        self.open(user_data, || Link::attach(&runtime, stream, capacity))?;
        info!(channel = %self.inner.name, "Attaching stream");
        Ok(())
    }

    fn open(&self, user_data: Option<UserData>, start: impl FnOnce() -> Link) -> Result<()> {
        let mut session = self.inner.session.lock();
        if session.state != ChannelState::Disconnected {
            return Err(NetworkError::Busy(session.state));
        }

        session.receive.clear();
        session.heartbeat.reset();
        session.user_data = user_data;
        session.link = Some(start());
        session.state = ChannelState::Connecting;
        Ok(())
    }

    /// Close the connection.
    ///
    /// Emits Closed and fails every pending call with `ChannelClosed`.
    /// Does nothing if already disconnected.
    pub fn close(&self) {
        let mut deferred = Vec::new();
        {
            let mut session = self.inner.session.lock();
            if session.state == ChannelState::Disconnected {
                return;
            }
            info!(channel = %self.inner.name, "Closing");
            self.teardown(&mut session, Notice::Closed, &mut deferred);
        }
        self.run_deferred(deferred);
    }

    /// Serialize `message` and queue it for the writer task.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, a serialization or `MissingStrategy` error,
    /// `SendQueueFull` when the writer is behind, or `ConnectionClosed` when
    /// the writer task is gone.
    pub fn send(&self, message: &dyn Message) -> Result<()> {
        let mut outbound = self.inner.outbound.lock();
        let Outbound { buffer, tx } = &mut *outbound;
        let tx = tx.as_ref().ok_or(NetworkError::NotConnected)?;

        let frame = buffer.build(message, &self.inner.pipeline)?;
        let len = frame.len();
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::SendQueueFull,
            TrySendError::Closed(_) => NetworkError::ConnectionClosed,
        })?;

        trace!(
            channel = %self.inner.name,
            unique_id = message.unique_id(),
            message_type_id = message.message_type_id(),
            len,
            "Frame queued"
        );
        Ok(())
    }

    /// Send `request` and return a handle for its reply.
    ///
    /// The request's `UniqueId` correlates the reply. If a call with the
    /// same id is still pending, the existing handle is shared and nothing
    /// is sent.
    ///
    /// # Errors
    ///
    /// Returns `RpcDisabled` if the channel has no RPC timeout,
    /// `NotConnected`, or the send error (the call is then failed with
    /// `SendFailed`).
    pub fn call<M: Message>(&self, request: M) -> Result<RpcHandle> {
        let rpc = self.inner.rpc.as_ref().ok_or(NetworkError::RpcDisabled)?;
        if !self.is_connected() {
            return Err(NetworkError::NotConnected);
        }

        let request: Arc<dyn Message> = Arc::new(request);
        let unique_id = request.unique_id();
        let (handle, created) = rpc.register(request.clone());
        if created {
            if let Err(error) = self.send(request.as_ref()) {
                rpc.fail(unique_id, RpcError::SendFailed(error.to_string()));
                return Err(error);
            }
        }
        Ok(handle)
    }

    /// Route inbound messages of type `M` to `handler`.
    pub fn on<M, F>(&self, handler: F)
    where
        M: MessageType,
        F: Fn(&Channel, &M) + Send + Sync + 'static,
    {
        self.inner.router.write().route_type::<M, F>(handler);
    }

    /// Route inbound messages with `message_type_id` to `handler`.
    pub fn on_message<F>(&self, message_type_id: u32, handler: F)
    where
        F: Fn(&Channel, Arc<dyn Message>) + Send + Sync + 'static,
    {
        self.inner.router.write().route(message_type_id, Arc::new(handler));
    }

    /// Handle inbound messages that have no dedicated route.
    pub fn set_default_handler<F>(&self, handler: F)
    where
        F: Fn(&Channel, Arc<dyn Message>) + Send + Sync + 'static,
    {
        self.inner.router.write().set_fallback(Arc::new(handler));
    }

    /// Remove the route for `message_type_id`.
    pub fn remove_handler(&self, message_type_id: u32) -> bool {
        self.inner.router.write().remove(message_type_id)
    }

    /// Subscribe to RPC lifecycle events.
    ///
    /// # Errors
    ///
    /// Returns `RpcDisabled` if the channel has no RPC timeout.
    pub fn subscribe_rpc<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&RpcEvent) + Send + Sync + 'static,
    {
        let rpc = self.inner.rpc.as_ref().ok_or(NetworkError::RpcDisabled)?;
        Ok(rpc.subscribe(callback))
    }

    /// Number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.rpc.as_ref().map_or(0, RpcState::pending_count)
    }

    /// RPC timeout, if RPC is enabled.
    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.inner.rpc.as_ref().map(RpcState::timeout)
    }

    /// Hub receiving this channel's lifecycle events.
    ///
    /// A standalone channel owns its hub; a registry channel shares the
    /// registry's. `None` once detached from a registry.
    pub fn events(&self) -> Option<Arc<EventHub<ChannelEvent>>> {
        self.inner.events.read().clone()
    }

    pub(crate) fn attach_events(&self, hub: Arc<EventHub<ChannelEvent>>) {
        *self.inner.events.write() = Some(hub);
    }

    pub(crate) fn detach_events(&self) {
        *self.inner.events.write() = None;
    }

    /// Advance the channel by one tick.
    ///
    /// Drains transport events, parses and dispatches complete frames, runs
    /// the heartbeat on `real_elapsed` and the RPC timeout sweep on
    /// `elapsed`.
    pub fn update(&self, elapsed: Duration, real_elapsed: Duration) {
        let mut deferred = Vec::new();
        {
            let mut session = self.inner.session.lock();
            self.pump(&mut session, &mut deferred, MAX_LINK_EVENTS_PER_UPDATE);
            if session.state == ChannelState::Connected {
                self.tick_heartbeat(&mut session, real_elapsed, &mut deferred);
            }
        }
        self.run_deferred(deferred);

        if let Some(rpc) = &self.inner.rpc {
            rpc.update(elapsed);
        }
    }

    /// Handle at most `budget` transport events. Anything left waits for
    /// the next update.
    fn pump(&self, session: &mut Session, deferred: &mut Vec<Deferred>, budget: usize) {
        for _ in 0..budget {
            let polled = match session.link.as_mut() {
                Some(link) => link.try_recv(),
                None => return,
            };

            let event = match polled {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    warn!(channel = %self.inner.name, "Transport tasks exited");
                    self.teardown(session, Notice::Closed, deferred);
                    return;
                }
            };

            match event {
                LinkEvent::Connected { outbound } => {
                    self.inner.outbound.lock().tx = Some(outbound);
                    session.state = ChannelState::Connected;
                    session.heartbeat.reset();
                    info!(channel = %self.inner.name, "Connected");
                    deferred.push(Deferred::Emit(Notice::Connected(session.user_data.clone())));
                }
                LinkEvent::Received(bytes) => {
                    if let Err(fault) = self.receive(session, &bytes, deferred) {
                        error!(
                            channel = %self.inner.name,
                            code = %fault.code,
                            error = %fault.error,
                            "Inbound stream rejected"
                        );
                        self.teardown(session, fault.into_notice(), deferred);
                        return;
                    }
                }
                LinkEvent::Closed => {
                    info!(channel = %self.inner.name, "Peer closed the connection");
                    self.teardown(session, Notice::Closed, deferred);
                    return;
                }
                LinkEvent::Failed { code, error } => {
                    error!(channel = %self.inner.name, %code, %error, "Transport failed");
                    let notice = Notice::Error {
                        code,
                        transport_code: error.raw_os_error(),
                        message: error.to_string(),
                    };
                    self.teardown(session, notice, deferred);
                    return;
                }
            }
        }
    }

    fn receive(
        &self,
        session: &mut Session,
        bytes: &[u8],
        deferred: &mut Vec<Deferred>,
    ) -> std::result::Result<(), Fault> {
        let parser = self
            .inner
            .pipeline
            .header_deserializer()
            .map_err(|e| Fault::new(NetworkErrorCode::DeserializeHeaderError, e))?;
        let frames = session
            .receive
            .push(bytes, parser)
            .map_err(|e| Fault::new(NetworkErrorCode::DeserializeHeaderError, e))?;

        for frame in frames {
            session
                .heartbeat
                .on_liveness(self.inner.config.reset_heartbeat_on_receive);

            let message = self
                .decode(&frame)
                .map_err(|e| Fault::new(NetworkErrorCode::DeserializeBodyError, e))?;

            if message.is_heartbeat() {
                // acks are never answered
                if frame.is_heartbeat() {
                    trace!(channel = %self.inner.name, "Heartbeat received");
                    self.acknowledge_heartbeat();
                } else {
                    trace!(channel = %self.inner.name, "Heartbeat acknowledged");
                }
                continue;
            }

            deferred.push(Deferred::Dispatch(Arc::from(message)));
        }
        Ok(())
    }

    fn decode(&self, frame: &Frame) -> Result<Box<dyn Message>> {
        let pipeline = &self.inner.pipeline;
        let body: Cow<'_, [u8]> = if frame.is_compressed() {
            Cow::Owned(pipeline.decompressor()?.decompress(frame.body())?)
        } else {
            Cow::Borrowed(frame.body())
        };

        let mut message = pipeline
            .body_deserializer()?
            .deserialize_body(&body, frame.message_type_id())?;
        message.set_unique_id(frame.unique_id());
        Ok(message)
    }

    fn tick_heartbeat(&self, session: &mut Session, real_elapsed: Duration, deferred: &mut Vec<Deferred>) {
        match session.heartbeat.tick(real_elapsed) {
            HeartbeatTick::Idle => {}
            HeartbeatTick::Send { missed } => {
                if let Some(miss_count) = missed {
                    warn!(channel = %self.inner.name, miss_count, "Missed heartbeat");
                    deferred.push(Deferred::Emit(Notice::MissHeartBeat(miss_count)));
                }
                if let Err(error) = self.send_heartbeat() {
                    if let NetworkError::MissingStrategy(_) = error {
                        error!(channel = %self.inner.name, %error, "Cannot build heartbeat");
                        let fault = Fault::new(NetworkErrorCode::MissingStrategy, error);
                        self.teardown(session, fault.into_notice(), deferred);
                    } else {
                        warn!(channel = %self.inner.name, %error, "Failed to send heartbeat");
                    }
                }
            }
            HeartbeatTick::Expired { missed } => {
                warn!(channel = %self.inner.name, miss_count = missed, "Heartbeat expired, closing");
                deferred.push(Deferred::Emit(Notice::MissHeartBeat(missed)));
                self.teardown(session, Notice::Closed, deferred);
            }
        }
    }

    fn send_heartbeat(&self) -> Result<()> {
        let heartbeat = self.inner.pipeline.heartbeat_builder()?.build_heartbeat();
        self.send(heartbeat.as_ref())
    }

    fn acknowledge_heartbeat(&self) {
        let ack: Box<dyn Message> = match self.inner.pipeline.heartbeat_builder() {
            Ok(builder) => builder.build_heartbeat_ack(),
            Err(_) => Box::new(Heartbeat::ack()),
        };
        if let Err(error) = self.send(ack.as_ref()) {
            warn!(channel = %self.inner.name, %error, "Failed to acknowledge heartbeat");
        }
    }

    /// Drop the transport and reset per-connection state. `notice` is the
    /// single event reported for this transition.
    fn teardown(&self, session: &mut Session, notice: Notice, deferred: &mut Vec<Deferred>) {
        session.state = ChannelState::Closing;
        if let Some(link) = session.link.take() {
            link.shutdown();
        }
        self.inner.outbound.lock().tx = None;

        session.receive.clear();
        session.heartbeat.reset();
        session.user_data = None;
        session.state = ChannelState::Disconnected;

        deferred.push(Deferred::FailPending);
        deferred.push(Deferred::Emit(notice));
    }

    fn run_deferred(&self, deferred: Vec<Deferred>) {
        for work in deferred {
            match work {
                Deferred::Dispatch(message) => self.dispatch(message),
                Deferred::FailPending => {
                    if let Some(rpc) = &self.inner.rpc {
                        let failed = rpc.fail_all(RpcError::ChannelClosed);
                        if failed > 0 {
                            debug!(channel = %self.inner.name, failed, "Failed pending calls on close");
                        }
                    }
                }
                Deferred::Emit(notice) => self.emit(notice),
            }
        }
    }

    fn dispatch(&self, message: Arc<dyn Message>) {
        if message.error_code().is_some() {
            if let Some(rpc) = &self.inner.rpc {
                if rpc.try_reply(message.clone()) {
                    return;
                }
            }
        }

        let handler = self.inner.router.read().resolve(message.message_type_id());
        match handler {
            Some(handler) => handler(self, message),
            None if message.error_code().is_some() => debug!(
                channel = %self.inner.name,
                unique_id = message.unique_id(),
                "Unmatched reply dropped"
            ),
            None => warn!(
                channel = %self.inner.name,
                message_type_id = message.message_type_id(),
                unique_id = message.unique_id(),
                "No handler for message"
            ),
        }
    }

    fn emit(&self, notice: Notice) {
        let Some(hub) = self.events() else {
            return;
        };

        let channel = self.clone();
        let event = match notice {
            Notice::Connected(user_data) => ChannelEvent::Connected { channel, user_data },
            Notice::Closed => ChannelEvent::Closed { channel },
            Notice::MissHeartBeat(miss_count) => ChannelEvent::MissHeartBeat {
                channel,
                miss_count,
            },
            Notice::Error {
                code,
                transport_code,
                message,
            } => ChannelEvent::Error {
                channel,
                code,
                transport_code,
                message,
            },
        };
        hub.emit(&event);
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|e| NetworkError::NoRuntime(e.to_string()))
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("rpc_timeout", &self.rpc_timeout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::handler::{PacketHeaderDeserializer, PipelineConfig};
    use crate::message::testing::{test_types, Blob, Ping, Pong};
    use crate::protocol::{OperationType, PacketHeader, HEADER_SIZE};

    const SECOND: Duration = Duration::from_secs(1);

    fn pipeline() -> Arc<HandlerPipeline> {
        Arc::new(HandlerPipeline::with_defaults(test_types()))
    }

    /// Raw protocol endpoint on the other side of a duplex.
    struct Peer {
        stream: DuplexStream,
        receive: ReceiveBuffer,
        frames: VecDeque<Frame>,
        pipeline: HandlerPipeline,
    }

    impl Peer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                receive: ReceiveBuffer::new(),
                frames: VecDeque::new(),
                pipeline: HandlerPipeline::with_defaults(test_types()),
            }
        }

        async fn send(&mut self, message: &dyn Message) {
            let frame = SendBuffer::new().build(message, &self.pipeline).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        async fn next_frame(&mut self) -> Frame {
            let parser = PacketHeaderDeserializer::default();
            let mut buf = vec![0u8; 4096];
            while self.frames.is_empty() {
                let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                    .await
                    .expect("peer read timed out")
                    .unwrap();
                assert!(n > 0, "channel closed the stream");
                self.frames.extend(self.receive.push(&buf[..n], &parser).unwrap());
            }
            self.frames.pop_front().unwrap()
        }

        async fn next_message(&mut self) -> Box<dyn Message> {
            let frame = self.next_frame().await;
            let body = if frame.is_compressed() {
                self.pipeline.decompressor().unwrap().decompress(frame.body()).unwrap()
            } else {
                frame.body().to_vec()
            };
            let mut message = self
                .pipeline
                .body_deserializer()
                .unwrap()
                .deserialize_body(&body, frame.message_type_id())
                .unwrap();
            message.set_unique_id(frame.unique_id());
            message
        }
    }

    fn record(channel: &Channel) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        channel.events().unwrap().subscribe(move |event| {
            let entry = match event {
                ChannelEvent::Connected { .. } => "connected".to_string(),
                ChannelEvent::Closed { .. } => "closed".to_string(),
                ChannelEvent::MissHeartBeat { miss_count, .. } => format!("miss:{miss_count}"),
                ChannelEvent::Error { code, .. } => format!("error:{code:?}"),
            };
            sink.lock().push(entry);
        });
        log
    }

    async fn pump_until(channel: &Channel, mut done: impl FnMut() -> bool) {
        for _ in 0..1000 {
            channel.update(Duration::ZERO, Duration::ZERO);
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    /// Tick every channel with zero time until in-flight frames land.
    async fn settle(channels: &[&Channel]) {
        for _ in 0..10 {
            for channel in channels {
                channel.update(Duration::ZERO, Duration::ZERO);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn connected(channel: &Channel) -> Peer {
        let (local, remote) = duplex(64 * 1024);
        channel.connect_stream(local, None).unwrap();
        pump_until(channel, || channel.is_connected()).await;
        Peer::new(remote)
    }

    #[test]
    fn test_rpc_timeout_floor_enforced() {
        let err = Channel::new("c", pipeline(), Some(Duration::from_millis(100))).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidConfig(_)));
    }

    #[test]
    fn test_connect_outside_runtime() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let (local, _remote) = duplex(64);
        let err = channel.connect_stream(local, None).unwrap_err();
        assert!(matches!(err, NetworkError::NoRuntime(_)));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_send_requires_connection() {
        let channel = Channel::new("c", pipeline(), Some(SECOND * 3)).unwrap();
        assert!(matches!(channel.send(&Ping::new(1, "x")), Err(NetworkError::NotConnected)));
        assert!(matches!(channel.call(Ping::new(1, "x")), Err(NetworkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connected_event_carries_user_data() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let seen = Arc::new(Mutex::new(None));
        {
            let seen = seen.clone();
            channel.events().unwrap().subscribe(move |event| {
                if let ChannelEvent::Connected { user_data, .. } = event {
                    let value = user_data.as_ref().and_then(|d| d.downcast_ref::<u32>()).copied();
                    *seen.lock() = value;
                }
            });
        }

        let (local, _remote) = duplex(1024);
        channel.connect_stream(local, Some(Arc::new(77u32))).unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);
        pump_until(&channel, || channel.is_connected()).await;

        assert_eq!(*seen.lock(), Some(77));
    }

    #[tokio::test]
    async fn test_connect_while_busy() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let _peer = connected(&channel).await;

        let (local, _remote) = duplex(64);
        let err = channel.connect_stream(local, None).unwrap_err();
        assert!(matches!(err, NetworkError::Busy(ChannelState::Connected)));
    }

    #[tokio::test]
    async fn test_inbound_message_routed_and_answered() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let answered = Arc::new(AtomicUsize::new(0));
        {
            let answered = answered.clone();
            channel.on::<Ping, _>(move |channel, ping| {
                let reply = Pong::new(ping.unique_id, 0, &ping.text.to_uppercase());
                channel.send(&reply).unwrap();
                answered.fetch_add(1, Ordering::SeqCst);
            });
        }
        let mut peer = connected(&channel).await;

        peer.send(&Ping::new(12, "hello")).await;
        pump_until(&channel, || answered.load(Ordering::SeqCst) == 1).await;

        let reply = peer.next_message().await;
        let pong = reply.downcast_ref::<Pong>().unwrap();
        assert_eq!(pong.unique_id, 12);
        assert_eq!(pong.text, "HELLO");
    }

    #[tokio::test]
    async fn test_call_resolves_on_reply() {
        let channel = Channel::new("c", pipeline(), Some(SECOND * 3)).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            channel
                .subscribe_rpc(move |event| {
                    let name = match event {
                        RpcEvent::Started { .. } => "start",
                        RpcEvent::Finished { .. } => "end",
                        RpcEvent::ErrorCode { .. } => "code",
                        RpcEvent::Failed { .. } => "error",
                    };
                    events.lock().push(name);
                })
                .unwrap();
        }
        let mut peer = connected(&channel).await;

        let handle = channel.call(Ping::new(40, "question")).unwrap();
        let request = peer.next_message().await;
        assert_eq!(request.unique_id(), 40);
        assert_eq!(channel.pending_calls(), 1);

        peer.send(&Pong::new(40, 0, "answer")).await;
        pump_until(&channel, || handle.try_result().is_some()).await;

        let response = handle.await.unwrap();
        assert_eq!(response.downcast_ref::<Pong>().unwrap().text, "answer");
        assert_eq!(channel.pending_calls(), 0);
        assert_eq!(*events.lock(), vec!["start", "end"]);
    }

    #[tokio::test]
    async fn test_duplicate_call_sends_once() {
        let channel = Channel::new("c", pipeline(), Some(SECOND * 3)).unwrap();
        let mut peer = connected(&channel).await;

        let first = channel.call(Ping::new(5, "a")).unwrap();
        let second = channel.call(Ping::new(5, "a")).unwrap();
        assert!(first.same_call(&second));

        // only one request frame, followed by the marker
        channel.send(&Ping::new(6, "marker")).unwrap();
        assert_eq!(peer.next_frame().await.unique_id(), 5);
        assert_eq!(peer.next_frame().await.unique_id(), 6);
    }

    #[tokio::test]
    async fn test_call_times_out_on_logical_time() {
        let channel = Channel::new("c", pipeline(), Some(SECOND * 3)).unwrap();
        let _peer = connected(&channel).await;

        let handle = channel.call(Ping::new(8, "lost")).unwrap();
        channel.update(SECOND * 2, Duration::ZERO);
        assert!(handle.try_result().is_none());
        channel.update(SECOND, Duration::ZERO);

        assert!(matches!(
            handle.try_result(),
            Some(Err(RpcError::Timeout { unique_id: 8, .. }))
        ));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_calls() {
        let channel = Channel::new("c", pipeline(), Some(SECOND * 3)).unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        let handle = channel.call(Ping::new(9, "never")).unwrap();
        assert_eq!(peer.next_frame().await.unique_id(), 9);
        drop(peer);
        pump_until(&channel, || !channel.is_connected()).await;

        assert!(matches!(handle.try_result(), Some(Err(RpcError::ChannelClosed))));
        assert_eq!(channel.pending_calls(), 0);
        assert_eq!(*log.lock(), vec!["connected", "closed"]);
    }

    #[tokio::test]
    async fn test_close_emits_once() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let log = record(&channel);
        let _peer = connected(&channel).await;

        channel.close();
        channel.close();

        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(*log.lock(), vec!["connected", "closed"]);
        assert!(matches!(channel.send(&Ping::new(1, "x")), Err(NetworkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let _first = connected(&channel).await;
        channel.close();

        let mut second = connected(&channel).await;
        channel.send(&Ping::new(2, "again")).unwrap();
        assert_eq!(second.next_frame().await.unique_id(), 2);
    }

    #[tokio::test]
    async fn test_malformed_header_closes_with_error() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        let mut bytes = PacketHeader::new(HEADER_SIZE as u32, OperationType::Message, false, 1, 1).encode();
        bytes[4] = 9;
        peer.send_raw(&bytes).await;
        pump_until(&channel, || !channel.is_connected()).await;

        assert_eq!(*log.lock(), vec!["connected", "error:DeserializeHeaderError"]);
    }

    #[tokio::test]
    async fn test_unknown_message_type_closes_with_error() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        let header = PacketHeader::new(HEADER_SIZE as u32, OperationType::Message, false, 1, 4040);
        peer.send_raw(&header.encode()).await;
        pump_until(&channel, || !channel.is_connected()).await;

        assert_eq!(*log.lock(), vec!["connected", "error:DeserializeBodyError"]);
    }

    #[tokio::test]
    async fn test_missing_body_deserializer_reported() {
        let pipeline = HandlerPipeline::new()
            .with_header_serializer(crate::handler::PacketHeaderSerializer::default())
            .with_body_serializer(crate::handler::RawBodySerializer)
            .with_header_deserializer(PacketHeaderDeserializer::default());
        let channel = Channel::with_config(
            "c",
            Arc::new(pipeline),
            ChannelConfig::default().with_heartbeat_interval(Duration::ZERO),
            None,
        )
        .unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        peer.send(&Ping::new(1, "x")).await;
        pump_until(&channel, || !channel.is_connected()).await;

        assert_eq!(*log.lock(), vec!["connected", "error:MissingStrategy"]);
    }

    #[tokio::test]
    async fn test_compressed_inbound_body() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let received = Arc::new(Mutex::new(None));
        {
            let received = received.clone();
            channel.on_message(Blob::TYPE_ID, move |_, message| {
                *received.lock() = message.downcast_ref::<Blob>().cloned();
            });
        }
        let mut peer = connected(&channel).await;

        let blob = Blob {
            unique_id: 3,
            data: vec![1u8; 4096],
        };
        peer.send(&blob).await;
        pump_until(&channel, || received.lock().is_some()).await;

        let got = received.lock().clone().unwrap();
        assert_eq!(got.unique_id, 3);
        assert_eq!(got.data, blob.data);
    }

    #[tokio::test]
    async fn test_heartbeat_escalation() {
        let config = ChannelConfig::default()
            .with_heartbeat_interval(SECOND)
            .with_miss_heartbeat_threshold(3);
        let channel = Channel::with_config("c", pipeline(), config, None).unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        for _ in 0..4 {
            channel.update(Duration::ZERO, SECOND);
        }

        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(*log.lock(), vec!["connected", "miss:1", "miss:2", "miss:3", "closed"]);

        // one heartbeat per interval before expiry
        for _ in 0..3 {
            let frame = peer.next_frame().await;
            assert!(frame.is_heartbeat());
            assert_eq!(frame.wire_len(), HEADER_SIZE);
        }
    }

    #[tokio::test]
    async fn test_inbound_traffic_resets_misses() {
        let config = ChannelConfig::default()
            .with_heartbeat_interval(SECOND)
            .with_miss_heartbeat_threshold(3);
        let channel = Channel::with_config("c", pipeline(), config, None).unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        channel.update(Duration::ZERO, SECOND);
        channel.update(Duration::ZERO, SECOND);
        assert_eq!(channel.missed_heartbeats(), 1);

        peer.send(&Heartbeat::new()).await;
        pump_until(&channel, || channel.missed_heartbeats() == 0).await;

        channel.update(Duration::ZERO, SECOND);
        channel.update(Duration::ZERO, SECOND);
        assert!(channel.is_connected());
        assert_eq!(*log.lock(), vec!["connected", "miss:1", "miss:1"]);
    }

    #[tokio::test]
    async fn test_unrouted_message_is_dropped() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let pongs = Arc::new(AtomicUsize::new(0));
        let fallback_hits = Arc::new(AtomicUsize::new(0));
        {
            let pongs = pongs.clone();
            channel.on::<Pong, _>(move |_, _| {
                pongs.fetch_add(1, Ordering::SeqCst);
            });
        }
        let mut peer = connected(&channel).await;

        peer.send(&Ping::new(1, "nobody listens")).await;
        peer.send(&Pong::new(2, 0, "routed")).await;
        pump_until(&channel, || pongs.load(Ordering::SeqCst) == 1).await;
        assert!(channel.is_connected());

        {
            let hits = fallback_hits.clone();
            channel.set_default_handler(move |_, message| {
                assert_eq!(message.unique_id(), 3);
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        peer.send(&Ping::new(3, "fallback")).await;
        pump_until(&channel, || fallback_hits.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_custom_threshold_applies_on_send() {
        let pipeline = HandlerPipeline::with_config(
            test_types(),
            PipelineConfig::default().with_compression_threshold(4),
        );
        let channel = Channel::new("c", Arc::new(pipeline), None).unwrap();
        let mut peer = connected(&channel).await;

        channel.send(&Blob::sized(5)).unwrap();
        assert!(peer.next_frame().await.is_compressed());
    }

    #[tokio::test]
    async fn test_heartbeat_request_is_acknowledged() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let mut peer = connected(&channel).await;

        peer.send(&Heartbeat::new()).await;
        settle(&[&channel]).await;

        let ack = peer.next_frame().await;
        assert!(ack.is_heartbeat_ack());
        assert_eq!(ack.wire_len(), HEADER_SIZE);
    }

    #[tokio::test]
    async fn test_heartbeat_ack_is_not_answered() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let mut peer = connected(&channel).await;

        peer.send(&Heartbeat::ack()).await;
        settle(&[&channel]).await;
        channel.send(&Ping::new(6, "after")).unwrap();

        let next = peer.next_frame().await;
        assert!(!next.is_heartbeat() && !next.is_heartbeat_ack());
        assert_eq!(next.unique_id(), 6);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_out_of_phase_peers_stay_connected() {
        let config = ChannelConfig::default()
            .with_heartbeat_interval(SECOND)
            .with_miss_heartbeat_threshold(1);
        let a = Channel::with_config("a", pipeline(), config.clone(), None).unwrap();
        let b = Channel::with_config("b", pipeline(), config, None).unwrap();
        let log_a = record(&a);
        let log_b = record(&b);

        let (left, right) = duplex(64 * 1024);
        a.connect_stream(left, None).unwrap();
        b.connect_stream(right, None).unwrap();
        pump_until(&a, || a.is_connected()).await;
        pump_until(&b, || b.is_connected()).await;

        // b's clock runs 300ms ahead of a's
        b.update(Duration::ZERO, Duration::from_millis(300));
        for _ in 0..12 {
            a.update(Duration::ZERO, Duration::from_millis(250));
            b.update(Duration::ZERO, Duration::from_millis(250));
            settle(&[&a, &b]).await;
        }

        assert!(a.is_connected());
        assert!(b.is_connected());
        assert_eq!(*log_a.lock(), vec!["connected"]);
        assert_eq!(*log_b.lock(), vec!["connected"]);
    }

    #[tokio::test]
    async fn test_heartbeat_body_is_deserialized() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        let header = PacketHeader::new(HEADER_SIZE as u32, OperationType::Heartbeat, false, 0, 4040);
        peer.send_raw(&header.encode()).await;
        pump_until(&channel, || !channel.is_connected()).await;

        assert_eq!(*log.lock(), vec!["connected", "error:DeserializeBodyError"]);
    }

    #[tokio::test]
    async fn test_inflated_body_over_limit_rejected() {
        let pipeline = HandlerPipeline::with_config(
            test_types(),
            PipelineConfig::default().with_max_body_size(64 * 1024),
        );
        let channel = Channel::new("c", Arc::new(pipeline), None).unwrap();
        let log = record(&channel);
        let mut peer = connected(&channel).await;

        peer.send(&Blob {
            unique_id: 1,
            data: vec![0; 1024 * 1024],
        })
        .await;
        pump_until(&channel, || !channel.is_connected()).await;

        assert_eq!(*log.lock(), vec!["connected", "error:DeserializeBodyError"]);
    }

    #[tokio::test]
    async fn test_update_handles_bounded_number_of_events() {
        let channel = Channel::new("c", pipeline(), None).unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        {
            let handled = handled.clone();
            channel.on::<Ping, _>(move |_, _| {
                handled.fetch_add(1, Ordering::SeqCst);
            });
        }

        let (link, events, _shutdown) = Link::pair();
        channel.inner.session.lock().link = Some(link);
        let (outbound, _writer) = mpsc::channel(8);
        events.try_send(LinkEvent::Connected { outbound }).unwrap();
        let frame = SendBuffer::new()
            .build(&Ping::new(1, "x"), channel.pipeline())
            .unwrap();
        for _ in 0..5 {
            events.try_send(LinkEvent::Received(frame.clone())).unwrap();
        }

        let mut deferred = Vec::new();
        {
            let mut session = channel.inner.session.lock();
            channel.pump(&mut session, &mut deferred, 3);
        }
        channel.run_deferred(deferred);
        assert!(channel.is_connected());
        assert_eq!(handled.load(Ordering::SeqCst), 2);

        channel.update(Duration::ZERO, Duration::ZERO);
        assert_eq!(handled.load(Ordering::SeqCst), 5);
    }
}
