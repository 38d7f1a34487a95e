//! Error types for tickwire.

use std::fmt;

use thiserror::Error;

/// Main error type for all channel operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error while encoding a message body.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error while decoding a message body.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed header, bad flags, oversized body, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No decoder is registered for the message type id carried in a header.
    #[error("Unknown message type id: {0}")]
    UnknownMessageType(u32),

    /// A required handler strategy was never registered on the pipeline.
    #[error("No strategy registered for capability: {0}")]
    MissingStrategy(Capability),

    /// Body compression or decompression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A channel with the given name is already registered.
    #[error("Channel '{0}' already exists")]
    ChannelExists(String),

    /// Operation requires a connected channel.
    #[error("Channel is not connected")]
    NotConnected,

    /// `connect` was called on a channel that is not disconnected.
    #[error("Channel is busy (state: {0:?})")]
    Busy(crate::channel::ChannelState),

    /// The transport tasks are gone.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The outbound frame queue is full.
    #[error("Send queue full")]
    SendQueueFull,

    /// `call` was used on a channel created without an RPC timeout.
    #[error("RPC is not enabled on this channel")]
    RpcDisabled,

    /// No tokio runtime is available to drive the transport.
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

impl NetworkError {
    /// OS-level error code of the transport failure, if any.
    pub fn transport_code(&self) -> Option<i32> {
        match self {
            NetworkError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias using NetworkError.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Error category reported through the channel Error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorCode {
    /// The transport could not be established.
    ConnectError,
    /// Writing to the transport failed.
    SendError,
    /// Reading from the transport failed.
    ReceiveError,
    /// An outbound message could not be serialized.
    SerializeError,
    /// An inbound header was malformed.
    DeserializeHeaderError,
    /// An inbound body could not be decompressed or decoded.
    DeserializeBodyError,
    /// A required pipeline strategy is missing.
    MissingStrategy,
}

impl fmt::Display for NetworkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorCode::ConnectError => "connect error",
            NetworkErrorCode::SendError => "send error",
            NetworkErrorCode::ReceiveError => "receive error",
            NetworkErrorCode::SerializeError => "serialize error",
            NetworkErrorCode::DeserializeHeaderError => "deserialize header error",
            NetworkErrorCode::DeserializeBodyError => "deserialize body error",
            NetworkErrorCode::MissingStrategy => "missing strategy",
        };
        f.write_str(name)
    }
}

/// The seven replaceable strategies of a handler pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Writes the packet header and produces the wire body.
    SerializeHeader,
    /// Appends body bytes to the send buffer.
    SerializeBody,
    /// Parses and validates an inbound header.
    DeserializeHeader,
    /// Materializes a message from body bytes.
    DeserializeBody,
    /// Compresses outbound bodies.
    Compress,
    /// Decompresses inbound bodies.
    Decompress,
    /// Builds the heartbeat message.
    BuildHeartbeat,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
