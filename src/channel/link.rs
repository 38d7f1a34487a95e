//! Transport tasks for one connection.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─► reader task ── LinkEvent ──► mpsc ──► Channel::update (try_recv)
//! stream ─ split ─┤
//!                 └─◄ writer task ◄── Bytes ◄──── mpsc ◄── Channel::send (try_send)
//! ```
//!
//! The tick thread never awaits: it drains link events with `try_recv` and
//! enqueues finished frames with `try_send`. The writer task is the only
//! writer on the stream and writes whole frames, so frames never interleave.
//! Dropping or shutting down the [`Link`] stops both tasks.

use std::io::{self, IoSlice};
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::NetworkErrorCode;

/// Link events buffered between the reader task and the tick.
pub(super) const LINK_EVENT_CAPACITY: usize = 256;

/// Bytes reserved for each read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// What the transport tasks report to the channel.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// The stream is up. Frames for the writer task go to `outbound`.
    Connected { outbound: mpsc::Sender<Bytes> },
    /// Bytes read from the stream.
    Received(Bytes),
    /// The peer closed the stream.
    Closed,
    /// The transport failed.
    Failed {
        code: NetworkErrorCode,
        error: io::Error,
    },
}

/// Channel-side end of the transport tasks.
pub(crate) struct Link {
    events: mpsc::Receiver<LinkEvent>,
    shutdown: watch::Sender<bool>,
}

impl Link {
    /// Connect to `addr` over TCP on `runtime`.
    pub(crate) fn connect_tcp(runtime: &Handle, addr: SocketAddr, queue_capacity: usize) -> Self {
        let (link, events, shutdown) = Self::pair();
        runtime.spawn(run_tcp(addr, events, shutdown, queue_capacity));
        link
    }

    /// Drive an already established stream on `runtime`.
    pub(crate) fn attach<S>(runtime: &Handle, stream: S, queue_capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, events, shutdown) = Self::pair();
        runtime.spawn(run_stream(stream, events, shutdown, queue_capacity));
        link
    }

    pub(super) fn pair() -> (Self, mpsc::Sender<LinkEvent>, watch::Receiver<bool>) {
        let (events_tx, events) = mpsc::channel(LINK_EVENT_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        (Self { events, shutdown }, events_tx, shutdown_rx)
    }

    /// Next pending event without waiting.
    pub(crate) fn try_recv(&mut self) -> std::result::Result<LinkEvent, TryRecvError> {
        self.events.try_recv()
    }

    /// Stop both tasks. The writer shuts its half of the stream down.
    pub(crate) fn shutdown(self) {
        self.shutdown.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) async fn next_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }
}

/// Resolves once shutdown is requested or the [`Link`] is dropped.
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn run_tcp(
    addr: SocketAddr,
    events: mpsc::Sender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
    queue_capacity: usize,
) {
    let stream = tokio::select! {
        result = TcpStream::connect(addr) => match result {
            Ok(stream) => stream,
            Err(error) => {
                error!(%addr, %error, "Connect failed");
                let _ = events
                    .send(LinkEvent::Failed {
                        code: NetworkErrorCode::ConnectError,
                        error,
                    })
                    .await;
                return;
            }
        },
        _ = shutdown_requested(shutdown.clone()) => return,
    };

    if let Err(error) = stream.set_nodelay(true) {
        warn!(%addr, %error, "Failed to set TCP_NODELAY");
    }
    debug!(%addr, "TCP connected");

    run_stream(stream, events, shutdown, queue_capacity).await;
}

async fn run_stream<S>(
    stream: S,
    events: mpsc::Sender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
    queue_capacity: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::channel(queue_capacity);
    if events.send(LinkEvent::Connected { outbound }).await.is_err() {
        return;
    }

    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(write_loop(writer, outbound_rx, events.clone(), shutdown.clone()));
    read_loop(reader, events, shutdown).await;
}

/// Forward received bytes until end-of-stream, error, or shutdown.
async fn read_loop<R>(mut reader: R, events: mpsc::Sender<LinkEvent>, shutdown: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    let stop = shutdown_requested(shutdown);
    tokio::pin!(stop);

    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buffer.reserve(READ_CHUNK_SIZE);
        let event = tokio::select! {
            _ = &mut stop => return,
            result = reader.read_buf(&mut buffer) => match result {
                Ok(0) => LinkEvent::Closed,
                Ok(_) => LinkEvent::Received(buffer.split().freeze()),
                Err(error) => LinkEvent::Failed {
                    code: NetworkErrorCode::ReceiveError,
                    error,
                },
            },
        };

        let terminal = !matches!(event, LinkEvent::Received(_));
        if events.send(event).await.is_err() || terminal {
            return;
        }
    }
}

/// Drain the outbound queue, batching ready frames into one vectored write.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let stop = shutdown_requested(shutdown);
    tokio::pin!(stop);

    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        // queued frames are flushed before a shutdown is honoured
        let first = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = &mut stop => break,
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match outbound.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        batch.clear();
        if let Err(error) = result {
            error!(%error, "Write failed");
            let _ = events
                .send(LinkEvent::Failed {
                    code: NetworkErrorCode::SendError,
                    error,
                })
                .await;
            return;
        }
    }

    let _ = writer.shutdown().await;
}

/// Write whole frames, continuing after partial vectored writes.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(Bytes::len).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        written += n;
    }

    writer.flush().await
}

/// Slices covering everything after the first `skip` bytes of `batch`.
fn remaining_slices(batch: &[Bytes], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip < end {
            slices.push(IoSlice::new(&frame[skip.saturating_sub(offset)..]));
        }
        offset = end;
    }

    slices
}
