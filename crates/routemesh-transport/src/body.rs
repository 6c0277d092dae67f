//! Lazily streamed request/response bodies.
//!
//! A [`Body`] is either detached (only an in-memory buffer), receiving (a
//! background task pulls chunks off an inbound stream into a relay queue of
//! capacity [`RELAY_CAPACITY`]) or sending (a background task slices the
//! buffer into chunks and then forwards whatever is still queued). Only the
//! parts of a body a handler actually reads are ever buffered; the rest is
//! relayed chunk by chunk, so proxying a body costs O(chunk size) memory
//! regardless of its length.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, debug_span, warn, Instrument};

use crate::error::{Result, TransportError};
use crate::protocol::{Chunk, MAX_CHUNK_SIZE};
use crate::stream::ChunkStream;

/// Capacity of the queue between a body's receiver task and its reader or
/// sender task.
pub const RELAY_CAPACITY: usize = 1;

/// Faults reported by a body's background task.
///
/// The channel closes when the task finishes, so draining it to exhaustion
/// waits for the task.
#[derive(Debug)]
pub struct StreamErrors {
    rx: mpsc::Receiver<TransportError>,
}

impl StreamErrors {
    fn new(rx: mpsc::Receiver<TransportError>) -> Self {
        Self { rx }
    }

    /// Next reported fault, `None` once the task has finished.
    pub async fn next(&mut self) -> Option<TransportError> {
        self.rx.recv().await
    }

    /// Waits for the task to finish, logging every fault. Returns the first
    /// fault, if any.
    pub async fn wait(mut self) -> Result<()> {
        let mut first = None;
        while let Some(e) = self.rx.recv().await {
            warn!(error = %e, "error during stream");
            if first.is_none() {
                first = Some(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Logs faults from a detached task until the body task finishes.
    pub fn log_in_background(mut self) {
        tokio::spawn(async move {
            while let Some(e) = self.rx.recv().await {
                warn!(error = %e, "error during stream");
            }
        });
    }
}

/// Lazy byte container backing a request or response.
#[derive(Debug, Default)]
pub struct Body {
    buffer: Vec<u8>,
    relay: Option<mpsc::Receiver<Vec<u8>>>,
}

impl Body {
    /// Create an empty, detached body.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether chunks may still arrive from a connected stream.
    pub fn is_receiving(&self) -> bool {
        self.relay.is_some()
    }

    /// Bytes loaded so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Starts a task that relays body chunks from `stream` into this body.
    ///
    /// The queue closes on clean end-of-stream or when the stream's context
    /// is cancelled. Transport faults are reported on the returned channel.
    pub fn connect_receive(&mut self, stream: Arc<dyn ChunkStream>) -> Result<StreamErrors> {
        if self.relay.is_some() {
            return Err(TransportError::AlreadyReceiving);
        }
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);
        self.relay = Some(relay_rx);

        tokio::spawn(
            async move {
                if let Err(e) = relay_from_stream(stream.as_ref(), relay_tx).await {
                    warn!(error = %e, "error receiving chunk");
                    let _ = err_tx.send(e).await;
                }
            }
            .instrument(debug_span!("body_receive")),
        );
        Ok(StreamErrors::new(err_rx))
    }

    /// Starts a task that sends this body to `stream`: first the buffered
    /// bytes in chunks of at most [`MAX_CHUNK_SIZE`], then every chunk still
    /// arriving from a connected receive stream. The initiating side
    /// half-closes once everything was sent.
    pub fn connect_send(self, stream: Arc<dyn ChunkStream>) -> StreamErrors {
        let (err_tx, err_rx) = mpsc::channel(1);
        let Body { buffer, relay } = self;
        let span = debug_span!("body_send", initiator = stream.is_initiator());

        tokio::spawn(
            async move {
                if let Err(e) = relay_to_stream(stream.as_ref(), buffer, relay).await {
                    let _ = err_tx.send(e).await;
                }
            }
            .instrument(span),
        );
        StreamErrors::new(err_rx)
    }

    async fn fill(&mut self, want: Option<usize>) {
        while want.map_or(true, |n| self.buffer.len() < n) {
            let Some(relay) = self.relay.as_mut() else {
                break;
            };
            match relay.recv().await {
                Some(bytes) => self.buffer.extend_from_slice(&bytes),
                None => {
                    self.relay = None;
                    break;
                }
            }
        }
    }

    /// Loads until at least `n` bytes are buffered and returns the first `n`.
    ///
    /// Fails with [`TransportError::BodyTooSmall`], carrying the bytes that
    /// were available, if the body ends first.
    pub async fn read(&mut self, n: usize) -> Result<&[u8]> {
        self.fill(Some(n)).await;
        if self.buffer.len() >= n {
            Ok(&self.buffer[..n])
        } else {
            Err(TransportError::BodyTooSmall {
                requested: n,
                partial: self.buffer.clone(),
            })
        }
    }

    /// Reads `n` bytes starting at `offset`.
    pub async fn read_at_offset(&mut self, n: usize, offset: usize) -> Result<&[u8]> {
        let end = offset.saturating_add(n);
        self.fill(Some(end)).await;
        if self.buffer.len() >= end {
            Ok(&self.buffer[offset..end])
        } else {
            Err(TransportError::BodyTooSmall {
                requested: n,
                partial: self
                    .buffer
                    .get(offset..)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default(),
            })
        }
    }

    /// Loads the whole body.
    pub async fn read_all(&mut self) -> &[u8] {
        self.fill(None).await;
        &self.buffer
    }

    /// Loads the whole body and returns everything after `offset`.
    pub async fn read_all_at_offset(&mut self, offset: usize) -> Result<&[u8]> {
        self.fill(None).await;
        if self.buffer.len() > offset {
            Ok(&self.buffer[offset..])
        } else {
            Err(TransportError::BodyTooSmall {
                requested: offset,
                partial: Vec::new(),
            })
        }
    }

    /// Replaces the body. Chunks still queued from a receive stream are
    /// discarded.
    pub async fn write(&mut self, content: impl Into<Vec<u8>>) {
        if let Some(mut relay) = self.relay.take() {
            while relay.recv().await.is_some() {}
        }
        self.buffer = content.into();
    }

    /// Appends to the body. A streaming body is fully loaded first.
    pub async fn append(&mut self, content: &[u8]) {
        self.fill(None).await;
        self.buffer.extend_from_slice(content);
    }

    /// Empties the body.
    pub async fn clear(&mut self) {
        self.write(Vec::new()).await;
    }

    /// Loads the whole body and returns it.
    pub async fn into_bytes(mut self) -> Vec<u8> {
        self.fill(None).await;
        self.buffer
    }
}

impl From<Vec<u8>> for Body {
    fn from(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            relay: None,
        }
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::from(text.as_bytes().to_vec())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::from(text.into_bytes())
    }
}

async fn relay_from_stream(stream: &dyn ChunkStream, relay: mpsc::Sender<Vec<u8>>) -> Result<()> {
    let ctx = stream.context();
    loop {
        let next = tokio::select! {
            next = stream.recv_chunk() => next?,
            _ = ctx.cancelled() => {
                warn!("stream context closed");
                return Ok(());
            }
        };
        let bytes = match next {
            None => return Ok(()),
            Some(Chunk::BodyChunk(bytes)) => bytes,
            Some(Chunk::Header(_)) => {
                return Err(TransportError::stream("header chunk inside body"));
            }
        };
        tokio::select! {
            sent = relay.send(bytes) => {
                if sent.is_err() {
                    debug!("body dropped before its stream ended");
                    return Ok(());
                }
            }
            _ = ctx.cancelled() => {
                warn!("stream context closed");
                return Ok(());
            }
        }
    }
}

async fn relay_to_stream(
    stream: &dyn ChunkStream,
    buffer: Vec<u8>,
    relay: Option<mpsc::Receiver<Vec<u8>>>,
) -> Result<()> {
    for piece in buffer.chunks(MAX_CHUNK_SIZE) {
        send_chunk(stream, piece.to_vec()).await?;
    }
    drop(buffer);

    if let Some(mut relay) = relay {
        while let Some(bytes) = relay.recv().await {
            send_chunk(stream, bytes).await?;
        }
    }

    if stream.is_initiator() {
        if let Err(e) = stream.close_send().await {
            warn!(error = %e, "could not close stream");
        }
    }
    Ok(())
}

async fn send_chunk(stream: &dyn ChunkStream, bytes: Vec<u8>) -> Result<()> {
    if stream.context().is_cancelled() {
        warn!("stream context closed");
        return Err(TransportError::RequestClosed);
    }
    stream
        .send_chunk(Chunk::BodyChunk(bytes))
        .await
        .map_err(|e| {
            warn!(error = %e, "could not send chunk");
            e
        })
}
