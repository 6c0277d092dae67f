//! Chunk streams: the seam between body streaming and the connection substrate.
//!
//! In production a [`ChunkStream`] is a [`crate::rpc::CallStream`] over TCP.
//! [`MemoryStream::pair`] gives an in-process pair built on tokio mpsc
//! channels, useful for local wiring and for tests that need to pace either
//! side.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransportError};
use crate::protocol::Chunk;

/// Bidirectional stream of [`Chunk`]s belonging to one exchange.
#[async_trait]
pub trait ChunkStream: Send + Sync {
    /// Sends one chunk.
    async fn send_chunk(&self, chunk: Chunk) -> Result<()>;

    /// Receives the next chunk; `Ok(None)` is a clean end-of-stream.
    async fn recv_chunk(&self) -> Result<Option<Chunk>>;

    /// Half-closes the send direction.
    async fn close_send(&self) -> Result<()>;

    /// Cancellation context of the exchange.
    fn context(&self) -> &CancellationToken;

    /// Whether this side initiated the exchange. Only the initiator
    /// half-closes after its body has been sent.
    fn is_initiator(&self) -> bool;
}

/// In-process chunk stream backed by bounded mpsc channels.
pub struct MemoryStream {
    tx: Mutex<Option<mpsc::Sender<Chunk>>>,
    rx: Mutex<mpsc::Receiver<Chunk>>,
    ctx: CancellationToken,
    initiator: bool,
}

impl MemoryStream {
    /// Create a connected (initiator, acceptor) pair. Each direction buffers
    /// at most `capacity` chunks.
    pub fn pair(capacity: usize, ctx: CancellationToken) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(capacity);
        let (tx_b, rx_b) = mpsc::channel(capacity);
        let initiator = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
            ctx: ctx.clone(),
            initiator: true,
        };
        let acceptor = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
            ctx,
            initiator: false,
        };
        (initiator, acceptor)
    }
}

#[async_trait]
impl ChunkStream for MemoryStream {
    async fn send_chunk(&self, chunk: Chunk) -> Result<()> {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(chunk)
                .await
                .map_err(|_| TransportError::stream("peer dropped the stream")),
            None => Err(TransportError::stream("send direction already closed")),
        }
    }

    async fn recv_chunk(&self) -> Result<Option<Chunk>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close_send(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }

    fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }
}
