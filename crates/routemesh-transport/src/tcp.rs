//! TCP transport implementation

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::protocol::{FRAME_LEN_SIZE, MAX_FRAME_SIZE};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
        }
    }
}

/// TCP transport: creates connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<TcpConnection> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(TransportError::IoError)?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        tracing::debug!(addr = addr, "TCP connected");
        TcpConnection::from_stream(stream)
    }

    /// Binds to the specified address and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(TransportError::IoError)
    }

    /// Accepts an incoming TCP connection from the listener.
    pub async fn accept(&self, listener: &tokio::net::TcpListener) -> Result<TcpConnection> {
        let (stream, _) = listener.accept().await.map_err(TransportError::IoError)?;
        if self.config.nodelay {
            stream.set_nodelay(true).map_err(TransportError::IoError)?;
        }
        TcpConnection::from_stream(stream)
    }
}

/// A single TCP connection with concurrent read/write support.
///
/// Reads and writes go through separate locks, so one task can block in
/// [`TcpConnection::recv`] while another sends.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: tokio::net::TcpStream) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            peer_addr,
            local_addr,
        })
    }

    /// Serializes `message` and writes it as one length-prefixed frame.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<()> {
        let payload = bincode::serialize(message)?;
        if payload.len() > MAX_FRAME_SIZE as usize {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len() as u32,
                max_size: MAX_FRAME_SIZE,
            });
        }
        let mut frame = BytesMut::with_capacity(FRAME_LEN_SIZE + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);

        let mut write = self.write.lock().await;
        write.write_all(&frame).await.map_err(TransportError::IoError)?;
        write.flush().await.map_err(TransportError::IoError)?;
        Ok(())
    }

    /// Reads the next frame.
    ///
    /// Returns `Ok(None)` when the peer half-closed on a frame boundary.
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let mut read = self.read.lock().await;
        let mut len_buf = [0u8; FRAME_LEN_SIZE];
        let mut filled = 0;
        while filled < FRAME_LEN_SIZE {
            let n = read
                .read(&mut len_buf[filled..])
                .await
                .map_err(TransportError::IoError)?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionReset);
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: len,
                max_size: MAX_FRAME_SIZE,
            });
        }
        let mut payload = vec![0u8; len as usize];
        if !payload.is_empty() {
            read.read_exact(&mut payload).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TransportError::ConnectionReset
                } else {
                    TransportError::IoError(e)
                }
            })?;
        }
        Ok(Some(bincode::deserialize(&payload)?))
    }

    /// Half-closes the write direction. The peer observes end-of-stream.
    pub async fn shutdown_write(&self) -> Result<()> {
        let mut write = self.write.lock().await;
        write.shutdown().await.map_err(TransportError::IoError)
    }

    /// Reads and discards inbound bytes until the peer half-closes or
    /// `linger` elapses. Closing a socket with unread data resets the
    /// connection, which can destroy a reply the peer has not read yet.
    pub async fn discard_inbound(&self, linger: Duration) {
        let mut read = self.read.lock().await;
        let mut scratch = [0u8; 4096];
        let drain = async {
            loop {
                match read.read(&mut scratch).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(linger, drain).await.is_err() {
            tracing::debug!(peer = %self.peer_addr, "peer kept sending after the call ended");
        }
    }

    /// Returns the remote peer address of this TCP connection as a string.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Returns the local address of this TCP connection as a string.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }
}
