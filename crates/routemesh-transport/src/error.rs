//! Error types for the routemesh transport layer.

use thiserror::Error;

use crate::protocol::Status;

/// Errors produced by the transport, body streaming and endpoint selection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing an endpoint did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was dialed.
        addr: String,
        /// Configured dial timeout.
        timeout_ms: u64,
    },

    /// The peer went away in the middle of a frame.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A frame exceeded the maximum frame size.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced frame size.
        size: u32,
        /// Maximum accepted frame size.
        max_size: u32,
    },

    /// The first frame of an exchange did not carry a usable header.
    #[error("error during conversion: {reason}")]
    Conversion {
        /// What was missing or malformed.
        reason: String,
    },

    /// Transport send/receive failure that is not a clean end-of-stream.
    #[error("error during stream: {reason}")]
    Stream {
        /// Description of the fault.
        reason: String,
    },

    /// The stream's cancellation context fired.
    #[error("request context was closed")]
    RequestClosed,

    /// The body ended before the requested number of bytes arrived.
    #[error("body does not contain {requested} bytes (only {} available)", partial.len())]
    BodyTooSmall {
        /// Number of bytes the reader asked for.
        requested: usize,
        /// Bytes that were actually available.
        partial: Vec<u8>,
    },

    /// A body already has an active receiver task.
    #[error("body is already connected to a receiving stream")]
    AlreadyReceiving,

    /// Every candidate endpoint failed to dial or respond.
    #[error("no suitable endpoint found")]
    NoSuitableEndpoint,

    /// The remote side terminated the call with a status.
    #[error("remote call failed: {0}")]
    Remote(Status),

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// Shorthand for a [`TransportError::Stream`] error.
    pub fn stream(reason: impl Into<String>) -> Self {
        TransportError::Stream {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`TransportError::Conversion`] error.
    pub fn conversion(reason: impl Into<String>) -> Self {
        TransportError::Conversion {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
