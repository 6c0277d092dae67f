//! Error types for the control subsystem.

use thiserror::Error;

use routemesh_transport::TransportError;

/// Errors that can occur while talking to the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Transport failure, including remote statuses.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Operation needs a registered component.
    #[error("component is not registered with the control plane")]
    NotRegistered,

    /// The event stream ended before its first message.
    #[error("control plane closed the event stream before confirming registration")]
    RegistrationUnconfirmed,

    /// Every registration attempt failed.
    #[error("could not register to control plane after {attempts} attempts: {last_error}")]
    RegistrationExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: Box<ControlError>,
    },

    /// Event type tag not known to this component.
    #[error("unknown event type: {tag}")]
    UnknownEventType {
        /// The received tag.
        tag: String,
    },

    /// Event payload missing or not matching its type tag.
    #[error("malformed event: {reason}")]
    MalformedEvent {
        /// What was wrong.
        reason: String,
    },

    /// None of the pushed storage endpoints answered a ping.
    #[error("no usable storage endpoint among {candidates} candidates")]
    NoStorageEndpoint {
        /// Number of endpoints pinged.
        candidates: usize,
    },

    /// No storage provider is associated yet.
    #[error("no storage provider associated")]
    StorageNotReady,

    /// The storage provider rejected or failed a call.
    #[error("error from storage provider: {0}")]
    StorageProvider(#[source] TransportError),
}

/// Result alias used throughout the control crate.
pub type Result<T> = std::result::Result<T, ControlError>;
