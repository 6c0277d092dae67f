#![warn(missing_docs)]

//! Routemesh control subsystem: control-plane registration, event fan-out,
//! storage association and storage client.

pub mod component;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod events;
pub mod logging;
pub mod storage;
pub mod storage_client;

pub use component::ComponentHandler;
pub use config::{Cli, ComponentConfig};
pub use control_plane::{
    register_or_abort, register_with_retry, ClientState, ControlPlaneClient, ControlPlaneConfig,
};
pub use error::{ControlError, Result};
pub use events::{Event, EventHandler, EventType, HandlerRegistry};
pub use storage::{StorageAssociation, StorageChangedListener};
pub use storage_client::StorageClient;
