#![warn(missing_docs)]

//! Routemesh transport subsystem: framed TCP RPC, lazily streamed bodies, endpoint selection

pub mod body;
pub mod communicator;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod rpc;
pub mod selector;
pub mod server;
pub mod stream;
pub mod tcp;

pub use body::{Body, StreamErrors, RELAY_CAPACITY};
pub use communicator::{ComponentCommunicator, RemoteComponent};
pub use envelope::{Envelope, Headers, Request, Response};
pub use error::{Result, TransportError};
pub use protocol::{
    Chunk, Endpoint, EndpointList, NamespacedName, Procedure, Status, StatusCode, MAX_CHUNK_SIZE,
};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use rpc::{CallStream, Channel, RpcServer, RpcService};
pub use selector::{EndpointSelector, HttpCommunicator, Metrics, SelectionMode, SelectorConfig};
pub use server::{handler_fn, ComponentServer, EndpointPushHandler, RequestHandler};
pub use stream::{ChunkStream, MemoryStream};
pub use tcp::{TcpConnection, TcpTransport, TcpTransportConfig};
