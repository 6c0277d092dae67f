//! RPC layer providing unary, server-streaming and bidirectional calls over
//! TCP connections.
//!
//! Every call owns its own connection; there is no multiplexing. The caller
//! opens a call by sending one [`Procedure`] frame. Caller-to-callee frames are
//! plain messages, callee-to-caller frames are `Result<message, Status>`, and
//! either side ends its direction with a TCP half-close.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::protocol::{Chunk, Empty, Endpoint, Procedure, Status};
use crate::stream::ChunkStream;
use crate::tcp::{TcpConnection, TcpTransport, TcpTransportConfig};

/// How long a failed call keeps reading what the caller still sends.
const FAIL_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

/// One open call on a dedicated connection.
///
/// The call's cancellation context is a child of the context it was opened
/// with and is cancelled when the call is dropped.
pub struct CallStream {
    conn: TcpConnection,
    side: Side,
    ctx: CancellationToken,
}

impl CallStream {
    fn new(conn: TcpConnection, side: Side, ctx: CancellationToken) -> Self {
        Self { conn, side, ctx }
    }

    /// Sends one message to the other side.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        match self.side {
            Side::Caller => self.conn.send(message).await,
            Side::Callee => self.conn.send(&Ok::<&T, Status>(message)).await,
        }
    }

    /// Receives the next message; `Ok(None)` once the other side half-closed.
    ///
    /// On the caller side a status frame from the callee surfaces as
    /// [`TransportError::Remote`].
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.side {
            Side::Callee => self.conn.recv::<T>().await,
            Side::Caller => match self.conn.recv::<std::result::Result<T, Status>>().await? {
                None => Ok(None),
                Some(Ok(message)) => Ok(Some(message)),
                Some(Err(status)) => Err(TransportError::Remote(status)),
            },
        }
    }

    /// Ends the call from the callee side with a failure status.
    pub async fn fail(&self, status: Status) -> Result<()> {
        self.conn.send(&Err::<Empty, Status>(status)).await?;
        self.conn.shutdown_write().await?;
        self.conn.discard_inbound(FAIL_LINGER).await;
        Ok(())
    }

    /// Half-closes this side's send direction.
    pub async fn close_send(&self) -> Result<()> {
        self.conn.shutdown_write().await
    }

    /// Cancellation context of this call.
    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Address of the other side.
    pub fn peer_addr(&self) -> &str {
        self.conn.peer_addr()
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

#[async_trait]
impl ChunkStream for CallStream {
    async fn send_chunk(&self, chunk: Chunk) -> Result<()> {
        self.send(&chunk).await
    }

    async fn recv_chunk(&self) -> Result<Option<Chunk>> {
        self.recv::<Chunk>().await
    }

    async fn close_send(&self) -> Result<()> {
        CallStream::close_send(self).await
    }

    fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    fn is_initiator(&self) -> bool {
        self.side == Side::Caller
    }
}

/// Client side handle to one remote endpoint.
///
/// Dialing connects eagerly so that unreachable endpoints are reported at
/// construction; the dialed connection serves the first call and later calls
/// open fresh connections.
pub struct Channel {
    endpoint: Endpoint,
    transport: TcpTransport,
    idle: std::sync::Mutex<Option<TcpConnection>>,
}

impl Channel {
    /// Dials `endpoint`.
    pub async fn dial(endpoint: &Endpoint, config: TcpTransportConfig) -> Result<Self> {
        let transport = TcpTransport::new(config);
        let conn = transport.connect(&endpoint.address()).await?;
        Ok(Self {
            endpoint: endpoint.clone(),
            transport,
            idle: std::sync::Mutex::new(Some(conn)),
        })
    }

    /// Endpoint this channel talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connection(&self) -> Result<TcpConnection> {
        let idle = self.idle.lock().ok().and_then(|mut idle| idle.take());
        match idle {
            Some(conn) => Ok(conn),
            None => self.transport.connect(&self.endpoint.address()).await,
        }
    }

    /// Opens a call for `procedure` without sending any message yet.
    pub async fn open(&self, ctx: &CancellationToken, procedure: Procedure) -> Result<CallStream> {
        let conn = self.connection().await?;
        conn.send(&procedure).await?;
        Ok(CallStream::new(conn, Side::Caller, ctx.child_token()))
    }

    /// Request/reply call.
    pub async fn unary<Req, Resp>(
        &self,
        ctx: &CancellationToken,
        procedure: Procedure,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let exchange = async {
            let call = self.open(ctx, procedure).await?;
            call.send(request).await?;
            call.close_send().await?;
            call.recv::<Resp>()
                .await?
                .ok_or_else(|| TransportError::stream("call ended without a reply"))
        };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(TransportError::RequestClosed),
            result = exchange => result,
        }
    }

    /// Sends one request and returns the call for reading the reply stream.
    pub async fn server_streaming<Req>(
        &self,
        ctx: &CancellationToken,
        procedure: Procedure,
        request: &Req,
    ) -> Result<CallStream>
    where
        Req: Serialize + Sync,
    {
        let call = self.open(ctx, procedure).await?;
        call.send(request).await?;
        call.close_send().await?;
        Ok(call)
    }
}

/// Trait for serving incoming calls.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Serve one call. Returning an error ends the call with an `Internal`
    /// status.
    async fn call(&self, procedure: Procedure, call: Arc<CallStream>) -> Result<()>;
}

/// Serves a request/reply call: reads one request, replies with the
/// handler's message or ends the call with its status.
pub async fn serve_unary<Req, Resp, F, Fut>(call: &CallStream, handler: F) -> Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = std::result::Result<Resp, Status>>,
{
    let request = match call.recv::<Req>().await? {
        Some(request) => request,
        None => return call.fail(Status::invalid_argument("missing request message")).await,
    };
    match handler(request).await {
        Ok(response) => call.send(&response).await,
        Err(status) => call.fail(status).await,
    }
}

/// RPC server that dispatches calls to an [`RpcService`].
pub struct RpcServer {
    transport: TcpTransport,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Binds a listener on `addr`.
    pub async fn bind(addr: &str, config: TcpTransportConfig) -> Result<Self> {
        let transport = TcpTransport::new(config);
        let listener = transport.listen(addr).await?;
        Ok(Self {
            transport,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::IoError)
    }

    /// Token that stops the accept loop and cancels in-flight calls.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the accept loop. Spawns a task per connection.
    pub async fn serve(self, service: Arc<dyn RpcService>) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "serving");
        loop {
            let accepted = tokio::select! {
                accepted = self.transport.accept(&self.listener) => accepted,
                _ = self.shutdown.cancelled() => {
                    info!("rpc server shut down");
                    return Ok(());
                }
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            debug!(peer = conn.peer_addr(), "accepted connection");
            tokio::spawn(handle_connection(
                conn,
                service.clone(),
                self.shutdown.child_token(),
            ));
        }
    }
}

async fn handle_connection(
    conn: TcpConnection,
    service: Arc<dyn RpcService>,
    ctx: CancellationToken,
) {
    let procedure = match conn.recv::<Procedure>().await {
        Ok(Some(procedure)) => procedure,
        Ok(None) => {
            debug!(peer = conn.peer_addr(), "connection closed before a call was opened");
            return;
        }
        Err(e) => {
            debug!(peer = conn.peer_addr(), error = %e, "could not read procedure");
            return;
        }
    };

    let call = Arc::new(CallStream::new(conn, Side::Callee, ctx));
    match service.call(procedure, call.clone()).await {
        Ok(()) => {
            if let Err(e) = call.close_send().await {
                debug!(?procedure, error = %e, "could not close call");
            }
        }
        Err(e) => {
            warn!(?procedure, error = %e, "call failed");
            if let Err(e) = call.fail(Status::internal(e.to_string())).await {
                debug!(?procedure, error = %e, "could not report failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EndpointList, StatusCode};

    struct EchoService;

    #[async_trait]
    impl RpcService for EchoService {
        async fn call(&self, procedure: Procedure, call: Arc<CallStream>) -> Result<()> {
            match procedure {
                Procedure::Ping => serve_unary(&call, |_: Empty| async { Ok(Empty) }).await,
                Procedure::RegisterStorageEndpoints => {
                    serve_unary(&call, |list: EndpointList| async move {
                        if list.endpoints.is_empty() {
                            Err(Status::invalid_argument("empty endpoint list"))
                        } else {
                            Ok(list)
                        }
                    })
                    .await
                }
                other => call.fail(Status::unimplemented(format!("{:?}", other))).await,
            }
        }
    }

    async fn start_server() -> (Endpoint, CancellationToken) {
        let server = RpcServer::bind("127.0.0.1:0", TcpTransportConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        tokio::spawn(server.serve(Arc::new(EchoService)));
        (Endpoint::new("127.0.0.1", addr.port() as u32), shutdown)
    }

    #[tokio::test]
    async fn test_unary_roundtrip() {
        let (endpoint, shutdown) = start_server().await;
        let ctx = CancellationToken::new();
        let channel = Channel::dial(&endpoint, TcpTransportConfig::default())
            .await
            .unwrap();

        let _: Empty = channel.unary(&ctx, Procedure::Ping, &Empty).await.unwrap();

        let list = EndpointList {
            endpoints: vec![Endpoint::new("a", 1), Endpoint::new("b", 2)],
        };
        let echoed: EndpointList = channel
            .unary(&ctx, Procedure::RegisterStorageEndpoints, &list)
            .await
            .unwrap();
        assert_eq!(echoed, list);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_remote_status_surfaces() {
        let (endpoint, shutdown) = start_server().await;
        let ctx = CancellationToken::new();
        let channel = Channel::dial(&endpoint, TcpTransportConfig::default())
            .await
            .unwrap();

        let result: Result<EndpointList> = channel
            .unary(
                &ctx,
                Procedure::RegisterStorageEndpoints,
                &EndpointList::default(),
            )
            .await;
        match result {
            Err(TransportError::Remote(status)) => {
                assert_eq!(status.code, StatusCode::InvalidArgument)
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        let result: Result<Empty> = channel.unary(&ctx, Procedure::CreateEvent, &Empty).await;
        assert!(matches!(
            result,
            Err(TransportError::Remote(Status {
                code: StatusCode::Unimplemented,
                ..
            }))
        ));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dial_unreachable_endpoint_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::new("127.0.0.1", port as u32);
        assert!(Channel::dial(&endpoint, TcpTransportConfig::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts_unary() {
        let (endpoint, shutdown) = start_server().await;
        let channel = Channel::dial(&endpoint, TcpTransportConfig::default())
            .await
            .unwrap();
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result: Result<Empty> = channel.unary(&ctx, Procedure::Ping, &Empty).await;
        assert!(matches!(result, Err(TransportError::RequestClosed)));

        shutdown.cancel();
    }
}
