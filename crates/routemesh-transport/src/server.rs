//! Inbound RPC surface every component exposes: `Ping`, streaming
//! `ProcessRequest` and storage endpoint pushes.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::{self, Request, Response};
use crate::error::{Result, TransportError};
use crate::protocol::{Empty, Endpoint, EndpointList, Procedure, Status};
use crate::rpc::{serve_unary, CallStream, RpcService};
use crate::stream::ChunkStream;

/// Handles requests arriving through `ProcessRequest`.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produce the response for `request`. The request body may still be
    /// streaming in; moving it into the response relays it back unread.
    async fn handle(&self, ctx: CancellationToken, request: Request) -> Response;
}

/// [`RequestHandler`] backed by an async closure.
pub struct FnHandler<F>(F);

/// Wraps an async closure as a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(CancellationToken, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, request: Request) -> Response {
        (self.0)(ctx, request).await
    }
}

/// Receives replacement storage endpoint sets pushed by peers.
#[async_trait]
pub trait EndpointPushHandler: Send + Sync + 'static {
    /// Accept or reject `endpoints`.
    async fn register_storage_endpoints(
        &self,
        ctx: CancellationToken,
        endpoints: Vec<Endpoint>,
    ) -> std::result::Result<(), Status>;
}

/// Component-side [`RpcService`].
#[derive(Default)]
pub struct ComponentServer {
    request_handler: Option<Arc<dyn RequestHandler>>,
    storage_push: Option<Arc<dyn EndpointPushHandler>>,
}

impl ComponentServer {
    /// Server that only answers pings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `ProcessRequest` with `handler`.
    pub fn with_request_handler(mut self, handler: impl RequestHandler) -> Self {
        self.request_handler = Some(Arc::new(handler));
        self
    }

    /// Serve `RegisterStorageEndpoints` with `handler`.
    pub fn with_storage_push(mut self, handler: Arc<dyn EndpointPushHandler>) -> Self {
        self.storage_push = Some(handler);
        self
    }

    async fn process_request(&self, call: Arc<CallStream>) -> Result<()> {
        let Some(handler) = self.request_handler.clone() else {
            return call
                .fail(Status::unimplemented("component does not process requests"))
                .await;
        };

        let stream: Arc<dyn ChunkStream> = call.clone();
        let (request, recv_errors) = match envelope::receive::<Request>(stream.clone()).await {
            Ok(received) => received,
            Err(e @ TransportError::Conversion { .. }) => {
                warn!(peer = call.peer_addr(), error = %e, "malformed request");
                return call.fail(Status::invalid_argument(e.to_string())).await;
            }
            Err(e) => return Err(e),
        };
        recv_errors.log_in_background();

        let request_uid = request.routing.request_uid.clone();
        debug!(
            method = %request.method,
            path = %request.path,
            request_uid = %request_uid,
            "processing request"
        );
        let mut response = handler.handle(call.context().clone(), request).await;
        response.request_uid = request_uid;

        envelope::send(stream, response).await?.wait().await
    }

    async fn register_storage_endpoints(&self, call: Arc<CallStream>) -> Result<()> {
        let Some(handler) = self.storage_push.clone() else {
            return call
                .fail(Status::unimplemented("component does not accept storage endpoints"))
                .await;
        };
        let ctx = call.context().clone();
        serve_unary(&call, move |list: EndpointList| async move {
            handler
                .register_storage_endpoints(ctx, list.endpoints)
                .await
                .map(|_| Empty)
        })
        .await
    }
}

#[async_trait]
impl RpcService for ComponentServer {
    async fn call(&self, procedure: Procedure, call: Arc<CallStream>) -> Result<()> {
        match procedure {
            Procedure::Ping => {
                serve_unary(&call, |_: Empty| async { Ok::<_, Status>(Empty) }).await
            }
            Procedure::ProcessRequest => self.process_request(call).await,
            Procedure::RegisterStorageEndpoints => self.register_storage_endpoints(call).await,
            other => {
                call.fail(Status::unimplemented(format!("{:?} is not served by components", other)))
                    .await
            }
        }
    }
}
