//! Request handling of the `rm-component` binary.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use routemesh_transport::{Endpoint, EndpointSelector, Request, RequestHandler, Response};

use crate::config::ComponentConfig;

/// Status returned when no upstream instance produced a response.
pub const BAD_GATEWAY: i32 = 502;

/// Forwards requests to the first upstream instance that answers, in the
/// order the selector picks. Without upstreams it echoes each request.
pub struct ComponentHandler {
    selector: EndpointSelector,
    upstreams: Vec<Endpoint>,
}

impl ComponentHandler {
    /// Handler forwarding to `upstreams` through `selector`.
    pub fn new(selector: EndpointSelector, upstreams: Vec<Endpoint>) -> Self {
        Self {
            selector,
            upstreams,
        }
    }

    /// Handler built from the selection settings and upstreams of `config`.
    pub fn from_config(config: &ComponentConfig) -> Self {
        Self::new(
            EndpointSelector::new(config.selector()),
            config.upstreams.clone(),
        )
    }

    /// Upstream instances requests are forwarded to.
    pub fn upstreams(&self) -> &[Endpoint] {
        &self.upstreams
    }
}

fn echo(mut request: Request) -> Response {
    let mut response = Response::new();
    response.headers = request.headers.clone();
    response.body = std::mem::take(&mut request.body);
    response
}

#[async_trait]
impl RequestHandler for ComponentHandler {
    async fn handle(&self, ctx: CancellationToken, request: Request) -> Response {
        if self.upstreams.is_empty() {
            return echo(request);
        }

        let request_uid = request.routing.request_uid.clone();
        match self
            .selector
            .process_request(&ctx, &self.upstreams, request)
            .await
        {
            Ok(response) => {
                debug!(request_uid = %request_uid, status = response.status, "forwarded");
                response
            }
            Err(e) => {
                warn!(request_uid = %request_uid, error = %e, "no upstream answered");
                let mut response = Response::new();
                response.status = BAD_GATEWAY;
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use clap::Parser;
    use routemesh_transport::server::handler_fn;
    use routemesh_transport::{Body, ComponentServer, RpcServer, TcpTransportConfig};

    use crate::config::Cli;

    async fn start_upstream(tag: &'static str) -> (Endpoint, CancellationToken) {
        let server = RpcServer::bind("127.0.0.1:0", TcpTransportConfig::default())
            .await
            .unwrap();
        let endpoint = Endpoint::new("127.0.0.1", server.local_addr().unwrap().port() as u32);
        let shutdown = server.shutdown_token();
        let handler = handler_fn(move |_, request: Request| async move {
            let mut response = Response::new();
            response.headers.set("x-served-by", tag);
            response.headers.set("x-path", request.path);
            response.body = Body::from(tag);
            response
        });
        let component = ComponentServer::new().with_request_handler(handler);
        tokio::spawn(server.serve(Arc::new(component)));
        (endpoint, shutdown)
    }

    async fn unreachable_endpoint() -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as u32;
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_echo_without_upstreams() {
        let cli = Cli::try_parse_from(["rm-component"]).unwrap();
        let handler = ComponentHandler::from_config(&cli.component);
        assert!(handler.upstreams().is_empty());

        let mut request = Request::new();
        request.headers.set("x-trace", "t-1");
        request.body = Body::from("hello");
        let mut response = handler.handle(CancellationToken::new(), request).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-trace"), Some("t-1"));
        assert_eq!(response.body.read_all().await, b"hello");
    }

    #[tokio::test]
    async fn test_forwards_past_unreachable_upstream() {
        let (upstream, shutdown) = start_upstream("backend").await;
        let dead = unreachable_endpoint().await;

        let cli = Cli::try_parse_from([
            "rm-component".to_string(),
            "--selection".to_string(),
            "ordered".to_string(),
            "--upstream".to_string(),
            format!("{},{}", dead, upstream),
        ])
        .unwrap();
        let handler = ComponentHandler::from_config(&cli.component);
        assert_eq!(handler.upstreams(), &[dead, upstream][..]);

        let mut request = Request::new();
        request.path = "/orders".into();
        let mut response = handler.handle(CancellationToken::new(), request).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-served-by"), Some("backend"));
        assert_eq!(response.headers.get("x-path"), Some("/orders"));
        assert_eq!(response.body.read_all().await, b"backend");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_upstreams_give_bad_gateway() {
        let handler = ComponentHandler::new(
            EndpointSelector::default(),
            vec![unreachable_endpoint().await],
        );
        let response = handler
            .handle(CancellationToken::new(), Request::new())
            .await;
        assert_eq!(response.status, BAD_GATEWAY);
    }
}
