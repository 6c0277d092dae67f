//! Client-side handle to one remote component.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{Empty, Endpoint, Procedure};
use crate::rpc::Channel;
use crate::tcp::TcpTransportConfig;

/// Capabilities every remote component offers.
#[async_trait]
pub trait RemoteComponent: Send + Sync {
    /// Endpoint of the remote component.
    fn endpoint(&self) -> &Endpoint;

    /// Liveness check.
    async fn ping(&self, ctx: &CancellationToken) -> Result<()>;
}

/// A usable channel to exactly one remote endpoint.
pub struct ComponentCommunicator {
    channel: Channel,
}

impl ComponentCommunicator {
    /// Dials `endpoint`. An unreachable endpoint is reported here.
    pub async fn from_endpoint(endpoint: &Endpoint, config: TcpTransportConfig) -> Result<Self> {
        Ok(Self::from_channel(Channel::dial(endpoint, config).await?))
    }

    /// Wraps an already dialed channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Underlying channel, for procedures beyond `Ping`.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl RemoteComponent for ComponentCommunicator {
    fn endpoint(&self) -> &Endpoint {
        self.channel.endpoint()
    }

    async fn ping(&self, ctx: &CancellationToken) -> Result<()> {
        self.channel
            .unary::<Empty, Empty>(ctx, Procedure::Ping, &Empty)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::rpc::RpcServer;
    use crate::server::ComponentServer;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ping_component() {
        let server = RpcServer::bind("127.0.0.1:0", TcpTransportConfig::default())
            .await
            .unwrap();
        let endpoint = Endpoint::new("127.0.0.1", server.local_addr().unwrap().port() as u32);
        let shutdown = server.shutdown_token();
        tokio::spawn(server.serve(Arc::new(ComponentServer::new())));

        let ctx = CancellationToken::new();
        let communicator =
            ComponentCommunicator::from_endpoint(&endpoint, TcpTransportConfig::default())
                .await
                .unwrap();
        assert_eq!(communicator.endpoint(), &endpoint);
        communicator.ping(&ctx).await.unwrap();
        // a second call dials a fresh connection
        communicator.ping(&ctx).await.unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dial_failure_is_local_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as u32;
        drop(listener);

        let endpoint = Endpoint::new("127.0.0.1", port);
        let result =
            ComponentCommunicator::from_endpoint(&endpoint, TcpTransportConfig::default()).await;
        assert!(matches!(result, Err(TransportError::IoError(_))));
    }
}
