//! Typed calls against the associated storage provider.
//!
//! A [`StorageClient`] follows its [`StorageAssociation`]: every call goes
//! to whichever provider is associated at that moment, so a storage push or
//! `storageChanged` event redirects later calls without rebuilding the
//! client.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use routemesh_transport::protocol::{
    DeleteRouteRequest, Empty, EndpointList, GetRouteRequest, GetRouteStartRequest,
    GetRouteStepRequest, NameList, NamespaceRequest, NamespacedName, PopulatedRouteStep,
    Procedure, Route, RouteId, RouteStart, RouteStep, RouteWithId, Service, SetRouteRequest,
    SetRouteResponse, SetServiceLbEndpointsRequest, SetServiceRequest,
};
use routemesh_transport::{ComponentCommunicator, Endpoint};

use crate::error::{ControlError, Result};
use crate::storage::StorageAssociation;

/// Client for the storage provider's route and service records.
#[derive(Clone)]
pub struct StorageClient {
    association: Arc<StorageAssociation>,
}

impl StorageClient {
    /// Client calling whichever provider `association` currently holds.
    pub fn new(association: Arc<StorageAssociation>) -> Self {
        Self { association }
    }

    /// Whether a storage provider is associated.
    pub fn ready(&self) -> bool {
        self.association.ready()
    }

    /// Points the client at `communicator` without pinging it; `None`
    /// detaches it.
    pub fn update_communicator(&self, communicator: Option<ComponentCommunicator>) {
        self.association.set_communicator(communicator);
    }

    /// Association the client follows.
    pub fn association(&self) -> &Arc<StorageAssociation> {
        &self.association
    }

    #[instrument(skip(self, ctx, request))]
    async fn call<Req, Resp>(
        &self,
        ctx: &CancellationToken,
        procedure: Procedure,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let communicator = self
            .association
            .current()
            .ok_or(ControlError::StorageNotReady)?;
        let response = communicator
            .channel()
            .unary(ctx, procedure, request)
            .await
            .map_err(ControlError::StorageProvider)?;
        debug!("storage call completed");
        Ok(response)
    }

    /// Fetches a route.
    pub async fn get_route(&self, ctx: &CancellationToken, id: RouteId) -> Result<RouteWithId> {
        self.call(ctx, Procedure::GetRoute, &GetRouteRequest { id }).await
    }

    /// Creates or replaces a route and returns its uid.
    pub async fn set_route(
        &self,
        ctx: &CancellationToken,
        id: RouteId,
        route: Route,
    ) -> Result<String> {
        let request = SetRouteRequest { id, data: route };
        let response: SetRouteResponse = self.call(ctx, Procedure::SetRoute, &request).await?;
        Ok(response.uid)
    }

    /// Fetches step `step_id` of a route.
    pub async fn get_route_step(
        &self,
        ctx: &CancellationToken,
        id: RouteId,
        step_id: u32,
    ) -> Result<RouteStep> {
        self.call(ctx, Procedure::GetRouteStep, &GetRouteStepRequest { id, step_id })
            .await
    }

    /// Fetches step `step_id` of a route with the endpoints of its service.
    pub async fn get_populated_route_step(
        &self,
        ctx: &CancellationToken,
        id: RouteId,
        step_id: u32,
    ) -> Result<PopulatedRouteStep> {
        let request = GetRouteStepRequest { id, step_id };
        self.call(ctx, Procedure::GetPopulatedRouteStep, &request).await
    }

    /// Uids of the routes in `namespace`.
    pub async fn get_routes_in_namespace(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
    ) -> Result<Vec<String>> {
        let request = NamespaceRequest {
            namespace: namespace.to_string(),
        };
        let list: NameList = self
            .call(ctx, Procedure::GetRoutesInNamespace, &request)
            .await?;
        Ok(list.names)
    }

    /// Route and first step serving `host`.
    pub async fn get_route_start(
        &self,
        ctx: &CancellationToken,
        host: &str,
    ) -> Result<RouteStart> {
        let request = GetRouteStartRequest {
            host: host.to_string(),
        };
        self.call(ctx, Procedure::GetRouteStart, &request).await
    }

    /// Deletes a route.
    pub async fn delete_route(&self, ctx: &CancellationToken, id: RouteId) -> Result<()> {
        let _: Empty = self
            .call(ctx, Procedure::DeleteRoute, &DeleteRouteRequest { id })
            .await?;
        Ok(())
    }

    /// Fetches a service.
    pub async fn get_service(
        &self,
        ctx: &CancellationToken,
        name: &NamespacedName,
    ) -> Result<Service> {
        self.call(ctx, Procedure::GetService, name).await
    }

    /// Creates or replaces a service.
    pub async fn set_service(
        &self,
        ctx: &CancellationToken,
        name: NamespacedName,
        service: Service,
    ) -> Result<()> {
        let request = SetServiceRequest { name, service };
        let _: Empty = self.call(ctx, Procedure::SetService, &request).await?;
        Ok(())
    }

    /// Names of the services in `namespace`.
    pub async fn get_services_in_namespace(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
    ) -> Result<Vec<String>> {
        let request = NamespaceRequest {
            namespace: namespace.to_string(),
        };
        let list: NameList = self
            .call(ctx, Procedure::GetServicesInNamespace, &request)
            .await?;
        Ok(list.names)
    }

    /// Load balancer endpoints of a service.
    pub async fn get_service_lb_endpoints(
        &self,
        ctx: &CancellationToken,
        name: &NamespacedName,
    ) -> Result<Vec<Endpoint>> {
        let list: EndpointList = self
            .call(ctx, Procedure::GetServiceLbEndpoints, name)
            .await?;
        Ok(list.endpoints)
    }

    /// Replaces the load balancer endpoints of a service.
    pub async fn set_service_lb_endpoints(
        &self,
        ctx: &CancellationToken,
        name: NamespacedName,
        endpoints: Vec<Endpoint>,
    ) -> Result<()> {
        let request = SetServiceLbEndpointsRequest {
            service_name: name,
            endpoints,
        };
        let _: Empty = self
            .call(ctx, Procedure::SetServiceLbEndpoints, &request)
            .await?;
        Ok(())
    }

    /// Deletes a service.
    pub async fn delete_service(
        &self,
        ctx: &CancellationToken,
        name: &NamespacedName,
    ) -> Result<()> {
        let _: Empty = self.call(ctx, Procedure::DeleteService, name).await?;
        Ok(())
    }

    /// Every namespace known to the provider.
    pub async fn get_namespaces(&self, ctx: &CancellationToken) -> Result<Vec<String>> {
        let list: NameList = self.call(ctx, Procedure::GetNamespaces, &Empty).await?;
        Ok(list.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routemesh_transport::{ComponentServer, RpcServer, TcpTransportConfig, TransportError};

    #[tokio::test]
    async fn test_calls_fail_until_associated() {
        let client = StorageClient::new(Arc::new(StorageAssociation::new(
            TcpTransportConfig::default(),
        )));
        assert!(!client.ready());

        let ctx = CancellationToken::new();
        assert!(matches!(
            client.get_namespaces(&ctx).await,
            Err(ControlError::StorageNotReady)
        ));
        assert!(matches!(
            client.get_route(&ctx, RouteId::uid("r-1")).await,
            Err(ControlError::StorageNotReady)
        ));
    }

    #[tokio::test]
    async fn test_provider_errors_are_wrapped() {
        // a plain component answers pings but serves no storage procedures
        let server = RpcServer::bind("127.0.0.1:0", TcpTransportConfig::default())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port() as u32;
        let shutdown = server.shutdown_token();
        tokio::spawn(server.serve(Arc::new(ComponentServer::new())));

        let client = StorageClient::new(Arc::new(StorageAssociation::new(
            TcpTransportConfig::default(),
        )));
        let communicator = ComponentCommunicator::from_endpoint(
            &Endpoint::new("127.0.0.1", port),
            TcpTransportConfig::default(),
        )
        .await
        .unwrap();
        client.update_communicator(Some(communicator));
        assert!(client.ready());

        let result = client.get_namespaces(&CancellationToken::new()).await;
        match result {
            Err(ControlError::StorageProvider(TransportError::Remote(status))) => {
                assert_eq!(status.code, routemesh_transport::StatusCode::Unimplemented);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        client.update_communicator(None);
        assert!(!client.ready());
        shutdown.cancel();
    }
}
