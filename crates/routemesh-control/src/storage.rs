//! Association of a component with its storage provider.
//!
//! Storage endpoint sets arrive either as a push on the component's own
//! `RegisterStorageEndpoints` procedure or as a `storageChanged` event. A new
//! set is only accepted once one of its endpoints answered a ping; if none
//! does, the association is cleared rather than left pointing at an
//! unverified endpoint.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use routemesh_transport::{
    ComponentCommunicator, Endpoint, EndpointPushHandler, RemoteComponent, Status,
    TcpTransportConfig,
};

use crate::error::{ControlError, Result};
use crate::events::{Event, EventHandler};

type AssociationCallback = Arc<dyn Fn(&Endpoint) + Send + Sync>;

struct Association {
    communicator: Arc<ComponentCommunicator>,
    endpoints: Vec<Endpoint>,
}

/// Currently accepted storage provider of this component.
pub struct StorageAssociation {
    dial: TcpTransportConfig,
    current: RwLock<Option<Association>>,
    callbacks: RwLock<Vec<AssociationCallback>>,
}

impl StorageAssociation {
    /// Create an empty association.
    pub fn new(dial: TcpTransportConfig) -> Self {
        Self {
            dial,
            current: RwLock::new(None),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Registers a callback run with the accepted endpoint whenever a new
    /// association is made. Callbacks run in registration order.
    pub fn on_new_association(&self, callback: impl Fn(&Endpoint) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Whether a storage provider is associated.
    pub fn ready(&self) -> bool {
        self.current.read().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Communicator of the associated provider.
    pub fn current(&self) -> Option<Arc<ComponentCommunicator>> {
        self.current
            .read()
            .ok()
            .and_then(|c| c.as_ref().map(|a| a.communicator.clone()))
    }

    /// Endpoint set the current association was made from.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.current
            .read()
            .ok()
            .and_then(|c| c.as_ref().map(|a| a.endpoints.clone()))
            .unwrap_or_default()
    }

    fn clear(&self) {
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
    }

    async fn dial_and_ping(
        &self,
        ctx: &CancellationToken,
        endpoint: &Endpoint,
    ) -> Result<ComponentCommunicator> {
        let communicator =
            ComponentCommunicator::from_endpoint(endpoint, self.dial.clone()).await?;
        communicator.ping(ctx).await?;
        Ok(communicator)
    }

    /// Pings `endpoints` in order and associates with the first that
    /// answers. Returns the accepted endpoint.
    pub async fn update(
        &self,
        ctx: &CancellationToken,
        endpoints: Vec<Endpoint>,
    ) -> Result<Endpoint> {
        let mut accepted = None;
        for endpoint in &endpoints {
            match self.dial_and_ping(ctx, endpoint).await {
                Ok(communicator) => {
                    accepted = Some(communicator);
                    break;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "storage endpoint did not answer");
                }
            }
        }

        let Some(communicator) = accepted else {
            self.clear();
            warn!(candidates = endpoints.len(), "cleared storage association");
            return Err(ControlError::NoStorageEndpoint {
                candidates: endpoints.len(),
            });
        };
        Ok(self.associate(communicator, endpoints))
    }

    /// Replaces the associated provider without pinging it. `None` clears
    /// the association.
    pub fn set_communicator(&self, communicator: Option<ComponentCommunicator>) {
        match communicator {
            Some(communicator) => {
                let endpoints = vec![communicator.endpoint().clone()];
                self.associate(communicator, endpoints);
            }
            None => {
                self.clear();
                info!("storage association cleared");
            }
        }
    }

    fn associate(&self, communicator: ComponentCommunicator, endpoints: Vec<Endpoint>) -> Endpoint {
        let endpoint = communicator.endpoint().clone();
        if let Ok(mut current) = self.current.write() {
            *current = Some(Association {
                communicator: Arc::new(communicator),
                endpoints,
            });
        }
        info!(endpoint = %endpoint, "associated with storage");

        let callbacks: Vec<AssociationCallback> = self
            .callbacks
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&endpoint);
        }
        endpoint
    }
}

#[async_trait]
impl EndpointPushHandler for StorageAssociation {
    async fn register_storage_endpoints(
        &self,
        ctx: CancellationToken,
        endpoints: Vec<Endpoint>,
    ) -> std::result::Result<(), Status> {
        if endpoints.is_empty() {
            self.clear();
            return Err(Status::invalid_argument("no storage endpoints given"));
        }
        self.update(&ctx, endpoints)
            .await
            .map(|_| ())
            .map_err(|e| Status::unavailable(e.to_string()))
    }
}

/// Feeds `storageChanged` events into a [`StorageAssociation`].
pub struct StorageChangedListener {
    association: Arc<StorageAssociation>,
}

impl StorageChangedListener {
    /// Create a listener updating `association`.
    pub fn new(association: Arc<StorageAssociation>) -> Self {
        Self { association }
    }
}

#[async_trait]
impl EventHandler for StorageChangedListener {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if let Event::StorageChanged(changed) = event {
            self.association
                .update(&CancellationToken::new(), changed.endpoints.clone())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routemesh_transport::{ComponentServer, RpcServer};
    use std::sync::Mutex;

    async fn start_component() -> (Endpoint, CancellationToken) {
        let server = RpcServer::bind("127.0.0.1:0", TcpTransportConfig::default())
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port() as u32;
        let endpoint = Endpoint::new("127.0.0.1", port);
        let shutdown = server.shutdown_token();
        tokio::spawn(server.serve(Arc::new(ComponentServer::new())));
        (endpoint, shutdown)
    }

    async fn dead_endpoint() -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port() as u32;
        drop(listener);
        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_update_accepts_first_live_endpoint() {
        let (live, shutdown) = start_component().await;
        let association = StorageAssociation::new(TcpTransportConfig::default());
        let fired = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let fired = fired.clone();
            association.on_new_association(move |endpoint| {
                fired.lock().unwrap().push(format!("{}:{}", tag, endpoint.port));
            });
        }

        let candidates = vec![dead_endpoint().await, live.clone()];
        let accepted = association
            .update(&CancellationToken::new(), candidates.clone())
            .await
            .unwrap();

        assert_eq!(accepted, live);
        assert!(association.ready());
        assert_eq!(association.current().unwrap().endpoint(), &live);
        assert_eq!(association.endpoints(), candidates);
        assert_eq!(
            *fired.lock().unwrap(),
            vec![format!("a:{}", live.port), format!("b:{}", live.port)]
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failed_ping_clears_association() {
        let (live, shutdown) = start_component().await;
        let association = StorageAssociation::new(TcpTransportConfig::default());
        association
            .update(&CancellationToken::new(), vec![live])
            .await
            .unwrap();
        assert!(association.ready());

        let result = association
            .update(&CancellationToken::new(), vec![dead_endpoint().await])
            .await;
        assert!(matches!(
            result,
            Err(ControlError::NoStorageEndpoint { candidates: 1 })
        ));
        assert!(!association.ready());
        assert!(association.current().is_none());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_set_communicator_skips_ping() {
        let (live, shutdown) = start_component().await;
        let association = StorageAssociation::new(TcpTransportConfig::default());
        let fired = Arc::new(Mutex::new(0));
        let counter = fired.clone();
        association.on_new_association(move |_| *counter.lock().unwrap() += 1);

        let communicator =
            ComponentCommunicator::from_endpoint(&live, TcpTransportConfig::default())
                .await
                .unwrap();
        association.set_communicator(Some(communicator));
        assert!(association.ready());
        assert_eq!(association.endpoints(), vec![live]);
        assert_eq!(*fired.lock().unwrap(), 1);

        association.set_communicator(None);
        assert!(!association.ready());
        assert!(association.endpoints().is_empty());
        assert_eq!(*fired.lock().unwrap(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_listener_ignores_other_events() {
        let association = Arc::new(StorageAssociation::new(TcpTransportConfig::default()));
        let listener = StorageChangedListener::new(association.clone());
        listener
            .handle(&Event::configuration_changed(crate::events::resource(
                "route", "ns", "r",
            )))
            .await
            .unwrap();
        assert!(!association.ready());
    }
}
