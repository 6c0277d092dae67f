//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use routemesh_control::ControlPlaneConfig;
use routemesh_transport::protocol::{
    DeleteRouteRequest, Empty, EndpointList, GetRouteRequest, GetRouteStartRequest,
    GetRouteStepRequest, ListenToEventRequest, NameList, NamespaceRequest, NamespacedName,
    PopulatedRouteStep, Procedure, RegisterComponentRequest, RouteId, RouteStart, RouteStep,
    RouteWithId, Service, SetRouteRequest, SetRouteResponse, SetServiceLbEndpointsRequest,
    SetServiceRequest, Status, WireEvent,
};
use routemesh_transport::rpc::serve_unary;
use routemesh_transport::{
    CallStream, ComponentServer, Endpoint, RetryConfig, RpcServer, RpcService, TcpTransportConfig,
};

/// In-process control plane that records what components ask of it.
pub struct MockControlPlane {
    failures_left: AtomicU32,
    registration_attempts: AtomicU32,
    registered: Mutex<Vec<RegisterComponentRequest>>,
    listens: Mutex<Vec<ListenToEventRequest>>,
    created: Mutex<Vec<WireEvent>>,
    events: broadcast::Sender<WireEvent>,
}

impl MockControlPlane {
    /// Plane that rejects the first `failures` registrations.
    pub fn failing(failures: u32) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            registration_attempts: AtomicU32::new(0),
            registered: Mutex::new(Vec::new()),
            listens: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::failing(0)
    }

    /// Pushes `event` to every registered component.
    pub fn push(&self, event: WireEvent) {
        let _ = self.events.send(event);
    }

    pub fn registration_attempts(&self) -> u32 {
        self.registration_attempts.load(Ordering::SeqCst)
    }

    pub fn registered(&self) -> Vec<RegisterComponentRequest> {
        self.registered.lock().unwrap().clone()
    }

    pub fn listens(&self) -> Vec<ListenToEventRequest> {
        self.listens.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<WireEvent> {
        self.created.lock().unwrap().clone()
    }

    async fn serve_registration(&self, call: Arc<CallStream>) -> routemesh_transport::Result<()> {
        self.registration_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return call.fail(Status::unavailable("control plane warming up")).await;
        }

        let Some(request) = call.recv::<RegisterComponentRequest>().await? else {
            return call.fail(Status::invalid_argument("missing request")).await;
        };
        self.registered.lock().unwrap().push(request);

        let mut events = self.events.subscribe();
        call.send(&WireEvent::default()).await?;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => call.send(&event).await?,
                    Err(_) => return Ok(()),
                },
                _ = call.context().cancelled() => return Ok(()),
            }
        }
    }
}

/// Wrapper so the plane can be shared with the test body.
pub struct PlaneService(pub Arc<MockControlPlane>);

#[async_trait]
impl RpcService for PlaneService {
    async fn call(
        &self,
        procedure: Procedure,
        call: Arc<CallStream>,
    ) -> routemesh_transport::Result<()> {
        let plane = &self.0;
        match procedure {
            Procedure::RegisterComponent => plane.serve_registration(call).await,
            Procedure::ListenToEvent => {
                serve_unary(&call, |request: ListenToEventRequest| async move {
                    plane.listens.lock().unwrap().push(request);
                    Ok::<_, Status>(Empty)
                })
                .await
            }
            Procedure::CreateEvent => {
                serve_unary(&call, |event: WireEvent| async move {
                    plane.created.lock().unwrap().push(event);
                    Ok::<_, Status>(Empty)
                })
                .await
            }
            Procedure::Ping => {
                serve_unary(&call, |_: Empty| async { Ok::<_, Status>(Empty) }).await
            }
            other => call.fail(Status::unimplemented(format!("{:?}", other))).await,
        }
    }
}

#[derive(Default)]
struct StorageState {
    next_uid: u32,
    routes: BTreeMap<String, RouteWithId>,
    services: HashMap<NamespacedName, Service>,
    lb_endpoints: HashMap<NamespacedName, Vec<Endpoint>>,
}

impl StorageState {
    fn find_uid(&self, id: &RouteId) -> Option<String> {
        match id {
            RouteId::Uid(uid) => self.routes.contains_key(uid).then(|| uid.clone()),
            RouteId::NamespacedName(name) => self
                .routes
                .values()
                .find(|r| &r.name == name)
                .map(|r| r.uid.clone()),
        }
    }

    fn route(&self, id: &RouteId) -> Result<&RouteWithId, Status> {
        self.find_uid(id)
            .and_then(|uid| self.routes.get(&uid))
            .ok_or_else(|| Status::not_found(format!("route {}", id)))
    }

    fn step(&self, id: &RouteId, step_id: u32) -> Result<(NamespacedName, RouteStep), Status> {
        let route = self.route(id)?;
        route
            .route
            .steps
            .iter()
            .find(|s| s.id == step_id)
            .map(|s| (route.name.clone(), s.clone()))
            .ok_or_else(|| Status::not_found(format!("step {} of route {}", step_id, id)))
    }

    fn populate(&self, namespace: &str, step: RouteStep) -> PopulatedRouteStep {
        let service = NamespacedName::new(namespace, step.service.clone());
        PopulatedRouteStep {
            endpoints: self.lb_endpoints.get(&service).cloned().unwrap_or_default(),
            step,
        }
    }

    fn set_route(&mut self, request: SetRouteRequest) -> Result<SetRouteResponse, Status> {
        let (uid, name) = match (&request.id, self.find_uid(&request.id)) {
            (_, Some(uid)) => {
                let name = self.routes[&uid].name.clone();
                (uid, name)
            }
            (RouteId::NamespacedName(name), None) => {
                self.next_uid += 1;
                (format!("route-{}", self.next_uid), name.clone())
            }
            (RouteId::Uid(uid), None) => {
                return Err(Status::not_found(format!("route uid {}", uid)));
            }
        };
        self.routes.insert(
            uid.clone(),
            RouteWithId {
                uid: uid.clone(),
                name,
                route: request.data,
            },
        );
        Ok(SetRouteResponse { uid })
    }

    fn route_start(&self, host: &str) -> Result<RouteStart, Status> {
        let route = self
            .routes
            .values()
            .find(|r| r.route.host == host)
            .ok_or_else(|| Status::not_found(format!("no route for host {}", host)))?;
        let first = route
            .route
            .steps
            .first()
            .cloned()
            .ok_or_else(|| Status::not_found(format!("route {} has no steps", route.uid)))?;
        Ok(RouteStart {
            uid: route.uid.clone(),
            step: self.populate(&route.name.namespace, first),
        })
    }

    fn namespaces(&self) -> NameList {
        let names: BTreeSet<String> = self
            .routes
            .values()
            .map(|r| r.name.namespace.clone())
            .chain(self.services.keys().map(|n| n.namespace.clone()))
            .collect();
        NameList {
            names: names.into_iter().collect(),
        }
    }
}

/// In-memory storage provider.
#[derive(Default)]
pub struct MockStorage {
    state: Mutex<StorageState>,
}

impl MockStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut StorageState) -> Result<T, Status>,
    ) -> Result<T, Status> {
        f(&mut *self.state.lock().unwrap())
    }
}

/// Wrapper serving a [`MockStorage`].
pub struct StorageService(pub Arc<MockStorage>);

#[async_trait]
impl RpcService for StorageService {
    async fn call(
        &self,
        procedure: Procedure,
        call: Arc<CallStream>,
    ) -> routemesh_transport::Result<()> {
        let storage = &self.0;
        match procedure {
            Procedure::Ping => {
                serve_unary(&call, |_: Empty| async { Ok::<_, Status>(Empty) }).await
            }
            Procedure::GetRoute => {
                serve_unary(&call, |r: GetRouteRequest| async move {
                    storage.with_state(|s| s.route(&r.id).cloned())
                })
                .await
            }
            Procedure::SetRoute => {
                serve_unary(&call, |r: SetRouteRequest| async move {
                    storage.with_state(|s| s.set_route(r))
                })
                .await
            }
            Procedure::GetRouteStep => {
                serve_unary(&call, |r: GetRouteStepRequest| async move {
                    storage.with_state(|s| s.step(&r.id, r.step_id).map(|(_, step)| step))
                })
                .await
            }
            Procedure::GetPopulatedRouteStep => {
                serve_unary(&call, |r: GetRouteStepRequest| async move {
                    storage.with_state(|s| {
                        let (name, step) = s.step(&r.id, r.step_id)?;
                        Ok(s.populate(&name.namespace, step))
                    })
                })
                .await
            }
            Procedure::GetRoutesInNamespace => {
                serve_unary(&call, |r: NamespaceRequest| async move {
                    storage.with_state(|s| {
                        let names = s
                            .routes
                            .values()
                            .filter(|route| route.name.namespace == r.namespace)
                            .map(|route| route.uid.clone())
                            .collect();
                        Ok(NameList { names })
                    })
                })
                .await
            }
            Procedure::GetRouteStart => {
                serve_unary(&call, |r: GetRouteStartRequest| async move {
                    storage.with_state(|s| s.route_start(&r.host))
                })
                .await
            }
            Procedure::DeleteRoute => {
                serve_unary(&call, |r: DeleteRouteRequest| async move {
                    storage.with_state(|s| {
                        let uid = s
                            .find_uid(&r.id)
                            .ok_or_else(|| Status::not_found(format!("route {}", r.id)))?;
                        s.routes.remove(&uid);
                        Ok(Empty)
                    })
                })
                .await
            }
            Procedure::GetService => {
                serve_unary(&call, |name: NamespacedName| async move {
                    storage.with_state(|s| {
                        s.services
                            .get(&name)
                            .cloned()
                            .ok_or_else(|| Status::not_found(format!("service {}", name)))
                    })
                })
                .await
            }
            Procedure::SetService => {
                serve_unary(&call, |r: SetServiceRequest| async move {
                    storage.with_state(|s| {
                        s.services.insert(r.name, r.service);
                        Ok(Empty)
                    })
                })
                .await
            }
            Procedure::GetServicesInNamespace => {
                serve_unary(&call, |r: NamespaceRequest| async move {
                    storage.with_state(|s| {
                        let mut names: Vec<String> = s
                            .services
                            .keys()
                            .filter(|n| n.namespace == r.namespace)
                            .map(|n| n.name.clone())
                            .collect();
                        names.sort();
                        Ok(NameList { names })
                    })
                })
                .await
            }
            Procedure::GetServiceLbEndpoints => {
                serve_unary(&call, |name: NamespacedName| async move {
                    storage.with_state(|s| {
                        Ok(EndpointList {
                            endpoints: s.lb_endpoints.get(&name).cloned().unwrap_or_default(),
                        })
                    })
                })
                .await
            }
            Procedure::SetServiceLbEndpoints => {
                serve_unary(&call, |r: SetServiceLbEndpointsRequest| async move {
                    storage.with_state(|s| {
                        s.lb_endpoints.insert(r.service_name, r.endpoints);
                        Ok(Empty)
                    })
                })
                .await
            }
            Procedure::DeleteService => {
                serve_unary(&call, |name: NamespacedName| async move {
                    storage.with_state(|s| {
                        s.lb_endpoints.remove(&name);
                        s.services
                            .remove(&name)
                            .map(|_| Empty)
                            .ok_or_else(|| Status::not_found(format!("service {}", name)))
                    })
                })
                .await
            }
            Procedure::GetNamespaces => {
                serve_unary(&call, |_: Empty| async move {
                    storage.with_state(|s| Ok(s.namespaces()))
                })
                .await
            }
            other => call.fail(Status::unimplemented(format!("{:?}", other))).await,
        }
    }
}

pub async fn start_storage(storage: Arc<MockStorage>) -> (Endpoint, CancellationToken) {
    serve(Arc::new(StorageService(storage))).await
}

/// Serves `service` on a loopback port.
pub async fn serve(service: Arc<dyn RpcService>) -> (Endpoint, CancellationToken) {
    let server = RpcServer::bind("127.0.0.1:0", TcpTransportConfig::default())
        .await
        .unwrap();
    let endpoint = Endpoint::new("127.0.0.1", server.local_addr().unwrap().port() as u32);
    let shutdown = server.shutdown_token();
    tokio::spawn(server.serve(service));
    (endpoint, shutdown)
}

pub async fn start_plane(plane: Arc<MockControlPlane>) -> (Endpoint, CancellationToken) {
    serve(Arc::new(PlaneService(plane))).await
}

/// A component that only answers pings.
pub async fn start_component() -> (Endpoint, CancellationToken) {
    serve(Arc::new(ComponentServer::new())).await
}

/// An endpoint nothing listens on.
pub async fn dead_endpoint() -> Endpoint {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port() as u32;
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

/// Client configuration with a short retry delay.
pub fn plane_config(endpoint: Endpoint) -> ControlPlaneConfig {
    ControlPlaneConfig {
        endpoint,
        retry: RetryConfig {
            max_retries: 5,
            delay: Duration::from_millis(20),
        },
        dial: TcpTransportConfig::default(),
    }
}
