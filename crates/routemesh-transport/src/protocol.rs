//! Wire protocol definitions shared by every routemesh component.
//!
//! Every frame on a connection is a big-endian `u32` length followed by a
//! bincode payload. A call opens with one [`Procedure`] frame from the caller;
//! the messages that follow are procedure specific. Request and response
//! bodies travel as a stream of [`Chunk`]s: exactly one header chunk, then
//! zero or more body chunks of at most [`MAX_CHUNK_SIZE`] bytes, terminated by
//! half-close.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of body bytes carried by one [`Chunk::BodyChunk`].
pub const MAX_CHUNK_SIZE: usize = 4 << 10;

/// Size of the length prefix in front of every frame.
pub const FRAME_LEN_SIZE: usize = 4;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_SIZE: u32 = 4 << 20;

/// One reachable instance of a component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u32,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u32) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Remote procedures known to routemesh components and the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Procedure {
    /// Liveness check every component implements.
    Ping,
    /// Bidirectional chunk stream carrying one request and its response.
    ProcessRequest,
    /// Push of a replacement storage endpoint set.
    RegisterStorageEndpoints,
    /// Control plane: register a component, server-streams events back.
    RegisterComponent,
    /// Control plane: publish an event.
    CreateEvent,
    /// Control plane: subscribe a component to an event type.
    ListenToEvent,
    /// Storage: fetch a route.
    GetRoute,
    /// Storage: create or replace a route, returns its uid.
    SetRoute,
    /// Storage: fetch one step of a route.
    GetRouteStep,
    /// Storage: fetch one step of a route with its service endpoints.
    GetPopulatedRouteStep,
    /// Storage: uids of the routes in a namespace.
    GetRoutesInNamespace,
    /// Storage: route and first step serving a host.
    GetRouteStart,
    /// Storage: delete a route.
    DeleteRoute,
    /// Storage: fetch a service.
    GetService,
    /// Storage: create or replace a service.
    SetService,
    /// Storage: names of the services in a namespace.
    GetServicesInNamespace,
    /// Storage: load balancer endpoints of a service.
    GetServiceLbEndpoints,
    /// Storage: replace the load balancer endpoints of a service.
    SetServiceLbEndpoints,
    /// Storage: delete a service.
    DeleteService,
    /// Storage: every known namespace.
    GetNamespaces,
}

/// Status codes carried by a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// The callee does not implement the procedure.
    Unimplemented,
    /// The caller sent a malformed message.
    InvalidArgument,
    /// The callee cannot serve the call right now.
    Unavailable,
    /// The addressed object does not exist.
    NotFound,
    /// The callee is not in a state to serve the call.
    FailedPrecondition,
    /// Unexpected failure inside the callee.
    Internal,
}

/// Terminal failure reported by the callee of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Failure category.
    pub code: StatusCode,
    /// Human readable detail.
    pub message: String,
}

impl Status {
    /// Create a status with the given code and message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `Unimplemented` status.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    /// `InvalidArgument` status.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// `Unavailable` status.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    /// `NotFound` status.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    /// `Internal` status.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Message without content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty;

/// A list of endpoints, used for storage endpoint pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointList {
    /// Endpoints in preference order.
    pub endpoints: Vec<Endpoint>,
}

/// One frame of a request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Chunk {
    /// Header frame, always first.
    Header(Header),
    /// Raw body bytes, at most [`MAX_CHUNK_SIZE`].
    BodyChunk(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// Header frame wrapper. The content is optional on the wire so that a
/// malformed exchange can be detected instead of silently defaulted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Request or response header.
    pub content: Option<HeaderContent>,
}

/// Variant carried by a [`Header`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderContent {
    /// Header of a request.
    Request(RequestHeader),
    /// Header of a response.
    Response(ResponseHeader),
}

/// Wire form of a request header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// HTTP-level data. Required.
    pub http_data: Option<HttpData>,
    /// Routing metadata. Required.
    pub routing_data: Option<RoutingData>,
    /// Free-form service-to-service key/value data.
    pub service_data: Option<HashMap<String, String>>,
}

/// HTTP-level request data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpData {
    /// Request method.
    pub method: String,
    /// Target host.
    pub host: String,
    /// Request path.
    pub path: String,
    /// Canonicalised header map.
    pub headers: HashMap<String, String>,
    /// Source address of the original client.
    pub source: String,
}

/// Routing metadata attached to a request by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingData {
    /// Route the request belongs to.
    pub route_uid: String,
    /// Step of the route being executed.
    pub step_uid: u32,
    /// Correlation id of the request.
    pub request_uid: String,
}

/// Wire form of a response header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// HTTP status code.
    pub status: i32,
    /// Canonicalised header map.
    pub headers: HashMap<String, String>,
    /// Correlation id copied from the request.
    pub request_uid: String,
}

/// Resource named by configuration and cluster events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource kind, e.g. `route` or `service`.
    pub r#type: String,
    /// Namespace of the resource.
    pub namespace: String,
    /// Name within the namespace.
    pub name: String,
}

/// Expected versus actual instance count of a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCount {
    /// Desired number of instances.
    pub expected: u32,
    /// Running number of instances.
    pub actual: u32,
}

/// Payload of an event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventData {
    /// Storage endpoints changed.
    StorageChanged {
        /// New storage endpoints.
        endpoints: Vec<Endpoint>,
    },
    /// A configuration resource changed.
    ConfigurationChanged {
        /// The changed resource.
        resource: Option<Resource>,
    },
    /// Cluster state of a resource changed.
    ClusterChanged {
        /// The resource whose deployment changed.
        resource: Option<Resource>,
        /// Service instance counts.
        service_count: Option<InstanceCount>,
        /// Load balancer instance counts.
        load_balancer_count: Option<InstanceCount>,
    },
}

/// Event as carried by the control plane: a routing tag plus payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Type tag used for routing, e.g. `storageChanged`.
    pub r#type: String,
    /// Payload matching the tag.
    pub data: Option<EventData>,
}

/// Request sent by a component to register with the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterComponentRequest {
    /// Component type, e.g. `storage` or `ingress`.
    pub r#type: String,
    /// Endpoint the component serves on.
    pub endpoint: Endpoint,
}

/// Request asking the control plane to route an event type to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenToEventRequest {
    /// Event type tag.
    pub r#type: String,
    /// Subscriber identity of the listening component.
    pub destination: String,
}

/// Name of an object inside a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    /// Namespace of the object.
    pub namespace: String,
    /// Name within the namespace.
    pub name: String,
}

impl NamespacedName {
    /// Create a namespaced name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a route is addressed in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteId {
    /// By namespace and name.
    NamespacedName(NamespacedName),
    /// By uid assigned by the storage provider.
    Uid(String),
}

impl RouteId {
    /// Address a route by namespace and name.
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        RouteId::NamespacedName(NamespacedName::new(namespace, name))
    }

    /// Address a route by uid.
    pub fn uid(uid: impl Into<String>) -> Self {
        RouteId::Uid(uid.into())
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteId::NamespacedName(name) => name.fmt(f),
            RouteId::Uid(uid) => write!(f, "uid {}", uid),
        }
    }
}

/// One step of a route: the service it calls and where each outcome leads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStep {
    /// Step id, unique within the route.
    pub id: u32,
    /// Name of the service executing the step, in the route's namespace.
    pub service: String,
    /// Follow-up step per outcome name.
    pub references: HashMap<String, u32>,
}

/// Route definition. The first step is the entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Host the route serves.
    pub host: String,
    /// Steps of the route.
    pub steps: Vec<RouteStep>,
}

/// Route together with its storage identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteWithId {
    /// Uid assigned by the storage provider.
    pub uid: String,
    /// Namespace and name of the route.
    pub name: NamespacedName,
    /// The route itself.
    pub route: Route,
}

/// Route step with the load balancer endpoints of its service resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulatedRouteStep {
    /// The step.
    pub step: RouteStep,
    /// Endpoints serving the step's service.
    pub endpoints: Vec<Endpoint>,
}

/// Entry point of the route serving a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStart {
    /// Uid of the route.
    pub uid: String,
    /// First step of the route.
    pub step: PopulatedRouteStep,
}

/// Service definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service kind, e.g. `http` or `lambda`.
    pub r#type: String,
    /// Kind specific settings.
    pub config: HashMap<String, String>,
}

/// `GetRoute` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRouteRequest {
    /// Route to fetch.
    pub id: RouteId,
}

/// `SetRoute` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRouteRequest {
    /// Route to create or replace.
    pub id: RouteId,
    /// New definition.
    pub data: Route,
}

/// `SetRoute` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRouteResponse {
    /// Uid of the stored route.
    pub uid: String,
}

/// `GetRouteStep` and `GetPopulatedRouteStep` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRouteStepRequest {
    /// Route owning the step.
    pub id: RouteId,
    /// Step to fetch.
    pub step_id: u32,
}

/// Request naming a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRequest {
    /// The namespace.
    pub namespace: String,
}

/// `GetRouteStart` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRouteStartRequest {
    /// Host of the incoming request.
    pub host: String,
}

/// `DeleteRoute` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRouteRequest {
    /// Route to delete.
    pub id: RouteId,
}

/// `SetService` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetServiceRequest {
    /// Service to create or replace.
    pub name: NamespacedName,
    /// New definition.
    pub service: Service,
}

/// `SetServiceLbEndpoints` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetServiceLbEndpointsRequest {
    /// Service the endpoints belong to.
    pub service_name: NamespacedName,
    /// Load balancer endpoints.
    pub endpoints: Vec<Endpoint>,
}

/// List of names or uids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameList {
    /// The names, sorted.
    pub names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address() {
        let endpoint = Endpoint::new("storage.local", 7000);
        assert_eq!(endpoint.address(), "storage.local:7000");
        assert_eq!(endpoint.to_string(), "storage.local:7000");
    }

    #[test]
    fn test_body_chunk_encodes_compactly() {
        let chunk = Chunk::BodyChunk(vec![7u8; MAX_CHUNK_SIZE]);
        let encoded = bincode::serialize(&chunk).unwrap();
        // variant tag + length prefix + raw bytes
        assert_eq!(encoded.len(), 4 + 8 + MAX_CHUNK_SIZE);
        let decoded: Chunk = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_reply_frame_decodes_status() {
        let reply: std::result::Result<Empty, Status> = Err(Status::unavailable("busy"));
        let encoded = bincode::serialize(&reply).unwrap();
        let decoded: std::result::Result<Empty, Status> = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, Err(Status::unavailable("busy")));
    }

    #[test]
    fn test_namespaced_name_display() {
        assert_eq!(
            NamespacedName::new("shop", "checkout").to_string(),
            "shop/checkout"
        );
        assert_eq!(RouteId::named("shop", "checkout").to_string(), "shop/checkout");
        assert_eq!(RouteId::uid("r-1").to_string(), "uid r-1");
    }

    #[test]
    fn test_missing_header_content_survives_wire() {
        let chunk = Chunk::Header(Header::default());
        let encoded = bincode::serialize(&chunk).unwrap();
        let decoded: Chunk = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, Chunk::Header(Header { content: None }));
    }
}
