//! Control-plane events and the per-type handler registry.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use routemesh_transport::protocol::{EventData, InstanceCount, Resource, WireEvent};
use routemesh_transport::Endpoint;

use crate::error::{ControlError, Result};

/// Type tag used to route events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Storage endpoints changed.
    StorageChanged,
    /// A configuration resource changed.
    ConfigurationChanged,
    /// Cluster state of a resource changed.
    ClusterChanged,
}

impl EventType {
    /// Every event type.
    pub const ALL: [EventType; 3] = [
        EventType::StorageChanged,
        EventType::ConfigurationChanged,
        EventType::ClusterChanged,
    ];

    /// Wire tag of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StorageChanged => "storageChanged",
            EventType::ConfigurationChanged => "configurationChanged",
            EventType::ClusterChanged => "clusterChanged",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ControlError;

    fn from_str(tag: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == tag)
            .ok_or_else(|| ControlError::UnknownEventType {
                tag: tag.to_string(),
            })
    }
}

/// Storage endpoints changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChanged {
    /// New storage endpoints.
    pub endpoints: Vec<Endpoint>,
}

/// A configuration resource changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationChanged {
    /// The changed resource.
    pub resource: Option<Resource>,
}

/// Cluster state of a resource changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterChanged {
    /// The resource whose deployment changed.
    pub resource: Option<Resource>,
    /// Service instance counts.
    pub service_count: Option<InstanceCount>,
    /// Load balancer instance counts.
    pub load_balancer_count: Option<InstanceCount>,
}

/// Builds a [`Resource`].
pub fn resource(kind: &str, namespace: &str, name: &str) -> Resource {
    Resource {
        r#type: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Builds an [`InstanceCount`].
pub fn instance_count(expected: u32, actual: u32) -> InstanceCount {
    InstanceCount { expected, actual }
}

/// Notification pushed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// See [`StorageChanged`].
    StorageChanged(StorageChanged),
    /// See [`ConfigurationChanged`].
    ConfigurationChanged(ConfigurationChanged),
    /// See [`ClusterChanged`].
    ClusterChanged(ClusterChanged),
}

impl Event {
    /// Storage endpoints changed.
    pub fn storage_changed(endpoints: Vec<Endpoint>) -> Self {
        Event::StorageChanged(StorageChanged { endpoints })
    }

    /// A configuration resource changed.
    pub fn configuration_changed(resource: Resource) -> Self {
        Event::ConfigurationChanged(ConfigurationChanged {
            resource: Some(resource),
        })
    }

    /// Cluster state of a resource changed.
    pub fn cluster_changed(
        resource: Resource,
        service_count: InstanceCount,
        load_balancer_count: InstanceCount,
    ) -> Self {
        Event::ClusterChanged(ClusterChanged {
            resource: Some(resource),
            service_count: Some(service_count),
            load_balancer_count: Some(load_balancer_count),
        })
    }

    /// Type tag of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::StorageChanged(_) => EventType::StorageChanged,
            Event::ConfigurationChanged(_) => EventType::ConfigurationChanged,
            Event::ClusterChanged(_) => EventType::ClusterChanged,
        }
    }

    /// Wire form: type tag plus payload.
    pub fn to_wire(&self) -> WireEvent {
        let data = match self {
            Event::StorageChanged(e) => EventData::StorageChanged {
                endpoints: e.endpoints.clone(),
            },
            Event::ConfigurationChanged(e) => EventData::ConfigurationChanged {
                resource: e.resource.clone(),
            },
            Event::ClusterChanged(e) => EventData::ClusterChanged {
                resource: e.resource.clone(),
                service_count: e.service_count,
                load_balancer_count: e.load_balancer_count,
            },
        };
        WireEvent {
            r#type: self.event_type().as_str().to_string(),
            data: Some(data),
        }
    }

    /// Parses a wire event. The payload must match the type tag.
    pub fn from_wire(wire: WireEvent) -> Result<Self> {
        let event_type: EventType = wire.r#type.parse()?;
        let data = wire.data.ok_or_else(|| ControlError::MalformedEvent {
            reason: format!("{} event without payload", event_type),
        })?;
        let event = match data {
            EventData::StorageChanged { endpoints } => {
                Event::StorageChanged(StorageChanged { endpoints })
            }
            EventData::ConfigurationChanged { resource } => {
                Event::ConfigurationChanged(ConfigurationChanged { resource })
            }
            EventData::ClusterChanged {
                resource,
                service_count,
                load_balancer_count,
            } => Event::ClusterChanged(ClusterChanged {
                resource,
                service_count,
                load_balancer_count,
            }),
        };
        if event.event_type() != event_type {
            return Err(ControlError::MalformedEvent {
                reason: format!(
                    "tag {} carries a {} payload",
                    event_type,
                    event.event_type()
                ),
            });
        }
        Ok(event)
    }
}

impl From<StorageChanged> for Event {
    fn from(e: StorageChanged) -> Self {
        Event::StorageChanged(e)
    }
}

impl From<ConfigurationChanged> for Event {
    fn from(e: ConfigurationChanged) -> Self {
        Event::ConfigurationChanged(e)
    }
}

impl From<ClusterChanged> for Event {
    fn from(e: ClusterChanged) -> Self {
        Event::ClusterChanged(e)
    }
}

/// Subscriber identity of a component: `host:port` of its own endpoint.
pub fn identity_from_endpoint(endpoint: &Endpoint) -> String {
    format!("{}:{}", endpoint.host, endpoint.port)
}

/// Callback invoked for events of the type it was subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event. A failure is logged and does not stop the other
    /// handlers of the same event.
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// [`EventHandler`] backed by a synchronous closure.
pub struct FnEventHandler<F>(F);

/// Wraps a closure as an [`EventHandler`].
pub fn handler_fn<F>(f: F) -> Arc<FnEventHandler<F>>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnEventHandler(f))
}

#[async_trait]
impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Ordered handler lists per event type. Append-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the list of `event_type`.
    pub fn append(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.entry(event_type).or_default().push(handler);
        }
    }

    /// Number of handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .map(|h| h.get(&event_type).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Runs every handler of the event's type in registration order.
    /// Returns the number of handlers that failed.
    pub async fn dispatch(&self, event: &Event) -> usize {
        let event_type = event.event_type();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .map(|h| h.get(&event_type).cloned().unwrap_or_default())
            .unwrap_or_default();

        debug!(event_type = %event_type, handlers = handlers.len(), "dispatching event");
        let mut failed = 0;
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(e) = handler.handle(event).await {
                warn!(
                    event_type = %event_type,
                    handler = index,
                    error = %e,
                    "event handler failed"
                );
                failed += 1;
            }
        }
        failed
    }
}
