//! Control-plane client: registration, the event stream, subscriptions and
//! publishing.
//!
//! A client moves through `Unregistered → Registering → Registered → Closed`.
//! Registration opens a server-streaming call and only succeeds once the
//! control plane has sent the first stream message. From then on a
//! background task receives events and fans them out to the
//! [`HandlerRegistry`] until the stream ends or the client is closed.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use routemesh_transport::protocol::{
    Empty, ListenToEventRequest, Procedure, RegisterComponentRequest, WireEvent,
};
use routemesh_transport::{
    CallStream, Channel, Endpoint, RetryConfig, RetryExecutor, RetryOutcome, TcpTransportConfig,
};

use crate::error::{ControlError, Result};
use crate::events::{identity_from_endpoint, Event, EventHandler, EventType, HandlerRegistry};

/// Lifecycle of a control-plane client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not registered yet.
    Unregistered,
    /// Registration in flight.
    Registering,
    /// Registered, event stream running.
    Registered,
    /// Event stream ended or client closed.
    Closed,
}

/// Control-plane client configuration.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Endpoint of the control plane.
    pub endpoint: Endpoint,
    /// Registration retry policy.
    pub retry: RetryConfig,
    /// Transport settings used for dialing.
    pub dial: TcpTransportConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("localhost", 12270),
            retry: RetryConfig::default(),
            dial: TcpTransportConfig::default(),
        }
    }
}

/// Connection to the control plane on behalf of one component.
pub struct ControlPlaneClient {
    channel: Channel,
    registry: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<ClientState>>,
    identity: Mutex<Option<String>>,
    ctx: CancellationToken,
}

impl ControlPlaneClient {
    /// Dials the control plane.
    pub async fn connect(endpoint: &Endpoint, dial: TcpTransportConfig) -> Result<Self> {
        let channel = Channel::dial(endpoint, dial).await?;
        let (state, _) = watch::channel(ClientState::Unregistered);
        Ok(Self {
            channel,
            registry: Arc::new(HandlerRegistry::new()),
            state: Arc::new(state),
            identity: Mutex::new(None),
            ctx: CancellationToken::new(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Waits until the client reaches `target`.
    pub async fn wait_for_state(&self, target: ClientState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Subscriber identity, set once registered.
    pub fn identity(&self) -> Option<String> {
        self.identity.lock().ok().and_then(|id| id.clone())
    }

    /// Local handler registry.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Registers this component and starts the event loop.
    pub async fn register(&self, component_type: &str, own_endpoint: &Endpoint) -> Result<()> {
        self.state.send_replace(ClientState::Registering);
        match self.open_event_stream(component_type, own_endpoint).await {
            Ok(call) => {
                let identity = identity_from_endpoint(own_endpoint);
                if let Ok(mut slot) = self.identity.lock() {
                    *slot = Some(identity.clone());
                }
                self.state.send_replace(ClientState::Registered);
                info!(component_type, identity = %identity, "registered to control plane");

                let span = info_span!("control-plane", component_type, identity = %identity);
                let event_loop = run_event_loop(call, self.registry.clone(), self.state.clone());
                tokio::spawn(event_loop.instrument(span));
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ClientState::Unregistered);
                Err(e)
            }
        }
    }

    async fn open_event_stream(
        &self,
        component_type: &str,
        own_endpoint: &Endpoint,
    ) -> Result<CallStream> {
        let request = RegisterComponentRequest {
            r#type: component_type.to_string(),
            endpoint: own_endpoint.clone(),
        };
        let call = self
            .channel
            .server_streaming(&self.ctx, Procedure::RegisterComponent, &request)
            .await?;
        // the first message proves the stream is live; its content is not an event
        match call.recv::<WireEvent>().await? {
            Some(_) => Ok(call),
            None => Err(ControlError::RegistrationUnconfirmed),
        }
    }

    /// Subscribes `handler` to `event_type`. The handler is added locally
    /// only after the control plane confirmed the subscription.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let destination = self.identity().ok_or(ControlError::NotRegistered)?;
        let request = ListenToEventRequest {
            r#type: event_type.as_str().to_string(),
            destination,
        };
        let _: Empty = self
            .channel
            .unary(&self.ctx, Procedure::ListenToEvent, &request)
            .await?;
        self.registry.append(event_type, handler);
        debug!(event_type = %event_type, "subscribed");
        Ok(())
    }

    /// Publishes `event`. No retry.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let _: Empty = self
            .channel
            .unary(&self.ctx, Procedure::CreateEvent, &event.to_wire())
            .await?;
        Ok(())
    }

    /// Stops the event loop.
    pub fn close(&self) {
        self.ctx.cancel();
        self.state.send_replace(ClientState::Closed);
    }
}

impl Drop for ControlPlaneClient {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

async fn run_event_loop(
    call: CallStream,
    registry: Arc<HandlerRegistry>,
    state: Arc<watch::Sender<ClientState>>,
) {
    loop {
        let next = tokio::select! {
            next = call.recv::<WireEvent>() => next,
            _ = call.context().cancelled() => {
                info!("event stream cancelled");
                break;
            }
        };
        match next {
            Ok(Some(wire)) => match Event::from_wire(wire) {
                Ok(event) => {
                    registry.dispatch(&event).await;
                }
                Err(e) => warn!(error = %e, "ignoring event"),
            },
            Ok(None) => {
                info!("event stream closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "could not receive data from stream");
                break;
            }
        }
    }
    state.send_replace(ClientState::Closed);
}

/// Registers with the control plane, retrying with a fixed delay. Every
/// attempt dials a fresh connection.
pub async fn register_with_retry(
    config: &ControlPlaneConfig,
    component_type: &str,
    own_endpoint: &Endpoint,
) -> Result<ControlPlaneClient> {
    let executor = RetryExecutor::new(config.retry.clone());
    let outcome = executor
        .execute(|attempt| async move {
            debug!(attempt, control_plane = %config.endpoint, "registering");
            let client = ControlPlaneClient::connect(&config.endpoint, config.dial.clone()).await?;
            client.register(component_type, own_endpoint).await?;
            Ok::<_, ControlError>(client)
        })
        .await;

    match outcome {
        RetryOutcome::Success(client) => Ok(client),
        RetryOutcome::Exhausted {
            last_error,
            attempts,
        } => Err(ControlError::RegistrationExhausted {
            attempts,
            last_error: Box::new(last_error),
        }),
    }
}

/// Like [`register_with_retry`], but aborts the process when registration
/// is exhausted. A component that cannot register can neither be discovered
/// nor discover its collaborators.
pub async fn register_or_abort(
    config: &ControlPlaneConfig,
    component_type: &str,
    own_endpoint: &Endpoint,
) -> ControlPlaneClient {
    match register_with_retry(config, component_type, own_endpoint).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "could not register to control plane");
            crate::logging::flush();
            std::process::abort();
        }
    }
}
