//! Endpoint selection for one logical destination served by several
//! redundant instances.
//!
//! Candidates that cannot be dialed are dropped. In latency-aware mode every
//! remaining candidate is pinged and the list is ordered by round-trip time,
//! which costs one extra round trip per candidate. Dispatch then walks the
//! list in order until one candidate answers.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::communicator::{ComponentCommunicator, RemoteComponent};
use crate::envelope::{self, Request, Response};
use crate::error::{Result, TransportError};
use crate::protocol::{Endpoint, Procedure};
use crate::rpc::CallStream;
use crate::stream::ChunkStream;
use crate::tcp::TcpTransportConfig;

/// Usage metrics of one communicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Unix timestamp (seconds) of the last request.
    pub last_use_ts: i64,
    /// Round-trip time of the last ping or request.
    pub response_time: Duration,
}

impl Metrics {
    /// Round-trip time in whole milliseconds.
    pub fn response_time_ms(&self) -> u64 {
        self.response_time.as_millis() as u64
    }
}

/// Communicator that carries requests to one endpoint and tracks its
/// latency.
pub struct HttpCommunicator {
    inner: ComponentCommunicator,
    metrics: Mutex<Metrics>,
}

impl HttpCommunicator {
    /// Dials `endpoint`.
    pub async fn connect(endpoint: &Endpoint, config: TcpTransportConfig) -> Result<Self> {
        Ok(Self::new(
            ComponentCommunicator::from_endpoint(endpoint, config).await?,
        ))
    }

    /// Wraps an existing component communicator.
    pub fn new(inner: ComponentCommunicator) -> Self {
        Self {
            inner,
            metrics: Mutex::new(Metrics::default()),
        }
    }

    /// Endpoint served by this communicator.
    pub fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    /// Snapshot of the current metrics.
    pub fn metrics(&self) -> Metrics {
        self.metrics.lock().map(|m| *m).unwrap_or_default()
    }

    fn record_response_time(&self, elapsed: Duration) {
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.response_time = elapsed;
        }
    }

    fn record_use(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.last_use_ts = now;
        }
    }

    /// Pings the endpoint and records the round-trip time.
    pub async fn ping(&self, ctx: &CancellationToken) -> Result<Duration> {
        let start = Instant::now();
        let result = self.inner.ping(ctx).await;
        let elapsed = start.elapsed();
        self.record_response_time(elapsed);
        result.map(|_| elapsed)
    }

    /// Opens a request exchange without sending anything but the procedure.
    pub async fn open(&self, ctx: &CancellationToken) -> Result<Arc<CallStream>> {
        self.record_use();
        let call = self
            .inner
            .channel()
            .open(ctx, Procedure::ProcessRequest)
            .await?;
        Ok(Arc::new(call))
    }

    /// Sends `request` over an opened exchange and waits for the response
    /// header. The response body streams in lazily.
    pub async fn exchange(&self, call: Arc<CallStream>, request: Request) -> Result<Response> {
        let start = Instant::now();
        let stream: Arc<dyn ChunkStream> = call;
        envelope::send(stream.clone(), request)
            .await?
            .log_in_background();
        let (response, errors) = envelope::receive::<Response>(stream).await?;
        errors.log_in_background();
        self.record_response_time(start.elapsed());
        Ok(response)
    }

    /// Carries out one request against this endpoint.
    pub async fn process_request(
        &self,
        ctx: &CancellationToken,
        request: Request,
    ) -> Result<Response> {
        let call = self.open(ctx).await?;
        self.exchange(call, request).await
    }
}

/// How candidates are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Keep candidate order, no pings.
    OrderPreserving,
    /// Ping every candidate and order by round-trip time.
    #[default]
    LatencyAware,
}

/// Endpoint selector configuration.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Ordering of candidates.
    pub mode: SelectionMode,
    /// Dial and ping candidates concurrently instead of one after another.
    pub parallel_probes: bool,
    /// Upper bound for one latency ping.
    pub probe_timeout: Duration,
    /// Transport settings used for dialing.
    pub dial: TcpTransportConfig,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::LatencyAware,
            parallel_probes: false,
            probe_timeout: Duration::from_secs(5),
            dial: TcpTransportConfig::default(),
        }
    }
}

/// Picks among redundant endpoints of one destination.
#[derive(Debug, Clone, Default)]
pub struct EndpointSelector {
    config: SelectorConfig,
}

impl EndpointSelector {
    /// Create a selector.
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Selector configuration.
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    async fn build(
        &self,
        ctx: &CancellationToken,
        endpoint: &Endpoint,
    ) -> Option<HttpCommunicator> {
        let dialed = HttpCommunicator::connect(endpoint, self.config.dial.clone()).await;
        let communicator = match dialed {
            Ok(communicator) => communicator,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "could not create communicator");
                return None;
            }
        };
        if self.config.mode == SelectionMode::LatencyAware {
            let pinged = tokio::time::timeout(self.config.probe_timeout, communicator.ping(ctx));
            match pinged.await {
                Ok(Ok(rtt)) => {
                    let rtt_us = rtt.as_micros() as u64;
                    debug!(endpoint = %endpoint, rtt_us, "pinged endpoint");
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "endpoint did not answer ping");
                    return None;
                }
                Err(_) => {
                    warn!(endpoint = %endpoint, "endpoint ping timed out");
                    return None;
                }
            }
        }
        Some(communicator)
    }

    /// Builds a communicator per reachable candidate. In latency-aware mode
    /// the result is sorted by ascending round-trip time; ties keep candidate
    /// order.
    #[instrument(
        skip(self, ctx, endpoints),
        fields(candidates = endpoints.len(), mode = ?self.config.mode)
    )]
    pub async fn communicators(
        &self,
        ctx: &CancellationToken,
        endpoints: &[Endpoint],
    ) -> Vec<HttpCommunicator> {
        let mut communicators: Vec<HttpCommunicator> = if self.config.parallel_probes {
            let builds = endpoints.iter().map(|endpoint| self.build(ctx, endpoint));
            futures::future::join_all(builds)
                .await
                .into_iter()
                .flatten()
                .collect()
        } else {
            let mut communicators = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                if let Some(communicator) = self.build(ctx, endpoint).await {
                    communicators.push(communicator);
                }
            }
            communicators
        };

        if self.config.mode == SelectionMode::LatencyAware {
            communicators.sort_by_key(|c| c.metrics().response_time);
        }
        debug!(usable = communicators.len(), "built communicators");
        communicators
    }

    /// Best communicator among `endpoints`.
    pub async fn best(
        &self,
        ctx: &CancellationToken,
        endpoints: &[Endpoint],
    ) -> Result<HttpCommunicator> {
        self.communicators(ctx, endpoints)
            .await
            .into_iter()
            .next()
            .ok_or(TransportError::NoSuitableEndpoint)
    }

    /// Carries out `request` against the first candidate that answers.
    pub async fn process_request(
        &self,
        ctx: &CancellationToken,
        endpoints: &[Endpoint],
        request: Request,
    ) -> Result<Response> {
        let communicators = self.communicators(ctx, endpoints).await;
        dispatch(ctx, &communicators, request).await
    }
}

/// Tries `communicators` in order until one returns a response.
///
/// A fully buffered request body is replayed to every candidate. A body
/// still streaming in can be sent only once: it goes to the first candidate
/// that accepts the exchange, and that candidate's failure is returned.
#[instrument(skip_all, fields(candidates = communicators.len()))]
pub async fn dispatch(
    ctx: &CancellationToken,
    communicators: &[HttpCommunicator],
    request: Request,
) -> Result<Response> {
    let replayable = !request.body.is_receiving();
    let mut pending = Some(request);

    for communicator in communicators {
        let call = match communicator.open(ctx).await {
            Ok(call) => call,
            Err(e) => {
                warn!(endpoint = %communicator.endpoint(), error = %e, "could not open exchange");
                continue;
            }
        };
        let attempt = if replayable {
            pending.as_ref().and_then(Request::try_clone)
        } else {
            pending.take()
        };
        let Some(attempt) = attempt else {
            break;
        };

        match communicator.exchange(call, attempt).await {
            Ok(response) => return Ok(response),
            Err(e) if replayable => {
                warn!(
                    endpoint = %communicator.endpoint(),
                    error = %e,
                    "communicator could not process request"
                );
            }
            Err(e) => {
                warn!(
                    endpoint = %communicator.endpoint(),
                    error = %e,
                    "streaming request failed, body cannot be replayed"
                );
                return Err(e);
            }
        }
    }
    Err(TransportError::NoSuitableEndpoint)
}
