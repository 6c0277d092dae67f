//! Component startup configuration.
//!
//! Every value is resolved once at startup from, in order, the command line,
//! the environment, and a default.

use std::time::Duration;

use clap::{Args, Parser, ValueEnum};

use routemesh_transport::{Endpoint, RetryConfig, SelectionMode, SelectorConfig, TcpTransportConfig};

use crate::control_plane::ControlPlaneConfig;

/// Endpoint selection mode as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SelectionArg {
    /// Keep candidate order.
    Ordered,
    /// Order candidates by measured round-trip time.
    Latency,
}

impl From<SelectionArg> for SelectionMode {
    fn from(arg: SelectionArg) -> Self {
        match arg {
            SelectionArg::Ordered => SelectionMode::OrderPreserving,
            SelectionArg::Latency => SelectionMode::LatencyAware,
        }
    }
}

/// Settings shared by every routemesh component.
#[derive(Debug, Clone, Args)]
pub struct ComponentConfig {
    /// Component type announced to the control plane.
    #[arg(long, env = "RM_COMPONENT_TYPE", default_value = "component")]
    pub component_type: String,

    /// Host other components reach this component on.
    #[arg(long, env = "RM_HOST", default_value = "localhost")]
    pub host: String,

    /// Port the component serves on.
    #[arg(long, env = "RM_PORT", default_value_t = 12271)]
    pub port: u32,

    /// Control plane host.
    #[arg(long, env = "RM_CONTROL_PLANE_HOST", default_value = "localhost")]
    pub control_plane_host: String,

    /// Control plane port.
    #[arg(long, env = "RM_CONTROL_PLANE_PORT", default_value_t = 12270)]
    pub control_plane_port: u32,

    /// Registration retries after the first attempt.
    #[arg(long, env = "RM_REGISTRATION_RETRIES", default_value_t = 5)]
    pub registration_retries: u32,

    /// Seconds between registration attempts.
    #[arg(long, env = "RM_REGISTRATION_DELAY_SECS", default_value_t = 5)]
    pub registration_delay_secs: u64,

    /// How redundant endpoints are ordered.
    #[arg(long, env = "RM_ENDPOINT_SELECTION", value_enum, default_value_t = SelectionArg::Latency)]
    pub selection: SelectionArg,

    /// Dial and ping candidate endpoints concurrently.
    #[arg(long, env = "RM_PARALLEL_PROBES", default_value_t = false)]
    pub parallel_probes: bool,

    /// Dial timeout in milliseconds.
    #[arg(long, env = "RM_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Redundant `host:port` instances to forward requests to. Without
    /// any, requests are echoed back.
    #[arg(
        long = "upstream",
        env = "RM_UPSTREAM",
        value_delimiter = ',',
        value_parser = parse_endpoint
    )]
    pub upstreams: Vec<Endpoint>,
}

fn parse_endpoint(value: &str) -> Result<Endpoint, String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {:?}", value))?;
    if host.is_empty() {
        return Err(format!("missing host in {:?}", value));
    }
    let port = port
        .parse::<u32>()
        .map_err(|e| format!("invalid port in {:?}: {}", value, e))?;
    Ok(Endpoint::new(host, port))
}

impl ComponentConfig {
    /// Endpoint this component advertises.
    pub fn own_endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Address to bind the listener on.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Transport settings for dialing.
    pub fn dial(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            ..Default::default()
        }
    }

    /// Control plane client settings.
    pub fn control_plane(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            endpoint: Endpoint::new(self.control_plane_host.clone(), self.control_plane_port),
            retry: RetryConfig {
                max_retries: self.registration_retries,
                delay: Duration::from_secs(self.registration_delay_secs),
            },
            dial: self.dial(),
        }
    }

    /// Endpoint selector settings.
    pub fn selector(&self) -> SelectorConfig {
        SelectorConfig {
            mode: self.selection.into(),
            parallel_probes: self.parallel_probes,
            dial: self.dial(),
            ..Default::default()
        }
    }
}

/// Command line of the `rm-component` binary.
#[derive(Debug, Parser)]
#[command(name = "rm-component")]
#[command(about = "Routemesh component", long_about = None)]
pub struct Cli {
    /// Component settings.
    #[command(flatten)]
    pub component: ComponentConfig,
}
