//! Container runtime access
//!
//! Wraps the Docker API behind the `ContainerRuntime` trait so the bridge and
//! sync worker can be driven by a fake runtime in tests. The bollard-backed
//! client honors `DOCKER_HOST` and falls back to the local unix socket.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use portside_core::ServicePort;

use crate::error::{AgentError, Result};

/// Connection timeout for the Docker daemon, seconds
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// States a container can be in without having exited
const ACTIVE_STATES: [&str; 4] = ["created", "restarting", "running", "paused"];

/// One entry from a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerListing {
    /// Full container id
    pub id: String,
}

/// One host-side binding of a published port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortBindingInfo {
    /// Host address the port is bound on
    pub host_ip: String,
    /// Host port number
    pub host_port: String,
}

/// The slice of container inspect data the agent consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDetails {
    /// Full container id
    pub id: String,
    /// Container name as the daemon reports it, with the leading slash
    pub name: String,
    /// Hostname configured inside the container
    pub hostname: String,
    /// Image reference the container was created from
    pub image: String,
    /// Environment in `NAME=value` form
    pub env: Vec<String>,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Ports exposed by the image/config, `"80/tcp"` form
    pub exposed_ports: Vec<String>,
    /// Runtime port bindings keyed by `"80/tcp"` form
    pub published_ports: HashMap<String, Vec<PortBindingInfo>>,
    /// Network mode from the host config
    pub network_mode: String,
    /// Top-level container IP, empty on custom networks
    pub ip_address: String,
    /// Per-network container IPs keyed by network name
    pub network_ips: HashMap<String, String>,
    /// Whether the container is currently running
    pub running: bool,
    /// Exit code, meaningful once the container stopped
    pub exit_code: i64,
}

impl ContainerDetails {
    /// Container name without the leading slash
    pub fn short_name(&self) -> &str {
        self.name.strip_prefix('/').unwrap_or(&self.name)
    }

    /// Shortened id for log lines
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Shorten a container id the way the Docker CLI does
pub fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}

/// Container lifecycle events the agent reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEventKind {
    /// Container started
    Start,
    /// Container exited
    Die,
}

/// One container lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    /// What happened
    pub kind: ContainerEventKind,
    /// The affected container
    pub container_id: String,
}

/// Interface to the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List every container the daemon knows about
    async fn list_containers(&self) -> Result<Vec<ContainerListing>>;

    /// List containers that have not exited
    async fn list_active_containers(&self) -> Result<Vec<ContainerListing>>;

    /// Full inspect of one container
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;
}

/// bollard-backed runtime client
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon selected by `DOCKER_HOST`, defaulting to the
    /// local unix socket.
    pub fn connect() -> Result<Self> {
        let docker = match std::env::var("DOCKER_HOST") {
            Ok(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(&host, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Ok(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(&host, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            _ => Docker::connect_with_unix_defaults(),
        }
        .map_err(|e| AgentError::docker(format!("failed to connect to docker: {e}")))?;
        Ok(Self { docker })
    }

    /// Subscribe to container start/die events.
    ///
    /// Unparsable messages are skipped; the stream ends when the daemon
    /// connection does.
    pub fn event_stream(&self) -> Pin<Box<dyn Stream<Item = ContainerEvent> + Send + '_>> {
        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("type".to_string(), vec!["container".to_string()])]);
        let stream = self
            .docker
            .events(Some(EventsOptions {
                filters,
                ..Default::default()
            }))
            .filter_map(|message| async move {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "error reading docker event");
                        return None;
                    }
                };
                let container_id = message.actor.and_then(|a| a.id)?;
                let kind = match message.action.as_deref() {
                    Some("start") => ContainerEventKind::Start,
                    Some("die") => ContainerEventKind::Die,
                    _ => return None,
                };
                Some(ContainerEvent { kind, container_id })
            });
        Box::pin(stream)
    }

    async fn list_with_filters(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<ContainerListing>> {
        let listings = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| AgentError::docker(format!("failed to list containers: {e}")))?;

        Ok(listings
            .into_iter()
            .filter_map(|c| c.id.map(|id| ContainerListing { id }))
            .collect())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerListing>> {
        self.list_with_filters(HashMap::new()).await
    }

    async fn list_active_containers(&self) -> Result<Vec<ContainerListing>> {
        let filters = HashMap::from([(
            "status".to_string(),
            ACTIVE_STATES.iter().map(|s| s.to_string()).collect(),
        )]);
        self.list_with_filters(filters).await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => AgentError::ContainerNotFound(id.to_string()),
                other => AgentError::docker(format!("failed to inspect {}: {other}", short_id(id))),
            })?;
        debug!(container_id = %short_id(id), "inspected container");
        Ok(details_from_inspect(response))
    }
}

/// Flatten a bollard inspect response into the agent's view of a container.
pub fn details_from_inspect(response: ContainerInspectResponse) -> ContainerDetails {
    let config = response.config.unwrap_or_default();
    let network_settings = response.network_settings.unwrap_or_default();
    let state = response.state.unwrap_or_default();

    let published_ports = network_settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| PortBindingInfo {
                    host_ip: b.host_ip.unwrap_or_default(),
                    host_port: b.host_port.unwrap_or_default(),
                })
                .collect();
            (port, bindings)
        })
        .collect();

    let network_ips = network_settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
        .collect();

    ContainerDetails {
        id: response.id.unwrap_or_default(),
        name: response.name.unwrap_or_default(),
        hostname: config.hostname.unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        exposed_ports: config
            .exposed_ports
            .unwrap_or_default()
            .into_keys()
            .collect(),
        published_ports,
        network_mode: response
            .host_config
            .and_then(|hc| hc.network_mode)
            .unwrap_or_default(),
        ip_address: network_settings.ip_address.unwrap_or_default(),
        network_ips,
        running: state.running.unwrap_or(false),
        exit_code: state.exit_code.unwrap_or(0),
    }
}

/// Build a `ServicePort` from one port of an inspected container.
///
/// `port` is in `"80/tcp"` form; `published` holds the host bindings, which
/// may be empty for unpublished ports.
pub fn service_port(
    container: &ContainerDetails,
    port: &str,
    published: &[PortBindingInfo],
) -> ServicePort {
    let mut host_port = String::new();
    let mut host_ip = String::new();
    if let Some(binding) = published.first() {
        host_port = binding.host_port.clone();
        host_ip = binding.host_ip.clone();
    }
    if host_ip.is_empty() {
        host_ip = "0.0.0.0".to_string();
    }

    // On overlay/custom networks the binding address is the per-network
    // container IP rather than a host address.
    let mode = container.network_mode.as_str();
    if !mode.is_empty() && mode != "bridge" && mode != "default" && mode != "host" {
        host_ip = container
            .network_ips
            .get(mode)
            .cloned()
            .unwrap_or_default();
    }

    let (exposed_port, port_type) = match port.split_once('/') {
        Some((p, t)) => (p.to_string(), t.to_string()),
        None => (port.to_string(), "tcp".to_string()),
    };

    let mut exposed_ip = container.ip_address.clone();
    if exposed_ip.is_empty() {
        if let Some(ip) = container.network_ips.values().find(|ip| !ip.is_empty()) {
            exposed_ip = ip.clone();
        }
    }

    ServicePort {
        host_port,
        host_ip,
        exposed_port,
        exposed_ip,
        port_type,
        container_id: container.id.clone(),
        container_name: container.short_name().to_string(),
        container_hostname: container.hostname.clone(),
    }
}
