//! The bridge: per-host owner of the service table
//!
//! All mutation of the table converges on one lock. Container events drive
//! `add`/`remove_on_exit` directly; full reconciliation sweeps go through the
//! sync worker, which holds the same lock for the duration of a sweep.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, error};

use portside_core::{DeadContainer, RegistryAdapter, Service, ServicePort, SyncMessage};

use crate::docker::{service_port, short_id, ContainerDetails, ContainerRuntime, PortBindingInfo};
use crate::error::AgentError;
use crate::metadata::{combine_tags, lookup_env, map_default, service_metadata};
use crate::sync;

/// Exit codes with this bit set represent death by signal
const SIGNALED_BIT: i64 = 128;

/// When exited containers are deregistered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeregisterPolicy {
    /// Deregister every exited container
    #[default]
    Always,
    /// Deregister only containers that exited cleanly or by signal
    OnSuccess,
}

impl FromStr for DeregisterPolicy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "on-success" => Ok(Self::OnSuccess),
            other => Err(AgentError::config(format!(
                "deregister must be \"always\" or \"on-success\", was {other:?}"
            ))),
        }
    }
}

/// Agent configuration consumed by the bridge
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Forced host IP for registrations, empty to use the binding address
    pub host_ip: String,
    /// Register container-exposed ports/IPs rather than host-mapped ones
    pub internal: bool,
    /// Label to read the service IP from, empty to disable
    pub use_ip_from_label: String,
    /// Comma-separated tags appended to every service
    pub force_tags: String,
    /// Service lease seconds, 0 = no expiry
    pub refresh_ttl: i64,
    /// Lease refresh cadence seconds
    pub refresh_interval: i64,
    /// Exit-time deregistration policy
    pub deregister_check: DeregisterPolicy,
    /// Reap dangling backend records during sweeps
    pub cleanup: bool,
    /// Only register containers carrying `SERVICE_REGISTER=true`
    pub require_label: bool,
    /// This host's name, used in service ids and cleanup matching
    pub hostname: String,
}

/// The two tables the bridge owns. Disjoint at all times: a container id is
/// either live or tombstoned, never both.
#[derive(Debug, Default)]
pub(crate) struct BridgeState {
    pub(crate) services: HashMap<String, Vec<Service>>,
    pub(crate) dead_containers: HashMap<String, DeadContainer>,
}

/// Per-host coordinator between the container runtime and the registry.
pub struct Bridge {
    pub(crate) registry: Arc<dyn RegistryAdapter>,
    pub(crate) docker: Arc<dyn ContainerRuntime>,
    pub(crate) state: Mutex<BridgeState>,
    pub(crate) config: Config,
    sync_tx: mpsc::Sender<SyncMessage>,
}

impl Bridge {
    /// Create a bridge without starting its sync worker. The returned
    /// receiver is the worker's input; tests drive it directly.
    pub(crate) fn new(
        docker: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryAdapter>,
        config: Config,
    ) -> (Arc<Self>, mpsc::Receiver<SyncMessage>) {
        // Capacity 1: a producer blocks while a sweep is in flight, which is
        // the backpressure that keeps sweeps from piling up.
        let (sync_tx, sync_rx) = mpsc::channel(1);
        let bridge = Arc::new(Self {
            registry,
            docker,
            state: Mutex::new(BridgeState::default()),
            config,
            sync_tx,
        });
        (bridge, sync_rx)
    }

    /// Create a bridge and spawn its sync worker.
    pub fn start(
        docker: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryAdapter>,
        config: Config,
    ) -> Arc<Self> {
        let (bridge, sync_rx) = Self::new(docker, registry, config);
        tokio::spawn(sync::run(bridge.clone(), sync_rx));
        bridge
    }

    /// The configuration this bridge was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Probe the backend
    pub async fn ping(&self) -> crate::error::Result<()> {
        self.registry.ping().await?;
        Ok(())
    }

    /// Enqueue a reconciliation sweep. Blocks while the worker is busy.
    pub async fn push_sync(&self, message: SyncMessage) {
        if self.sync_tx.send(message).await.is_err() {
            error!("sync worker is gone, dropping sync message");
        }
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().await
    }

    /// Register the services a container publishes.
    ///
    /// Idempotent: a container already present in the table is left alone. A
    /// tombstoned container is resurrected without re-registering. `quiet`
    /// suppresses per-port noise during sweeps; `ip_override` carries the
    /// reallocation address during an IP-change sweep.
    pub async fn add(&self, container_id: &str, quiet: bool, ip_override: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(dead) = state.dead_containers.remove(container_id) {
                debug!(
                    container_id = %short_id(container_id),
                    "resurrecting tombstoned container"
                );
                state
                    .services
                    .insert(container_id.to_string(), dead.services);
            }
            if state.services.contains_key(container_id) {
                debug!(
                    container_id = %short_id(container_id),
                    "container already present, ignoring"
                );
                return;
            }
        }

        let container = match self.docker.inspect_container(container_id).await {
            Ok(container) => container,
            Err(e) => {
                error!(
                    container_id = %short_id(container_id),
                    error = %e,
                    "unable to inspect container"
                );
                return;
            }
        };

        // Configured exposures first (useful with --net=host), runtime
        // bindings second so a published port wins.
        let mut ports: HashMap<String, ServicePort> = HashMap::new();
        for port in &container.exposed_ports {
            let number = port.split('/').next().unwrap_or(port).to_string();
            let published = vec![PortBindingInfo {
                host_ip: "0.0.0.0".to_string(),
                host_port: number,
            }];
            ports.insert(port.clone(), service_port(&container, port, &published));
        }
        for (port, published) in &container.published_ports {
            ports.insert(port.clone(), service_port(&container, port, published));
        }

        if ports.is_empty() {
            if !quiet {
                debug!(container_id = %container.short_id(), "ignored: no published ports");
            }
            return;
        }

        let use_exposed =
            lookup_env(&container.env, "SERVICE_USE_EXPOSED_PORTS").eq_ignore_ascii_case("true");
        let mut service_ports: Vec<ServicePort> = Vec::new();
        for (_, port) in ports {
            if !self.config.internal && !use_exposed && port.host_port.is_empty() {
                if !quiet {
                    debug!(
                        container_id = %container.short_id(),
                        port = %port.exposed_port,
                        "ignored: not published on host"
                    );
                }
                continue;
            }
            service_ports.push(port);
        }

        let is_group = service_ports.len() > 1;
        let mut registered = Vec::new();
        for port in service_ports {
            let exposed_port = port.exposed_port.clone();
            let Some(service) = self
                .new_service(port, is_group, ip_override, &container)
                .await
            else {
                if !quiet {
                    debug!(
                        container_id = %container.short_id(),
                        port = %exposed_port,
                        "ignored: service suppressed"
                    );
                }
                continue;
            };
            match self.registry.register(&service).await {
                Ok(()) => registered.push(service),
                Err(e) => {
                    error!(service_id = %service.id, error = %e, "register failed");
                }
            }
        }

        if registered.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.services.contains_key(&container.id) {
            debug!(
                container_id = %container.short_id(),
                "container appeared concurrently, will not append"
            );
            return;
        }
        for service in &registered {
            debug!(container_id = %container.short_id(), service_id = %service.id, "added");
        }
        state.services.insert(container.id.clone(), registered);
    }

    /// Mint a service from one port binding. Returns `None` when the service
    /// is suppressed by metadata or policy.
    async fn new_service(
        &self,
        mut port: ServicePort,
        is_group: bool,
        ip_override: &str,
        container: &ContainerDetails,
    ) -> Option<Service> {
        let default_name = container
            .image
            .rsplit('/')
            .next()
            .unwrap_or(&container.image)
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut hostname = self.config.hostname.clone();
        if hostname.is_empty() {
            hostname = port.host_ip.clone();
        }
        if port.host_ip == "0.0.0.0" {
            if let Ok(mut addrs) = tokio::net::lookup_host((hostname.as_str(), 0u16)).await {
                if let Some(addr) = addrs.next() {
                    port.host_ip = addr.ip().to_string();
                }
            }
        }

        if !self.config.host_ip.is_empty() {
            port.host_ip = self.config.host_ip.clone();
        }
        if !ip_override.is_empty() {
            port.host_ip = ip_override.to_string();
        }

        let (mut metadata, metadata_from_port) =
            service_metadata(&container.labels, &container.env, &port.exposed_port);

        if !map_default(&metadata, "ignore", "").is_empty() {
            return None;
        }
        if self.config.require_label
            && !map_default(&metadata, "register", "false").eq_ignore_ascii_case("true")
        {
            debug!(
                container = %container.name,
                "did not find SERVICE_REGISTER on container, ignoring"
            );
            return None;
        }

        let mut service = Service {
            id: format!("{hostname}:{}:{}", port.container_name, port.exposed_port),
            name: map_default(&metadata, "name", &default_name),
            ..Service::default()
        };
        if is_group && !metadata_from_port.contains("name") {
            service.name = format!("{}-{}", service.name, port.exposed_port);
        }

        service.use_exposed_ports =
            map_default(&metadata, "use_exposed_ports", "").eq_ignore_ascii_case("true");
        if self.config.internal || service.use_exposed_ports {
            service.ip = port.exposed_ip.clone();
            service.port = port.exposed_port.parse().unwrap_or(0);
        } else {
            service.ip = port.host_ip.clone();
            service.port = port.host_port.parse().unwrap_or(0);
        }

        if !self.config.use_ip_from_label.is_empty() {
            match container.labels.get(&self.config.use_ip_from_label) {
                Some(label_ip) if !label_ip.is_empty() => {
                    // Strip a trailing /mask if the label holds a CIDR
                    service.ip = match label_ip.rfind('/') {
                        Some(idx) => label_ip[..idx].to_string(),
                        None => label_ip.clone(),
                    };
                    debug!(
                        ip = %service.ip,
                        label = %self.config.use_ip_from_label,
                        "using container IP from label"
                    );
                }
                _ => {
                    debug!(
                        label = %self.config.use_ip_from_label,
                        "label not found in container configuration"
                    );
                }
            }
        }

        // NetworkMode can point at another container (pod-style grouping)
        if let Some(linked) = container.network_mode.strip_prefix("container:") {
            let linked_id = linked.split(':').next().unwrap_or(linked);
            debug!(
                service = %service.name,
                linked = %short_id(linked_id),
                "detected container network mode"
            );
            match self.docker.inspect_container(linked_id).await {
                Ok(network_container) => {
                    service.ip = network_container.ip_address.clone();
                    debug!(service = %service.name, ip = %service.ip, "using network container IP");
                }
                Err(e) => {
                    error!(
                        linked = %short_id(linked_id),
                        error = %e,
                        "unable to inspect network container"
                    );
                }
            }
        }

        let tag_meta = map_default(&metadata, "tags", "");
        if port.port_type == "udp" {
            service.tags = combine_tags(&[&tag_meta, &self.config.force_tags, "udp"]);
            service.id = format!("{}:udp", service.id);
        } else {
            service.tags = combine_tags(&[&tag_meta, &self.config.force_tags]);
        }

        for (key, value) in &container.labels {
            if key.contains("com.amazonaws.ecs") {
                metadata.insert(key.clone(), value.clone());
            }
        }

        let id_override = map_default(&metadata, "id", "");
        if !id_override.is_empty() {
            service.id = id_override;
        }

        metadata.remove("id");
        metadata.remove("tags");
        metadata.remove("name");
        service.attrs = metadata;
        service.ttl = self.config.refresh_ttl;
        service.origin = port;

        Some(service)
    }

    /// Drop a container from the table.
    ///
    /// With `deregister`, its services (and any tombstoned ones) are removed
    /// from the backend. Otherwise, when a refresh TTL is configured, the
    /// services move into the tombstone table so their leases run out
    /// naturally.
    pub async fn remove(&self, container_id: &str, deregister: bool) {
        debug!(container_id = %short_id(container_id), "container stop detected");
        let mut state = self.state.lock().await;

        if deregister {
            if let Some(services) = state.services.get(container_id) {
                for service in services {
                    match self.registry.deregister(service).await {
                        Ok(()) => {
                            debug!(
                                container_id = %short_id(container_id),
                                service_id = %service.id,
                                "removed"
                            );
                        }
                        Err(e) => {
                            error!(service_id = %service.id, error = %e, "deregister failed");
                        }
                    }
                }
            }
            if let Some(dead) = state.dead_containers.remove(container_id) {
                for service in &dead.services {
                    match self.registry.deregister(service).await {
                        Ok(()) => {
                            debug!(
                                container_id = %short_id(container_id),
                                service_id = %service.id,
                                "removed tombstoned"
                            );
                        }
                        Err(e) => {
                            error!(service_id = %service.id, error = %e, "deregister failed");
                        }
                    }
                }
            }
        } else if self.config.refresh_ttl != 0 {
            if let Some(services) = state.services.get(container_id).cloned() {
                state.dead_containers.insert(
                    container_id.to_string(),
                    DeadContainer {
                        ttl: self.config.refresh_ttl,
                        services,
                    },
                );
            }
        }
        state.services.remove(container_id);
    }

    /// Remove a container after a die event, applying the exit policy.
    pub async fn remove_on_exit(&self, container_id: &str) {
        let deregister = self.should_remove(container_id).await;
        self.remove(container_id, deregister).await;
    }

    /// Decide whether a died container's services should be deregistered.
    async fn should_remove(&self, container_id: &str) -> bool {
        if self.config.deregister_check == DeregisterPolicy::Always {
            return true;
        }
        match self.docker.inspect_container(container_id).await {
            Err(AgentError::ContainerNotFound(_)) => {
                // Already reaped, e.g. run with --rm; the exit code is gone
                debug!(
                    container_id = %short_id(container_id),
                    "container was removed, could not fetch exit code"
                );
                true
            }
            Err(e) => {
                error!(
                    container_id = %short_id(container_id),
                    error = %e,
                    "error fetching status for container on die event"
                );
                false
            }
            Ok(container) if container.running => {
                debug!(
                    container_id = %short_id(container_id),
                    "not removing container, still running"
                );
                false
            }
            Ok(container) => {
                container.exit_code == 0 || container.exit_code & SIGNALED_BIT == SIGNALED_BIT
            }
        }
    }

    /// Renew the lease of every known service, tombstoned ones included, so
    /// a just-died container stays resolvable until its tombstone expires.
    pub async fn refresh(&self) {
        let (services, dead) = self.snapshot().await;
        let mut all: Vec<(&String, &Vec<Service>)> = services.iter().collect();
        for (container_id, tombstone) in &dead {
            all.push((container_id, &tombstone.services));
        }
        for (container_id, services) in all {
            for service in services.iter() {
                match self.registry.refresh(service).await {
                    Ok(()) => {
                        debug!(
                            container_id = %short_id(container_id),
                            service_id = %service.id,
                            "refreshed"
                        );
                    }
                    Err(e) => {
                        error!(service_id = %service.id, error = %e, "refresh failed");
                    }
                }
            }
        }
    }

    /// Age every tombstone by one refresh interval, dropping the expired.
    pub async fn prune_dead_containers(&self) {
        let mut state = self.state.lock().await;
        let interval = self.config.refresh_interval;
        state.dead_containers.retain(|container_id, dead| {
            dead.ttl -= interval;
            if dead.ttl <= 0 {
                debug!(container_id = %short_id(container_id), "pruning dead container");
                false
            } else {
                true
            }
        });
    }

    /// Deep copy of both tables, taken under the lock so registry calls can
    /// run outside it.
    pub(crate) async fn snapshot(
        &self,
    ) -> (HashMap<String, Vec<Service>>, HashMap<String, DeadContainer>) {
        let state = self.state.lock().await;
        (state.services.clone(), state.dead_containers.clone())
    }
}
