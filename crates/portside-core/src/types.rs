//! Record types exchanged between the agent and registry adapters

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One host-port/exposed-port pair extracted from container inspect data.
///
/// Carries the container back-reference fields the agent needs later, when a
/// dangling backend record has to be matched to a local owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port published on the host, empty when the binding is not published
    pub host_port: String,
    /// Host-side address of the binding
    pub host_ip: String,
    /// Port exposed inside the container
    pub exposed_port: String,
    /// Container-side address
    pub exposed_ip: String,
    /// "tcp" or "udp"
    pub port_type: String,
    /// Owning container id
    pub container_id: String,
    /// Owning container name, without the leading slash
    pub container_name: String,
    /// Hostname configured inside the container
    pub container_hostname: String,
}

/// One service instance registered with the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Stable identity: `<hostname>:<container-name>:<exposed-port>[:udp]`,
    /// unless overridden via `SERVICE_ID`. Unique within this host's set of
    /// live registrations.
    pub id: String,
    /// Logical service name
    pub name: String,
    /// Address clients connect to
    pub ip: String,
    /// Port clients connect to
    pub port: i32,
    /// Tags from `SERVICE_TAGS`, forced tags, and the protocol tag for UDP
    pub tags: Vec<String>,
    /// Leftover `SERVICE_*` metadata plus any `com.amazonaws.ecs*` labels
    pub attrs: HashMap<String, String>,
    /// Lease duration in seconds, 0 = no expiry
    pub ttl: i64,
    /// The port binding this service was minted from
    pub origin: ServicePort,
    /// Register the container-exposed endpoint even outside internal mode
    pub use_exposed_ports: bool,
}

/// Tombstone for a container that has exited but whose services are retained
/// briefly so consumers can observe the death through normal lease expiry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeadContainer {
    /// Seconds remaining before the tombstone is dropped
    pub ttl: i64,
    /// The services the container had registered
    pub services: Vec<Service>,
}

/// Work item for the sync worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMessage {
    /// Suppress fatal handling of enumeration failures
    pub quiet: bool,
    /// Non-empty when every registered service must be reallocated to this IP
    pub ip: String,
}
