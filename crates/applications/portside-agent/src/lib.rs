//! # Portside Agent
//!
//! Host-level service registrator. Watches Docker container lifecycle events
//! on one host and keeps a service-discovery backend in agreement with the
//! services those containers publish.
//!
//! ## Architecture
//!
//! ```text
//! Docker events ──┐                      ┌── registry adapter (plug-in)
//!                 ▼                      ▼
//!            agent loop ──► bridge ──► backend
//!                 │            ▲
//!   tickers ──────┘            │ (one lock, one sync worker)
//!   (refresh / prune /         │
//!    resync / IP poll)    LB subsystem (resolver + health gate)
//! ```
//!
//! The bridge owns the per-host service table. Container events mutate it
//! directly under its lock; full reconciliation sweeps are serialized through
//! a single-consumer sync worker. Services fronted by an ALB are resolved to
//! their load balancer endpoint and health-gated before registration.
//!
//! Everything remote is a trait: the discovery backend
//! ([`portside_core::RegistryAdapter`]), the container runtime
//! ([`docker::ContainerRuntime`]), and the LB-aware backend operations
//! ([`elb::LbRegistry`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod aws;
pub mod bridge;
pub mod cache;
pub mod docker;
pub mod elb;
pub mod error;
pub mod health;
pub mod ip_source;
pub mod metadata;
pub(crate) mod sync;

// Error handling
pub use error::{AgentError, Result};

// Bridge and configuration
pub use bridge::{Bridge, Config, DeregisterPolicy};

// Runtime access
pub use docker::{
    ContainerDetails, ContainerEvent, ContainerEventKind, ContainerRuntime, DockerRuntime,
};

// Caching
pub use cache::{CacheRead, Ttl, TtlCache, DEFAULT_TTL};

// Load balancer subsystem
pub use elb::{
    check_elb_flags, check_elb_only_reg, unique_id, ElbSubsystem, LbRegistry,
    LoadBalancerRegistrationInfo, LookupValues, RegistryInstance,
};
pub use health::{InstanceStatus, StatusChange, StatusTracker};

// External IP discovery
pub use ip_source::{run_poll_loop, ExternalIpSource, IpLookupClient};

// Adapter wiring
pub use adapters::{builtin_registry, AdapterRegistry, ElbLogAdapterFactory, LogAdapterFactory};
