//! Registry adapter wiring
//!
//! Backends are selected by the scheme of the registry URI given on the
//! command line. Real discovery backends plug in through
//! `portside_core::AdapterFactory`; in-tree there are two console adapters:
//!
//! - `log://` writes every operation to the log and registers nothing
//!   remote - the default demo/dry-run backend.
//! - `elb-log://` does the same, but routes LB-flagged services through the
//!   load balancer subsystem first, exercising resolution and health gating.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use portside_core::{AdapterFactory, CoreError, RegistryAdapter, Service};

use crate::elb::{
    check_elb_flags, unique_id, DataCenterInfo, ElbSubsystem, LbRegistry, RegistryInstance,
};
use crate::error::{AgentError, Result as AgentResult};
use crate::health::InstanceStatus;

/// Factories keyed by URI scheme.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, Box<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a URI scheme
    pub fn register(&mut self, scheme: &str, factory: Box<dyn AdapterFactory>) {
        self.factories.insert(scheme.to_string(), factory);
    }

    /// Build the adapter selected by `uri`
    pub fn adapter_for(&self, uri: &str) -> portside_core::Result<Arc<dyn RegistryAdapter>> {
        let parsed = Url::parse(uri).map_err(|_| CoreError::BadUri(uri.to_string()))?;
        let factory = self
            .factories
            .get(parsed.scheme())
            .ok_or_else(|| CoreError::UnknownAdapter(uri.to_string()))?;
        debug!(scheme = %parsed.scheme(), uri = %parsed, "using adapter");
        Ok(factory.new_adapter(&parsed))
    }
}

/// The registry with the always-available `log:` backend.
pub fn builtin_registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register("log", Box::new(LogAdapterFactory));
    registry
}

/// Factory for the plain console adapter
pub struct LogAdapterFactory;

impl AdapterFactory for LogAdapterFactory {
    fn new_adapter(&self, uri: &Url) -> Arc<dyn RegistryAdapter> {
        Arc::new(LogAdapter { uri: uri.clone() })
    }
}

/// Console-only backend: every operation is logged, nothing is stored.
pub struct LogAdapter {
    uri: Url,
}

#[async_trait]
impl RegistryAdapter for LogAdapter {
    async fn ping(&self) -> portside_core::Result<()> {
        info!(uri = %self.uri, "ping");
        Ok(())
    }

    async fn register(&self, service: &Service) -> portside_core::Result<()> {
        info!(
            service_id = %service.id,
            name = %service.name,
            endpoint = %format!("{}:{}", service.ip, service.port),
            tags = ?service.tags,
            "register"
        );
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> portside_core::Result<()> {
        info!(service_id = %service.id, "deregister");
        Ok(())
    }

    async fn refresh(&self, service: &Service) -> portside_core::Result<()> {
        info!(service_id = %service.id, ttl = service.ttl, "refresh");
        Ok(())
    }

    async fn services(&self) -> portside_core::Result<Vec<Service>> {
        Ok(Vec::new())
    }
}

/// Factory for the LB-aware console adapter
pub struct ElbLogAdapterFactory {
    subsystem: Arc<ElbSubsystem>,
}

impl ElbLogAdapterFactory {
    /// Wrap an already-constructed LB subsystem
    pub fn new(subsystem: Arc<ElbSubsystem>) -> Self {
        Self { subsystem }
    }
}

impl AdapterFactory for ElbLogAdapterFactory {
    fn new_adapter(&self, uri: &Url) -> Arc<dyn RegistryAdapter> {
        Arc::new(ElbLogAdapter {
            uri: uri.clone(),
            subsystem: self.subsystem.clone(),
        })
    }
}

/// Console backend that routes LB-flagged services through load balancer
/// resolution and health gating before logging the final registration.
pub struct ElbLogAdapter {
    uri: Url,
    subsystem: Arc<ElbSubsystem>,
}

impl ElbLogAdapter {
    fn instance_template(&self, service: &Service) -> RegistryInstance {
        let hostname = if !service.origin.container_hostname.is_empty() {
            service.origin.container_hostname.clone()
        } else {
            service.ip.clone()
        };
        RegistryInstance {
            app: service.name.clone(),
            hostname: hostname.clone(),
            ip_addr: service.ip.clone(),
            vip_address: service.ip.clone(),
            port: service.port,
            status: InstanceStatus::Up,
            lease_duration_secs: service.ttl,
            metadata: service.attrs.clone(),
            datacenter: DataCenterInfo {
                name: "Amazon".to_string(),
                instance_id: self.subsystem.instance_id().to_string(),
                public_hostname: hostname.clone(),
                hostname,
            },
        }
    }

    fn core_err(e: AgentError) -> CoreError {
        CoreError::Registry(e.to_string())
    }
}

#[async_trait]
impl RegistryAdapter for ElbLogAdapter {
    async fn ping(&self) -> portside_core::Result<()> {
        info!(uri = %self.uri, "ping");
        Ok(())
    }

    async fn register(&self, service: &Service) -> portside_core::Result<()> {
        if check_elb_flags(service) {
            let template = self.instance_template(service);
            return self
                .subsystem
                .register_with_lb(service, &template, self)
                .await
                .map_err(Self::core_err);
        }
        info!(
            service_id = %service.id,
            endpoint = %format!("{}:{}", service.ip, service.port),
            "register"
        );
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> portside_core::Result<()> {
        info!(service_id = %service.id, "deregister");
        self.subsystem
            .remove_lb_cache(&service.origin.container_id)
            .await;
        self.subsystem
            .tracker
            .forget(&service.origin.container_id)
            .await;
        Ok(())
    }

    async fn refresh(&self, service: &Service) -> portside_core::Result<()> {
        if check_elb_flags(service) {
            let template = self.instance_template(service);
            return self
                .subsystem
                .heartbeat_lb(service, &template, self)
                .await
                .map_err(Self::core_err);
        }
        info!(service_id = %service.id, ttl = service.ttl, "refresh");
        Ok(())
    }

    async fn services(&self) -> portside_core::Result<Vec<Service>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl LbRegistry for ElbLogAdapter {
    async fn instance_status(&self, _app: &str, _unique_id: &str) -> AgentResult<InstanceStatus> {
        // A console backend holds no remote state
        Ok(InstanceStatus::Unknown)
    }

    async fn reregister(&self, instance: &RegistryInstance) -> AgentResult<()> {
        info!(
            id = %unique_id(instance),
            status = %instance.status,
            lease = instance.lease_duration_secs,
            metadata = ?instance.metadata,
            "LB reregister"
        );
        Ok(())
    }

    async fn heartbeat(&self, instance: &RegistryInstance) -> AgentResult<()> {
        info!(id = %unique_id(instance), "LB heartbeat");
        Ok(())
    }
}
