//! Load balancer resolution
//!
//! Deployments that hide containers behind an ALB register the load balancer
//! as the service endpoint instead of the container. Answering "which load
//! balancer fronts this container?" takes several indirections:
//!
//! 1. Find the target group holding `(instance-id, host-port)` - via the
//!    container orchestrator when cluster/task hints are available (two
//!    calls), otherwise by scanning every target group (expensive, cached).
//! 2. Find the listener whose default action forwards to that target group;
//!    its port is the published port.
//! 3. Describe the load balancer for its public DNS name.
//!
//! Results are cached per container and treated as immutable afterwards.
//! Containers can skip the lookup entirely by supplying
//! `eureka_elbv2_hostname`, `eureka_elbv2_port` and `eureka_elbv2_targetgroup`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_elasticloadbalancingv2::types::{Listener, LoadBalancer, TargetGroup, TargetHealthDescription};
use aws_sdk_elasticloadbalancingv2::Client as ElbClient;
use rand::Rng;
use tracing::{debug, error, info, warn};

use portside_core::Service;

use crate::cache::{Ttl, TtlCache};
use crate::error::{AgentError, Result};
use crate::health::{InstanceStatus, StatusTracker};

/// Reduced lease so LB registrations drop out of the backend quickly
pub const LB_LEASE_SECONDS: i64 = 35;

/// Target groups are paged through this many at a time
const TARGET_GROUP_PAGE_SIZE: i32 = 400;

/// ECS DescribeServices accepts at most this many names per call
const DESCRIBE_SERVICES_CHUNK: usize = 10;

/// Upper bound of the random pre-lookup wait, milliseconds
const LOOKUP_JITTER_MS: u64 = 5000;

/// An ELBv2 endpoint resolved for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadBalancerRegistrationInfo {
    /// Public DNS name of the load balancer
    pub dns_name: String,
    /// Listener port publishing the target group
    pub port: i32,
    /// Target group holding the container's instance/port pair
    pub target_group_arn: String,
    /// `<dns>_<port>` identity used in registration metadata
    pub elb_endpoint: String,
    /// Registered IP, blank for LB registrations
    pub ip_address: String,
    /// Registered VIP, blank for LB registrations
    pub vip_address: String,
}

/// Inputs for one load balancer lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupValues {
    /// EC2 instance id of the docker host
    pub instance_id: String,
    /// Host port the container publishes
    pub port: i32,
    /// ECS cluster hint, empty when unknown
    pub cluster_name: String,
    /// ECS service hint, empty when unknown
    pub service_name: String,
    /// ECS task ARN hint, empty when unknown
    pub task_arn: String,
}

/// Datacenter block of a wire registration record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataCenterInfo {
    /// Datacenter class, e.g. "Amazon"
    pub name: String,
    /// Unique instance identity within the datacenter
    pub instance_id: String,
    /// Externally resolvable hostname
    pub public_hostname: String,
    /// Hostname as registered
    pub hostname: String,
}

/// The registration record an LB-aware backend puts on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryInstance {
    /// Application the instance belongs to
    pub app: String,
    /// Registered hostname
    pub hostname: String,
    /// Registered IP, blank for LB registrations
    pub ip_addr: String,
    /// Registered VIP, blank for LB registrations
    pub vip_address: String,
    /// Registered port
    pub port: i32,
    /// Health-gated registration status
    pub status: InstanceStatus,
    /// Lease duration in seconds
    pub lease_duration_secs: i64,
    /// Free-form registration metadata
    pub metadata: HashMap<String, String>,
    /// Datacenter identity block
    pub datacenter: DataCenterInfo,
}

impl RegistryInstance {
    /// Set one metadata key
    pub fn set_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }
}

/// `<hostname>_<port>`, the identity LB registrations are stored under.
pub fn unique_id(instance: &RegistryInstance) -> String {
    format!("{}_{}", instance.hostname, instance.port)
}

/// The backend operations the LB subsystem drives. Implemented by LB-aware
/// registry adapters; the wire protocol behind it is out of scope here.
#[async_trait]
pub trait LbRegistry: Send + Sync {
    /// The backend's currently-visible status for a registration
    async fn instance_status(&self, app: &str, unique_id: &str) -> Result<InstanceStatus>;

    /// Create or replace a registration
    async fn reregister(&self, instance: &RegistryInstance) -> Result<()>;

    /// Renew a registration's lease
    async fn heartbeat(&self, instance: &RegistryInstance) -> Result<()>;
}

/// Should this service be registered via its load balancer?
///
/// Either the explicit endpoint trio is present, or
/// `eureka_lookup_elbv2_endpoint` asks for automatic lookup; both require the
/// datacenter not to be self-declared (`MyOwn`).
pub fn check_elb_flags(service: &Service) -> bool {
    let is_aws = service.attrs.get("eureka_datacenterinfo_name").map(String::as_str) != Some("MyOwn");
    let has_explicit = explicit_override(service).is_some();
    let use_lookup = service
        .attrs
        .get("eureka_lookup_elbv2_endpoint")
        .map(|v| {
            v.parse::<bool>().unwrap_or_else(|_| {
                warn!(value = %v, "eureka_lookup_elbv2_endpoint must be a valid boolean");
                false
            })
        })
        .unwrap_or(false);
    (has_explicit || use_lookup) && is_aws
}

/// Should only the load balancer be registered, with container identity
/// stripped? Defaults to true when unset or unparsable.
pub fn check_elb_only_reg(service: &Service) -> bool {
    match service.attrs.get("eureka_elbv2_only_registration") {
        Some(v) if !v.is_empty() => v.parse::<bool>().unwrap_or_else(|_| {
            warn!(value = %v, "eureka_elbv2_only_registration must be a valid boolean");
            true
        }),
        _ => true,
    }
}

/// The explicit `(hostname, port, target group)` trio, when fully supplied.
fn explicit_override(service: &Service) -> Option<(String, u16, String)> {
    let hostname = service.attrs.get("eureka_elbv2_hostname")?;
    let port = service.attrs.get("eureka_elbv2_port")?;
    let target_group = service.attrs.get("eureka_elbv2_targetgroup")?;
    if hostname.is_empty() || target_group.is_empty() {
        return None;
    }
    let port = match port.parse::<u16>() {
        Ok(p) => p,
        Err(e) => {
            warn!(value = %port, error = %e, "eureka_elbv2_port must be a valid 16-bit unsigned int");
            return None;
        }
    };
    Some((hostname.clone(), port, target_group.clone()))
}

/// The cohesive handle for everything load-balancer: AWS clients, the lookup
/// cache, and the per-container status history.
pub struct ElbSubsystem {
    elb: ElbClient,
    ecs: EcsClient,
    pub(crate) cache: Arc<TtlCache>,
    pub(crate) tracker: StatusTracker,
    instance_id: String,
    pub(crate) refresh_interval: i64,
    lookup_jitter: Duration,
}

impl ElbSubsystem {
    /// Build the subsystem from a shared AWS config.
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        cache: Arc<TtlCache>,
        instance_id: String,
        refresh_interval: i64,
    ) -> Self {
        Self {
            elb: ElbClient::new(sdk_config),
            ecs: EcsClient::new(sdk_config),
            cache,
            tracker: StatusTracker::new(),
            instance_id,
            refresh_interval,
            lookup_jitter: Duration::from_millis(LOOKUP_JITTER_MS),
        }
    }

    /// Override the upper bound of the random pre-lookup wait
    pub fn with_lookup_jitter(mut self, jitter: Duration) -> Self {
        self.lookup_jitter = jitter;
        self
    }

    /// EC2 instance id of this host
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Drop the cached load balancer data for a container.
    pub async fn remove_lb_cache(&self, container_id: &str) {
        self.cache.remove(&format!("container_{container_id}")).await;
    }

    /// Resolve (and permanently cache) the load balancer fronting a
    /// container.
    pub async fn lb_for_container(
        &self,
        container_id: &str,
        lookup: LookupValues,
    ) -> Result<Arc<LoadBalancerRegistrationInfo>> {
        let key = format!("container_{container_id}");
        self.cache
            .get_or_compute(&key, Ttl::NoExpiry, || self.resolve_lb(lookup))
            .await
    }

    /// Healthy targets of a target group, cached for just under one refresh
    /// interval so each refresh cycle sees at most one real call.
    pub async fn healthy_targets(&self, tg_arn: &str) -> Result<Arc<Vec<TargetHealthDescription>>> {
        let ttl = if self.refresh_interval != 0 {
            Ttl::seconds((self.refresh_interval - 1).max(1) as u64)
        } else {
            Ttl::After(self.cache.default_ttl())
        };
        self.cache
            .get_or_compute(&format!("tg_arn_{tg_arn}"), ttl, || {
                self.fetch_healthy_targets(tg_arn)
            })
            .await
    }

    async fn fetch_healthy_targets(&self, tg_arn: &str) -> Result<Vec<TargetHealthDescription>> {
        debug!(target_group = %tg_arn, "looking for healthy targets");
        let output = self
            .elb
            .describe_target_health()
            .target_group_arn(tg_arn)
            .send()
            .await
            .map_err(|e| AgentError::aws(format!("DescribeTargetHealth failed: {e}")))?;
        Ok(output
            .target_health_descriptions()
            .iter()
            .filter(|thd| {
                thd.target_health()
                    .and_then(|th| th.state())
                    .map(|s| s.as_str() == "healthy")
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    /// The real lookup behind `lb_for_container`.
    async fn resolve_lb(&self, lookup: LookupValues) -> Result<LoadBalancerRegistrationInfo> {
        // Small random wait to reduce the risk of API throttling when many
        // containers start at once
        if !self.lookup_jitter.is_zero() {
            let jitter_ms = rand::thread_rng().gen_range(0..self.lookup_jitter.as_millis() as u64);
            let jitter = Duration::from_millis(jitter_ms);
            debug!(wait = ?jitter, "waiting before load balancer lookup to avoid throttling");
            tokio::time::sleep(jitter).await;
        }

        let mut service_name = lookup.service_name.clone();
        if service_name.is_empty() && !lookup.cluster_name.is_empty() && !lookup.task_arn.is_empty()
        {
            service_name = self
                .lookup_service_name(&lookup.cluster_name, &lookup.task_arn)
                .await
                .unwrap_or_default();
        }

        let (tg_arn, lb_arn) = if service_name.is_empty() {
            self.scan_target_groups(&lookup).await?
        } else {
            let (lb, tg) = self
                .load_balancer_from_service(&service_name, &lookup.cluster_name)
                .await?;
            (
                tg.target_group_arn().unwrap_or_default().to_string(),
                lb.load_balancer_arn().unwrap_or_default().to_string(),
            )
        };

        // The listener whose default action forwards to our target group
        // carries the published port
        let listeners = self
            .cache
            .get_or_compute(
                &format!("lsnr_{lb_arn}"),
                Ttl::After(self.cache.default_ttl()),
                || self.fetch_listeners(&lb_arn),
            )
            .await?;
        let mut lb_port = None;
        'listeners: for listener in listeners.iter() {
            for action in listener.default_actions() {
                if action.target_group_arn() == Some(tg_arn.as_str()) {
                    debug!(listener = ?listener.listener_arn(), "found matching listener");
                    lb_port = listener.port();
                    break 'listeners;
                }
            }
        }
        let Some(lb_port) = lb_port else {
            return Err(AgentError::aws("unable to identify listener port for ELBv2"));
        };

        let load_balancers = self
            .cache
            .get_or_compute(
                &format!("lb_{lb_arn}"),
                Ttl::After(self.cache.default_ttl()),
                || self.fetch_load_balancers(&lb_arn),
            )
            .await?;
        let dns_name = load_balancers
            .first()
            .and_then(|lb| lb.dns_name())
            .ok_or_else(|| AgentError::aws("load balancer has no DNS name"))?
            .to_string();

        info!(
            instance = %lookup.instance_id,
            port = lookup.port,
            target_group = %tg_arn,
            endpoint = %format!("{dns_name}:{lb_port}"),
            "resolved load balancer endpoint"
        );
        Ok(LoadBalancerRegistrationInfo {
            elb_endpoint: format!("{dns_name}_{lb_port}"),
            dns_name,
            port: lb_port,
            target_group_arn: tg_arn,
            ip_address: String::new(),
            vip_address: String::new(),
        })
    }

    async fn fetch_listeners(&self, lb_arn: &str) -> Result<Vec<Listener>> {
        let output = self
            .elb
            .describe_listeners()
            .load_balancer_arn(lb_arn)
            .send()
            .await
            .map_err(|e| AgentError::aws(format!("DescribeListeners failed: {e}")))?;
        Ok(output.listeners().to_vec())
    }

    async fn fetch_load_balancers(&self, lb_arn: &str) -> Result<Vec<LoadBalancer>> {
        let output = self
            .elb
            .describe_load_balancers()
            .load_balancer_arns(lb_arn)
            .send()
            .await
            .map_err(|e| AgentError::aws(format!("DescribeLoadBalancers failed: {e}")))?;
        Ok(output.load_balancers().to_vec())
    }

    /// Slow path: page through every target group and match targets by
    /// `(instance-id, port)`. First match wins.
    async fn scan_target_groups(&self, lookup: &LookupValues) -> Result<(String, String)> {
        let target_groups = self
            .cache
            .get_or_compute("tg", Ttl::After(self.cache.default_ttl()), || {
                self.fetch_all_target_groups()
            })
            .await
            .map_err(|e| AgentError::aws(format!("failed to retrieve target groups: {e}")))?;

        debug!(count = target_groups.len(), "target groups to check");
        for tg in target_groups.iter() {
            let Some(tg_arn) = tg.target_group_arn() else {
                continue;
            };
            let targets = self
                .cache
                .get_or_compute(
                    &format!("tg_targets_{tg_arn}"),
                    Ttl::After(self.cache.default_ttl()),
                    || self.fetch_target_health(tg_arn),
                )
                .await?;
            let matched = targets.iter().any(|thd| {
                thd.target()
                    .map(|t| {
                        t.port() == Some(lookup.port) && t.id() == Some(lookup.instance_id.as_str())
                    })
                    .unwrap_or(false)
            });
            if matched {
                debug!(target_group = %tg_arn, "target group matched");
                let lb_arn = tg
                    .load_balancer_arns()
                    .first()
                    .cloned()
                    .ok_or_else(|| AgentError::aws("matched target group has no load balancer"))?;
                return Ok((tg_arn.to_string(), lb_arn));
            }
        }
        Err(AgentError::aws("failed to retrieve load balancer ARN"))
    }

    async fn fetch_target_health(&self, tg_arn: &str) -> Result<Vec<TargetHealthDescription>> {
        let output = self
            .elb
            .describe_target_health()
            .target_group_arn(tg_arn)
            .send()
            .await
            .map_err(|e| AgentError::aws(format!("DescribeTargetHealth failed: {e}")))?;
        Ok(output.target_health_descriptions().to_vec())
    }

    async fn fetch_all_target_groups(&self) -> Result<Vec<TargetGroup>> {
        let mut groups = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .elb
                .describe_target_groups()
                .page_size(TARGET_GROUP_PAGE_SIZE)
                .set_marker(marker)
                .send()
                .await
                .map_err(|e| AgentError::aws(format!("DescribeTargetGroups failed: {e}")))?;
            groups.extend(output.target_groups().iter().cloned());
            marker = output.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }
        Ok(groups)
    }

    /// Fast path: the orchestrator knows which load balancer a service owns.
    async fn load_balancer_from_service(
        &self,
        service_name: &str,
        cluster_name: &str,
    ) -> Result<(LoadBalancer, TargetGroup)> {
        let output = self
            .ecs
            .describe_services()
            .cluster(cluster_name)
            .services(service_name)
            .send()
            .await
            .map_err(|e| AgentError::aws(format!("DescribeServices failed: {e}")))?;
        let tg_arn = output
            .services()
            .first()
            .and_then(|s| s.load_balancers().first())
            .and_then(|lb| lb.target_group_arn())
            .ok_or_else(|| {
                AgentError::NoLoadBalancer(format!(
                    "load balancer not found, it possibly doesn't exist for service {service_name}"
                ))
            })?
            .to_string();

        let tg_output = self
            .elb
            .describe_target_groups()
            .target_group_arns(&tg_arn)
            .send()
            .await
            .map_err(|e| AgentError::aws(format!("DescribeTargetGroups failed: {e}")))?;
        let target_group = tg_output
            .target_groups()
            .first()
            .cloned()
            .ok_or_else(|| AgentError::aws(format!("target group {tg_arn} not found")))?;

        let lb_output = self
            .elb
            .describe_load_balancers()
            .set_load_balancer_arns(Some(target_group.load_balancer_arns().to_vec()))
            .send()
            .await
            .map_err(|e| AgentError::aws(format!("DescribeLoadBalancers failed: {e}")))?;
        let load_balancer = lb_output
            .load_balancers()
            .first()
            .cloned()
            .ok_or_else(|| AgentError::aws("load balancer for target group not found"))?;

        Ok((load_balancer, target_group))
    }

    /// Identify the ECS service owning a task.
    ///
    /// ECS doesn't label containers with their service, so this walks the
    /// cluster's services and matches on the task-definition ARN. Exactly one
    /// match is definite; zero or several degrade to the slow path.
    async fn lookup_service_name(&self, cluster_name: &str, task_arn: &str) -> Option<String> {
        debug!(cluster = %cluster_name, task = %task_arn, "looking up service for task");

        let tasks = match self
            .ecs
            .describe_tasks()
            .cluster(cluster_name)
            .tasks(task_arn)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "DescribeTasks failed");
                return None;
            }
        };
        let task_definition = tasks.tasks().first().and_then(|t| t.task_definition_arn())?.to_string();
        debug!(task_definition = %task_definition, "task definition identified");

        let mut service_arns: Vec<String> = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page = match self
                .ecs
                .list_services()
                .cluster(cluster_name)
                .set_next_token(next_token)
                .send()
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "ListServices failed");
                    return None;
                }
            };
            service_arns.extend(page.service_arns().iter().cloned());
            next_token = page.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        let mut matches = Vec::new();
        for chunk in service_arns.chunks(DESCRIBE_SERVICES_CHUNK) {
            let described = match self
                .ecs
                .describe_services()
                .cluster(cluster_name)
                .set_services(Some(chunk.to_vec()))
                .send()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, "DescribeServices failed");
                    return None;
                }
            };
            for service in described.services() {
                if service.task_definition() == Some(task_definition.as_str()) {
                    if let Some(name) = service.service_name() {
                        matches.push(name.to_string());
                    }
                }
            }
        }

        match matches.len() {
            1 => matches.pop(),
            0 => {
                debug!("service could not be identified");
                None
            }
            n => {
                warn!(
                    count = n,
                    "several services share the task definition, degrading to target group scan"
                );
                None
            }
        }
    }

    /// Rewrite a registration record to point at the container's load
    /// balancer. Returns `None` when no load balancer data is available yet.
    pub async fn mutate_registration_info(
        &self,
        service: &Service,
        registration: &RegistryInstance,
    ) -> Option<RegistryInstance> {
        let mut reg = registration.clone();
        let container_id = service.origin.container_id.as_str();

        let elb_metadata = if let Some((hostname, port, target_group)) = explicit_override(service)
        {
            info!(
                hostname = %hostname,
                port = port,
                target_group = %target_group,
                "found explicit ELBv2 endpoint options, using these"
            );
            reg.port = i32::from(port);
            reg.hostname = hostname.clone();
            reg.ip_addr.clear();
            reg.vip_address.clear();
            let info = LoadBalancerRegistrationInfo {
                elb_endpoint: format!("{hostname}_{port}"),
                dns_name: hostname,
                port: i32::from(port),
                target_group_arn: target_group,
                ip_address: String::new(),
                vip_address: String::new(),
            };
            // Cache under the container so status checks can find the
            // target group later
            self.cache
                .insert(&format!("container_{container_id}"), info.clone(), Ttl::NoExpiry)
                .await;
            info
        } else {
            let lookup = LookupValues {
                instance_id: self.instance_id.clone(),
                port: reg.port,
                cluster_name: service
                    .attrs
                    .get("com.amazonaws.ecs.cluster")
                    .cloned()
                    .unwrap_or_default(),
                task_arn: service
                    .attrs
                    .get("com.amazonaws.ecs.task-arn")
                    .cloned()
                    .unwrap_or_default(),
                service_name: service
                    .attrs
                    .get("com.amazonaws.ecs.service-name")
                    .cloned()
                    .unwrap_or_default(),
            };
            match self.lb_for_container(container_id, lookup).await {
                Ok(info) => {
                    reg.port = info.port;
                    reg.ip_addr.clear();
                    reg.hostname = info.dns_name.clone();
                    (*info).clone()
                }
                Err(e) => {
                    error!(
                        service = %service.name,
                        instance = %self.instance_id,
                        error = %e,
                        "unable to find associated ELBv2 for service"
                    );
                    return None;
                }
            }
        };

        if check_elb_only_reg(service) {
            // An LB-only registration must not leak container identity
            reg.datacenter.instance_id = unique_id(&reg);
            reg.datacenter.public_hostname = reg.hostname.clone();
            reg.datacenter.hostname = reg.hostname.clone();
            reg.set_metadata("container-id", "");
            reg.set_metadata("container-name", "");
            reg.set_metadata("aws-instance-id", "");
        }

        reg.lease_duration_secs = LB_LEASE_SECONDS;
        reg.set_metadata("has-elbv2", "true");
        reg.set_metadata("elbv2-endpoint", &elb_metadata.elb_endpoint);
        reg.vip_address = reg.ip_addr.clone();
        Some(reg)
    }

    /// Register a service through its load balancer.
    ///
    /// Target group membership takes a while to propagate after a container
    /// starts, so a missing lookup result is retried a few times with
    /// increasing, jittered backoff before the cycle gives up.
    pub async fn register_with_lb(
        &self,
        service: &Service,
        registration: &RegistryInstance,
        client: &dyn LbRegistry,
    ) -> Result<()> {
        if !check_elb_flags(service) {
            return Err(AgentError::aws(format!(
                "ELBv2 flags are not set for: {}",
                unique_id(registration)
            )));
        }
        info!(id = %unique_id(registration), "found ELBv2 flags, will attempt to register LB");

        if let Some(mut reg) = self.mutate_registration_info(service, registration).await {
            self.test_health(service, client, &mut reg).await;
            return client.reregister(&reg).await;
        }

        for attempt in 1..4u32 {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..LOOKUP_JITTER_MS));
            let period = jitter
                + Duration::from_secs(5)
                + self.cache.default_ttl() * attempt;
            info!(attempt, wait = ?period, "retrying retrieval of ELBv2 data");
            tokio::time::sleep(period).await;
            if let Some(mut reg) = self.mutate_registration_info(service, registration).await {
                self.test_health(service, client, &mut reg).await;
                return client.reregister(&reg).await;
            }
        }
        Err(AgentError::aws(format!(
            "unable to register ELBv2: {}",
            unique_id(registration)
        )))
    }

    /// Heartbeat an LB registration, re-verifying health until it is UP.
    pub async fn heartbeat_lb(
        &self,
        service: &Service,
        registration: &RegistryInstance,
        client: &dyn LbRegistry,
    ) -> Result<()> {
        if check_elb_flags(service) {
            debug!(id = %unique_id(registration), "heartbeating ELBv2");
            if let Some(mut reg) = self.mutate_registration_info(service, registration).await {
                let result = client.heartbeat(&reg).await;
                let container_id = service.origin.container_id.as_str();
                if self.tracker.get(container_id).await != InstanceStatus::Up {
                    self.test_health(service, client, &mut reg).await;
                    if let Err(e) = client.reregister(&reg).await {
                        error!(error = %e, "an error occurred when attempting to reregister LB");
                        return Err(e);
                    }
                }
                return result;
            }
        }
        Err(AgentError::aws(format!(
            "unable to heartbeat ELBv2: {}",
            unique_id(registration)
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use aws_config::{BehaviorVersion, Region};
    use portside_core::ServicePort;
    use std::sync::Mutex as StdMutex;

    pub(crate) async fn test_subsystem(refresh_interval: i64) -> ElbSubsystem {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .no_credentials()
            .load()
            .await;
        ElbSubsystem::new(
            &sdk_config,
            Arc::new(TtlCache::new()),
            "instance-123".to_string(),
            refresh_interval,
        )
    }

    /// Seed the per-container LB cache the way a prior lookup would have.
    pub(crate) async fn seed_lb_cache(
        subsystem: &ElbSubsystem,
        container_id: &str,
        dns_name: &str,
        lb_port: i32,
        tg_arn: &str,
    ) {
        let info = LoadBalancerRegistrationInfo {
            dns_name: dns_name.to_string(),
            port: lb_port,
            target_group_arn: tg_arn.to_string(),
            elb_endpoint: format!("{dns_name}_{lb_port}"),
            ip_address: String::new(),
            vip_address: String::new(),
        };
        subsystem
            .cache
            .insert(&format!("container_{container_id}"), info, Ttl::NoExpiry)
            .await;
    }

    /// Seed the healthy-target cache for a target group.
    pub(crate) async fn seed_target_cache(
        subsystem: &ElbSubsystem,
        tg_arn: &str,
        targets: Vec<TargetHealthDescription>,
    ) {
        subsystem
            .cache
            .insert(&format!("tg_arn_{tg_arn}"), targets, Ttl::NoExpiry)
            .await;
    }

    pub(crate) fn healthy_target() -> TargetHealthDescription {
        TargetHealthDescription::builder()
            .health_check_port("80")
            .build()
    }

    pub(crate) fn lb_service(container_id: &str, attrs: &[(&str, &str)]) -> Service {
        Service {
            name: "app".to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            origin: ServicePort {
                container_id: container_id.to_string(),
                ..ServicePort::default()
            },
            ..Service::default()
        }
    }

    pub(crate) fn registration_template() -> RegistryInstance {
        RegistryInstance {
            app: "app".to_string(),
            hostname: "hostname_identifier".to_string(),
            ip_addr: "4.3.2.1".to_string(),
            vip_address: "4.3.2.1".to_string(),
            port: 5001,
            status: InstanceStatus::Up,
            lease_duration_secs: 0,
            metadata: HashMap::new(),
            datacenter: DataCenterInfo {
                name: "Amazon".to_string(),
                instance_id: "i-should-be-changed".to_string(),
                public_hostname: "i-should-be-changed".to_string(),
                hostname: "i-should-be-changed".to_string(),
            },
        }
    }

    /// LbRegistry that records calls and serves a canned status.
    pub(crate) struct FakeLbRegistry {
        pub status: StdMutex<InstanceStatus>,
        pub calls: StdMutex<Vec<String>>,
    }

    impl FakeLbRegistry {
        pub fn with_status(status: InstanceStatus) -> Self {
            Self {
                status: StdMutex::new(status),
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LbRegistry for FakeLbRegistry {
        async fn instance_status(&self, _app: &str, _unique_id: &str) -> Result<InstanceStatus> {
            Ok(*self.status.lock().unwrap())
        }

        async fn reregister(&self, instance: &RegistryInstance) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("reregister:{}:{}", unique_id(instance), instance.status));
            Ok(())
        }

        async fn heartbeat(&self, instance: &RegistryInstance) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("heartbeat:{}", unique_id(instance)));
            Ok(())
        }
    }

    #[test]
    fn elb_only_reg_defaults_to_true() {
        let set_false = lb_service("c1", &[("eureka_elbv2_only_registration", "false")]);
        let set_true = lb_service("c1", &[("eureka_elbv2_only_registration", "true")]);
        let unset = lb_service("c1", &[]);

        assert!(!check_elb_only_reg(&set_false));
        assert!(check_elb_only_reg(&set_true));
        assert!(check_elb_only_reg(&unset));
    }

    #[test]
    fn elb_flags_matrix() {
        let cases: Vec<(&str, Vec<(&str, &str)>, bool)> = vec![
            (
                "lookup set to false",
                vec![
                    ("eureka_lookup_elbv2_endpoint", "false"),
                    ("eureka_datacenterinfo_name", "AMAZON"),
                ],
                false,
            ),
            (
                "datacenter is self-declared",
                vec![
                    ("eureka_lookup_elbv2_endpoint", "true"),
                    ("eureka_datacenterinfo_name", "MyOwn"),
                ],
                false,
            ),
            (
                "hostname but no port",
                vec![
                    ("eureka_elbv2_hostname", "my-name"),
                    ("eureka_datacenterinfo_name", "AMAZON"),
                ],
                false,
            ),
            (
                "hostname and port but no target group",
                vec![
                    ("eureka_elbv2_hostname", "my-name"),
                    ("eureka_elbv2_port", "1234"),
                    ("eureka_datacenterinfo_name", "AMAZON"),
                ],
                false,
            ),
            (
                "lookup set to true",
                vec![
                    ("eureka_lookup_elbv2_endpoint", "true"),
                    ("eureka_datacenterinfo_name", "AMAZON"),
                ],
                true,
            ),
            (
                "explicit trio set",
                vec![
                    ("eureka_elbv2_hostname", "my-name"),
                    ("eureka_elbv2_port", "1234"),
                    ("eureka_elbv2_targetgroup", "arn:1234"),
                    ("eureka_datacenterinfo_name", "AMAZON"),
                ],
                true,
            ),
            (
                "explicit trio and lookup both set",
                vec![
                    ("eureka_elbv2_hostname", "my-name"),
                    ("eureka_lookup_elbv2_endpoint", "true"),
                    ("eureka_elbv2_port", "1234"),
                    ("eureka_elbv2_targetgroup", "arn:1234"),
                    ("eureka_datacenterinfo_name", "AMAZON"),
                ],
                true,
            ),
            (
                "explicit trio set, lookup false",
                vec![
                    ("eureka_elbv2_hostname", "my-name"),
                    ("eureka_lookup_elbv2_endpoint", "false"),
                    ("eureka_elbv2_port", "1234"),
                    ("eureka_elbv2_targetgroup", "arn:1234"),
                    ("eureka_datacenterinfo_name", "AMAZON"),
                ],
                true,
            ),
        ];
        for (name, attrs, want) in cases {
            let service = lb_service("c1", &attrs);
            assert_eq!(check_elb_flags(&service), want, "case: {name}");
        }
    }

    #[test]
    fn unique_id_joins_hostname_and_port() {
        let mut instance = registration_template();
        instance.hostname = "lb.example.com".to_string();
        instance.port = 443;
        assert_eq!(unique_id(&instance), "lb.example.com_443");
    }

    #[tokio::test]
    async fn slow_path_scan_resolves_from_seeded_caches() {
        use aws_sdk_elasticloadbalancingv2::types::{
            Action, ActionTypeEnum, TargetDescription, TargetHealth, TargetHealthStateEnum,
        };

        let subsystem = test_subsystem(0).await.with_lookup_jitter(Duration::ZERO);
        let tg_arn = "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/web/abc";
        let lb_arn = "arn:aws:elasticloadbalancing:us-east-1:1:loadbalancer/app/web/def";

        let groups = vec![
            TargetGroup::builder()
                .target_group_arn("arn:other")
                .load_balancer_arns("arn:lb-other")
                .build(),
            TargetGroup::builder()
                .target_group_arn(tg_arn)
                .load_balancer_arns(lb_arn)
                .build(),
        ];
        subsystem
            .cache
            .insert("tg", groups, crate::cache::Ttl::NoExpiry)
            .await;
        subsystem
            .cache
            .insert(
                "tg_targets_arn:other",
                Vec::<TargetHealthDescription>::new(),
                crate::cache::Ttl::NoExpiry,
            )
            .await;
        let matching = TargetHealthDescription::builder()
            .target(
                TargetDescription::builder()
                    .id("instance-123")
                    .port(1234)
                    .build(),
            )
            .target_health(
                TargetHealth::builder()
                    .state(TargetHealthStateEnum::Healthy)
                    .build(),
            )
            .build();
        subsystem
            .cache
            .insert(
                &format!("tg_targets_{tg_arn}"),
                vec![matching],
                crate::cache::Ttl::NoExpiry,
            )
            .await;

        let listeners = vec![
            Listener::builder()
                .port(80)
                .default_actions(
                    Action::builder()
                        .r#type(ActionTypeEnum::Forward)
                        .target_group_arn("arn:other")
                        .build(),
                )
                .build(),
            Listener::builder()
                .listener_arn("arn:listener")
                .port(8443)
                .default_actions(
                    Action::builder()
                        .r#type(ActionTypeEnum::Forward)
                        .target_group_arn(tg_arn)
                        .build(),
                )
                .build(),
        ];
        subsystem
            .cache
            .insert(&format!("lsnr_{lb_arn}"), listeners, crate::cache::Ttl::NoExpiry)
            .await;
        subsystem
            .cache
            .insert(
                &format!("lb_{lb_arn}"),
                vec![LoadBalancer::builder()
                    .dns_name("web-alb.example.com")
                    .load_balancer_arn(lb_arn)
                    .build()],
                crate::cache::Ttl::NoExpiry,
            )
            .await;

        let lookup = LookupValues {
            instance_id: "instance-123".to_string(),
            port: 1234,
            ..LookupValues::default()
        };
        let info = subsystem.lb_for_container("c0ffee", lookup).await.unwrap();

        assert_eq!(info.dns_name, "web-alb.example.com");
        assert_eq!(info.port, 8443);
        assert_eq!(info.target_group_arn, tg_arn);
        assert_eq!(info.elb_endpoint, "web-alb.example.com_8443");

        // The result is now pinned for this container
        let pinned = subsystem
            .cache
            .get::<LoadBalancerRegistrationInfo>("container_c0ffee")
            .await
            .unwrap();
        assert_eq!(*pinned, *info);
    }

    #[tokio::test]
    async fn slow_path_failure_is_not_cached() {
        let subsystem = test_subsystem(0).await.with_lookup_jitter(Duration::ZERO);
        subsystem
            .cache
            .insert(
                "tg",
                vec![TargetGroup::builder()
                    .target_group_arn("arn:only")
                    .load_balancer_arns("arn:lb")
                    .build()],
                crate::cache::Ttl::NoExpiry,
            )
            .await;
        subsystem
            .cache
            .insert(
                "tg_targets_arn:only",
                Vec::<TargetHealthDescription>::new(),
                crate::cache::Ttl::NoExpiry,
            )
            .await;

        let lookup = LookupValues {
            instance_id: "i-1".to_string(),
            port: 80,
            ..LookupValues::default()
        };
        let err = subsystem
            .lb_for_container("c1", lookup)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Aws(_)));
        assert!(subsystem
            .cache
            .get::<LoadBalancerRegistrationInfo>("container_c1")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn lookup_returns_cached_value_without_network() {
        let subsystem = test_subsystem(0).await;
        seed_lb_cache(&subsystem, "123123412", "my-lb", 12345, "arn:1234").await;

        let info = subsystem
            .lb_for_container("123123412", LookupValues::default())
            .await
            .unwrap();

        assert_eq!(info.dns_name, "my-lb");
        assert_eq!(info.port, 12345);
        assert_eq!(info.target_group_arn, "arn:1234");
    }

    #[tokio::test]
    async fn mutate_uses_cached_lookup_data() {
        let subsystem = test_subsystem(0).await;
        seed_lb_cache(&subsystem, "123123412", "correct-lb-dnsname", 9001, "arn:1234").await;

        let service = lb_service(
            "123123412",
            &[
                ("eureka_lookup_elbv2_endpoint", "true"),
                ("eureka_datacenterinfo_name", "AMAZON"),
            ],
        );
        let got = subsystem
            .mutate_registration_info(&service, &registration_template())
            .await
            .unwrap();

        assert_eq!(got.hostname, "correct-lb-dnsname");
        assert_eq!(got.port, 9001);
        assert_eq!(got.ip_addr, "");
        assert_eq!(got.vip_address, "");
        assert_eq!(got.lease_duration_secs, LB_LEASE_SECONDS);
        assert_eq!(got.metadata.get("has-elbv2"), Some(&"true".to_string()));
        assert_eq!(
            got.metadata.get("elbv2-endpoint"),
            Some(&"correct-lb-dnsname_9001".to_string())
        );
        assert_eq!(got.datacenter.instance_id, "correct-lb-dnsname_9001");
        assert_eq!(got.datacenter.public_hostname, "correct-lb-dnsname");
        assert_eq!(got.status, InstanceStatus::Up);
    }

    #[tokio::test]
    async fn mutate_prefers_explicit_endpoint() {
        let subsystem = test_subsystem(0).await;
        // Cache data that must NOT win over the explicit endpoint
        seed_lb_cache(&subsystem, "123123412", "i-should-not-be-used", 666, "arn:1234").await;

        let service = lb_service(
            "123123412",
            &[
                ("eureka_lookup_elbv2_endpoint", "false"),
                ("eureka_elbv2_hostname", "hostname-i-set"),
                ("eureka_elbv2_port", "65535"),
                ("eureka_elbv2_targetgroup", "arn:1234"),
                ("eureka_datacenterinfo_name", "AMAZON"),
            ],
        );
        let got = subsystem
            .mutate_registration_info(&service, &registration_template())
            .await
            .unwrap();

        assert_eq!(got.hostname, "hostname-i-set");
        assert_eq!(got.port, 65535);
        assert_eq!(got.ip_addr, "");
        assert_eq!(got.vip_address, "");
        assert_eq!(got.lease_duration_secs, LB_LEASE_SECONDS);
        assert_eq!(
            got.metadata.get("elbv2-endpoint"),
            Some(&"hostname-i-set_65535".to_string())
        );
        assert_eq!(got.datacenter.instance_id, "hostname-i-set_65535");
    }

    #[tokio::test]
    async fn mutate_with_explicit_endpoint_caches_lb_data() {
        let subsystem = test_subsystem(0).await;
        let service = lb_service(
            "123123412",
            &[
                ("eureka_lookup_elbv2_endpoint", "false"),
                ("eureka_elbv2_hostname", "hostname-i-set"),
                ("eureka_elbv2_port", "65535"),
                ("eureka_elbv2_targetgroup", "arn:1234"),
                ("eureka_datacenterinfo_name", "AMAZON"),
            ],
        );

        let _ = subsystem
            .mutate_registration_info(&service, &registration_template())
            .await
            .unwrap();

        let cached = subsystem
            .cache
            .get::<LoadBalancerRegistrationInfo>("container_123123412")
            .await
            .expect("value not in cache");
        assert_eq!(
            *cached,
            LoadBalancerRegistrationInfo {
                dns_name: "hostname-i-set".to_string(),
                port: 65535,
                target_group_arn: "arn:1234".to_string(),
                elb_endpoint: "hostname-i-set_65535".to_string(),
                ip_address: String::new(),
                vip_address: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn elb_only_registration_strips_container_identity() {
        let subsystem = test_subsystem(0).await;
        seed_lb_cache(&subsystem, "123123412", "correct-hostname", 12345, "arn:1234").await;

        let service = lb_service(
            "123123412",
            &[
                ("eureka_elbv2_only_registration", "true"),
                ("eureka_lookup_elbv2_endpoint", "false"),
                ("eureka_datacenterinfo_name", "AMAZON"),
            ],
        );
        let mut template = registration_template();
        template.metadata = HashMap::from([
            ("container-id".to_string(), "container-id-goes-here".to_string()),
            ("container-name".to_string(), "container-name-goes-here".to_string()),
            ("aws-instance-id".to_string(), "i-000d95143d83f4ab2".to_string()),
            ("branch".to_string(), "testingDeployment".to_string()),
        ]);

        let got = subsystem
            .mutate_registration_info(&service, &template)
            .await
            .unwrap();

        assert_eq!(got.metadata.get("container-id"), Some(&String::new()));
        assert_eq!(got.metadata.get("container-name"), Some(&String::new()));
        assert_eq!(got.metadata.get("aws-instance-id"), Some(&String::new()));
        // Unrelated metadata survives
        assert_eq!(got.metadata.get("branch"), Some(&"testingDeployment".to_string()));
        assert_eq!(got.metadata.get("has-elbv2"), Some(&"true".to_string()));
        assert_eq!(got.hostname, "correct-hostname");
        assert_eq!(got.port, 12345);
    }

    #[tokio::test]
    async fn register_with_lb_reregisters_with_gated_status() {
        let subsystem = test_subsystem(0).await;
        seed_lb_cache(&subsystem, "123123412", "my-lb", 9001, "arn:1234").await;
        seed_target_cache(&subsystem, "arn:1234", vec![healthy_target()]).await;

        let service = lb_service(
            "123123412",
            &[
                ("eureka_elbv2_only_registration", "false"),
                ("eureka_lookup_elbv2_endpoint", "true"),
                ("eureka_datacenterinfo_name", "AMAZON"),
            ],
        );
        let client = FakeLbRegistry::with_status(InstanceStatus::Unknown);

        subsystem
            .register_with_lb(&service, &registration_template(), &client)
            .await
            .unwrap();

        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["reregister:my-lb_9001:UP".to_string()]);
        assert_eq!(
            subsystem.tracker.get("123123412").await,
            InstanceStatus::Up
        );
    }

    #[tokio::test]
    async fn register_with_lb_requires_flags() {
        let subsystem = test_subsystem(0).await;
        let service = lb_service("123123412", &[]);
        let client = FakeLbRegistry::with_status(InstanceStatus::Unknown);

        let err = subsystem
            .register_with_lb(&service, &registration_template(), &client)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Aws(_)));
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_reverifies_health_until_up() {
        let subsystem = test_subsystem(0).await;
        seed_lb_cache(&subsystem, "123123412", "my-lb", 9001, "arn:1234").await;
        seed_target_cache(&subsystem, "arn:1234", vec![]).await;

        let service = lb_service(
            "123123412",
            &[
                ("eureka_lookup_elbv2_endpoint", "true"),
                ("eureka_datacenterinfo_name", "AMAZON"),
            ],
        );
        let client = FakeLbRegistry::with_status(InstanceStatus::Unknown);

        subsystem
            .heartbeat_lb(&service, &registration_template(), &client)
            .await
            .unwrap();

        let calls = client.calls.lock().unwrap().clone();
        // Not yet UP: heartbeat is followed by a reregister with STARTING
        assert_eq!(
            calls,
            vec![
                "heartbeat:my-lb_9001".to_string(),
                "reregister:my-lb_9001:STARTING".to_string(),
            ]
        );
    }
}
