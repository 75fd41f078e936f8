//! Health-gated registration status
//!
//! An LB-backed registration must not go UP before its target group has a
//! healthy target, and must never flap back once it has. The status machine
//! decides from three inputs: what the backend currently shows, what we
//! recorded last cycle, and the cached target-group health.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::RwLock;
use tracing::{debug, error, info};

use portside_core::Service;

use crate::cache::CacheRead;
use crate::elb::{unique_id, ElbSubsystem, LbRegistry, LoadBalancerRegistrationInfo, RegistryInstance};

/// Registration status of an LB-backed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceStatus {
    /// Serving traffic
    Up,
    /// Registered, waiting on a healthy target
    Starting,
    /// Nothing known yet
    #[default]
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Outcome of one status decision.
///
/// `new_status` is recorded as the next cycle's "previous"; `registration_status`
/// goes on the wire. They differ in the degraded case, which stays
/// re-checkable (`UNKNOWN`) while still publishing an honest not-ready state
/// (`STARTING`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// Recorded for the next decision
    pub new_status: InstanceStatus,
    /// Registered with the backend
    pub registration_status: InstanceStatus,
}

/// Last decided status per container, under its own lock.
pub struct StatusTracker {
    statuses: RwLock<HashMap<String, InstanceStatus>>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Last recorded status, `Unknown` for an unseen container
    pub async fn get(&self, container_id: &str) -> InstanceStatus {
        *self
            .statuses
            .read()
            .await
            .get(container_id)
            .unwrap_or(&InstanceStatus::Unknown)
    }

    /// Record the status for a container
    pub async fn set(&self, container_id: &str, status: InstanceStatus) {
        self.statuses
            .write()
            .await
            .insert(container_id.to_string(), status);
    }

    /// Forget a container entirely
    pub async fn forget(&self, container_id: &str) {
        self.statuses.write().await.remove(container_id);
    }
}

impl ElbSubsystem {
    /// Check backend status and target health, then gate the registration's
    /// status field accordingly. The tracker update and the wire status are
    /// decided together so they cannot diverge.
    pub async fn test_health(
        &self,
        service: &Service,
        client: &dyn LbRegistry,
        registration: &mut RegistryInstance,
    ) {
        let container_id = service.origin.container_id.as_str();

        let backend_status = match client
            .instance_status(&registration.app, &unique_id(registration))
            .await
        {
            Ok(status) => status,
            Err(e) => {
                debug!(error = %e, "LB not yet present, or error retrieving from backend");
                InstanceStatus::Unknown
            }
        };
        debug!(status = %backend_status, "backend status check");
        let last = self.tracker.get(container_id).await;

        let change = self
            .determine_new_status(container_id, backend_status, last)
            .await;
        self.tracker.set(container_id, change.new_status).await;
        registration.status = change.registration_status;
        debug!(
            previous = %last,
            registration = %registration.status,
            "status health check complete"
        );
    }

    /// The status decision rules.
    pub async fn determine_new_status(
        &self,
        container_id: &str,
        backend_status: InstanceStatus,
        input_status: InstanceStatus,
    ) -> StatusChange {
        // Nothing to do if the backend says we're up; once up, stay up
        if backend_status == InstanceStatus::Up || input_status == InstanceStatus::Up {
            return StatusChange {
                new_status: InstanceStatus::Up,
                registration_status: InstanceStatus::Up,
            };
        }

        debug!(previous = %input_status, "need to check for healthy targets");
        // The LB data should already be cached; a lookup from here would
        // block the refresh cycle
        let info = match self
            .cache
            .read::<LoadBalancerRegistrationInfo>(&format!("container_{container_id}"))
            .await
        {
            CacheRead::Hit(info) => info,
            CacheRead::WrongType => {
                error!("unable to convert LB data from cache, cannot check for healthy targets");
                return StatusChange {
                    new_status: InstanceStatus::Unknown,
                    registration_status: InstanceStatus::Starting,
                };
            }
            CacheRead::Miss => {
                error!("unable to retrieve LB data from cache, cannot check for healthy targets");
                return StatusChange {
                    new_status: InstanceStatus::Unknown,
                    registration_status: InstanceStatus::Starting,
                };
            }
        };

        debug!(target_group = %info.target_group_arn, "looking up healthy targets");
        let targets = match self.healthy_targets(&info.target_group_arn).await {
            Ok(targets) => targets,
            Err(e) => {
                error!(
                    target_group = %info.target_group_arn,
                    error = %e,
                    "error looking up healthy targets, will register as STARTING"
                );
                return StatusChange {
                    new_status: InstanceStatus::Unknown,
                    registration_status: InstanceStatus::Starting,
                };
            }
        };
        if targets.is_empty() {
            info!(
                target_group = %info.target_group_arn,
                "all targets unhealthy, registering as STARTING; normal for a service still starting up"
            );
            return StatusChange {
                new_status: InstanceStatus::Starting,
                registration_status: InstanceStatus::Starting,
            };
        }
        debug!(
            count = targets.len(),
            target_group = %info.target_group_arn,
            "found healthy targets, registering as UP"
        );
        StatusChange {
            new_status: InstanceStatus::Up,
            registration_status: InstanceStatus::Up,
        }
    }
}
