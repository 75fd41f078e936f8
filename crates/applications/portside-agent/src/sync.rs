//! Full reconciliation sweeps
//!
//! A single-consumer worker drains the bridge's sync channel so that two
//! sweeps (say, a periodic resync and an IP reallocation) can never
//! interleave. The worker holds the bridge lock for the duration of a sweep;
//! producers block on the channel while it is busy, which is the natural
//! backpressure against overlapping sweeps.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use portside_core::{RegistryAdapter, Service, SyncMessage};

use crate::bridge::{Bridge, BridgeState};
use crate::docker::short_id;

/// Matches ids this agent mints: `<hostname>:<container-name>:<port>[:udp]`
fn service_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+?):([A-Za-z0-9][A-Za-z0-9_.-]+):[0-9]+(?::udp)?$")
            .unwrap_or_else(|e| panic!("service id pattern failed to compile: {e}"))
    })
}

/// Worker loop. One per bridge; exits when the channel closes.
pub(crate) async fn run(bridge: Arc<Bridge>, mut sync_rx: mpsc::Receiver<SyncMessage>) {
    info!("sync worker started");
    while let Some(message) = sync_rx.recv().await {
        let mut state = bridge.lock_state().await;
        service_sync(&bridge, &mut state, &message).await;
    }
    error!("sync channel closed, worker exiting");
}

/// One full sweep across all containers.
pub(crate) async fn service_sync(bridge: &Arc<Bridge>, state: &mut BridgeState, message: &SyncMessage) {
    let quiet = message.quiet;
    let new_ip = message.ip.as_str();

    let containers = match bridge.docker.list_containers().await {
        Ok(containers) => containers,
        Err(e) if quiet => {
            error!(error = %e, "error listing containers, skipping sync");
            return;
        }
        Err(e) => {
            error!(error = %e, "error listing containers during startup sync");
            std::process::exit(1);
        }
    };

    debug!(count = containers.len(), "syncing services on containers");
    if !new_ip.is_empty() && bridge.config().host_ip != new_ip {
        info!(new_ip = %new_ip, "host IP differs from configured IP, reallocating");
    }

    // Reregistering a service the backend already has is assumed to be a
    // no-op on the backend side.
    for listing in &containers {
        match state.services.get_mut(&listing.id) {
            None => {
                debug!(
                    container_id = %short_id(&listing.id),
                    "unknown container, dispatching add"
                );
                let bridge = bridge.clone();
                let container_id = listing.id.clone();
                let ip = new_ip.to_string();
                tokio::spawn(async move {
                    bridge.add(&container_id, quiet, &ip).await;
                });
            }
            Some(services) => {
                for service in services.iter_mut() {
                    reregister_service(bridge.registry.as_ref(), service, new_ip).await;
                }
            }
        }
    }

    if !bridge.config().cleanup {
        return;
    }

    // Drop local entries whose container no longer exists in a live state
    debug!("listing non-exited containers");
    let active: HashSet<String> = match bridge.docker.list_active_containers().await {
        Ok(listings) => listings.into_iter().map(|l| l.id).collect(),
        Err(e) => {
            debug!(error = %e, "error listing non-exited containers, skipping cleanup");
            return;
        }
    };
    for container_id in state.services.keys() {
        if !active.contains(container_id) {
            debug!(
                container_id = %short_id(container_id),
                "stale: scheduling removal, container no longer exists"
            );
            let bridge = bridge.clone();
            let container_id = container_id.clone();
            tokio::spawn(async move {
                bridge.remove_on_exit(&container_id).await;
            });
        }
    }

    debug!("cleaning up dangling services");
    let external = match bridge.registry.services().await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "cleanup failed");
            return;
        }
    };
    cleanup_services(bridge, state, &external).await;
}

/// Re-register one service, moving it to `new_ip` first when reallocating.
pub(crate) async fn reregister_service(
    registry: &dyn RegistryAdapter,
    service: &mut Service,
    new_ip: &str,
) {
    if let Ok(repr) = serde_json::to_string(service) {
        debug!(service = %repr, "syncing service");
    }
    if !new_ip.is_empty() {
        if service.ip == new_ip {
            info!(service = %service.name, "service already on correct IP");
            return;
        }
        info!(service = %service.name, "service has IP difference, reallocating");
        if let Err(e) = registry.deregister(service).await {
            error!(service_id = %service.id, error = %e, "deregister during IP reallocation failed");
            return;
        }
        service.ip = new_ip.to_string();
        service.origin.host_ip = new_ip.to_string();
        if let Err(e) = registry.register(service).await {
            error!(service_id = %service.id, error = %e, "register during IP reallocation failed");
        }
        return;
    }
    if let Err(e) = registry.register(service).await {
        debug!(service_id = %service.id, error = %e, "sync register failed");
    }
}

/// Deregister backend records that parse as ours but have no local owner.
pub(crate) async fn cleanup_services(bridge: &Arc<Bridge>, state: &BridgeState, dangling: &[Service]) {
    'outer: for ext_service in dangling {
        let Some(captures) = service_id_pattern().captures(&ext_service.id) else {
            // There's no way this was registered by us, so leave it
            continue;
        };
        if &captures[1] != bridge.config().hostname {
            // Registered on a different host
            continue;
        }
        let container_name = &captures[2];
        for services in state.services.values() {
            for service in services {
                if service.name == ext_service.name
                    && service.origin.container_name == container_name
                {
                    continue 'outer;
                }
            }
        }
        debug!(service_id = %ext_service.id, "dangling service");
        match bridge.registry.deregister(ext_service).await {
            Ok(()) => info!(service_id = %ext_service.id, "dangling service removed"),
            Err(e) => {
                error!(service_id = %ext_service.id, error = %e, "deregister failed");
                continue;
            }
        }
    }
}
