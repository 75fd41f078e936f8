//! Portside - host-level service registrator
//!
//! Watches Docker container lifecycle events and keeps a service-discovery
//! backend in sync with the services running on this host.
//!
//! ## Usage
//!
//! ```bash
//! # Dry-run against the console backend
//! portside --ip 10.0.0.5 --cleanup log://console
//!
//! # Lease-based registration with a 30s TTL refreshed every 10s
//! portside --ttl 30 --ttl-refresh 10 --resync 600 log://console
//!
//! # Route ALB-fronted containers through load balancer resolution
//! portside --ttl 30 --ttl-refresh 10 elb-log://console
//! ```

use std::sync::Arc;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use clap::Parser;
use futures::{FutureExt, StreamExt};
use regex::Regex;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portside_agent::{
    aws, builtin_registry, run_poll_loop, Bridge, Config, ContainerEventKind, ContainerRuntime,
    DeregisterPolicy, DockerRuntime, ElbLogAdapterFactory, ElbSubsystem, ExternalIpSource,
    TtlCache,
};
use portside_core::SyncMessage;

// AssertUnwindSafe for the top-level panic guard
use std::panic::AssertUnwindSafe;

#[derive(Parser, Debug)]
#[command(name = "portside")]
#[command(version)]
#[command(about = "Service registrator bridging local containers to a discovery backend", long_about = None)]
struct Cli {
    /// Registry URI; the scheme selects the backend adapter (e.g. log://console)
    registry_uri: String,

    /// IP for ports mapped to the host
    #[arg(long, default_value = "")]
    ip: String,

    /// Use internal ports instead of published ones
    #[arg(long)]
    internal: bool,

    /// Use IP which is stored in a label assigned to the container
    #[arg(long = "useIpFromLabel", default_value = "")]
    use_ip_from_label: String,

    /// Frequency with which service TTLs are refreshed (seconds)
    #[arg(long = "ttl-refresh", default_value_t = 0)]
    ttl_refresh: i64,

    /// TTL for services (default is no expiry)
    #[arg(long, default_value_t = 0)]
    ttl: i64,

    /// Append tags for all registered services
    #[arg(long, default_value = "")]
    tags: String,

    /// Frequency with which services are resynchronized (seconds)
    #[arg(long, default_value_t = 0)]
    resync: i64,

    /// Deregister exited services "always" or "on-success"
    #[arg(long, default_value = "always")]
    deregister: String,

    /// Max retry attempts to establish a connection with the backend, -1 for infinite
    #[arg(long = "retry-attempts", default_value_t = 0)]
    retry_attempts: i64,

    /// Interval (in millisecond) between retry-attempts
    #[arg(long = "retry-interval", default_value_t = 2000)]
    retry_interval: i64,

    /// Remove dangling services
    #[arg(long)]
    cleanup: bool,

    /// Only register containers which have the SERVICE_REGISTER label
    #[arg(long = "require-label")]
    require_label: bool,

    /// URL to GET the host IP from
    #[arg(long = "ip-lookup-source", default_value = "")]
    ip_lookup_source: String,

    /// Lookup attempts before giving up on the external IP source
    #[arg(long = "ip-lookup-retries", default_value_t = 1)]
    ip_lookup_retries: u32,

    /// Exit when the external IP source stays unreachable
    #[arg(long = "exit-on-ip-lookup-failure")]
    exit_on_ip_lookup_failure: bool,
}

fn ipv4_pattern() -> Regex {
    Regex::new(
        r"^(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$",
    )
    .unwrap_or_else(|e| panic!("ipv4 pattern failed to compile: {e}"))
}

/// Cross-field validation clap cannot express. Failures exit 2.
fn validate(cli: &Cli) -> Result<(), String> {
    if !cli.ip.is_empty() && !ipv4_pattern().is_match(&cli.ip) {
        return Err(format!(
            "Invalid IP address '{}', please use a valid address.",
            cli.ip
        ));
    }
    if (cli.ttl == 0 && cli.ttl_refresh > 0) || (cli.ttl > 0 && cli.ttl_refresh == 0) {
        return Err("--ttl and --ttl-refresh must be specified together or not at all".to_string());
    }
    if cli.ttl < 0 || cli.ttl_refresh < 0 {
        return Err("--ttl and --ttl-refresh must not be negative".to_string());
    }
    if cli.ttl > 0 && cli.ttl <= cli.ttl_refresh {
        return Err("--ttl must be greater than --ttl-refresh".to_string());
    }
    if cli.retry_interval <= 0 {
        return Err("--retry-interval must be greater than 0".to_string());
    }
    cli.deregister
        .parse::<DeregisterPolicy>()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portside=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(message) = validate(&cli) {
        eprintln!("{message}");
        eprintln!("Run with --help for usage.");
        std::process::exit(2);
    }

    // Unwound panics must not leave the process half-alive with tickers
    // still running
    match AssertUnwindSafe(run(cli)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(panic = %message, "panic occurred, shutting down");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting portside");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();

    // Resolve the initial host IP from the external source, when configured
    let mut host_ip = cli.ip.clone();
    let mut ip_source = None;
    if !cli.ip_lookup_source.is_empty() {
        let source = ExternalIpSource::new(&cli.ip_lookup_source, cli.ip_lookup_retries)?
            .exit_on_failure(cli.exit_on_ip_lookup_failure);
        let (ip, ok) = source.lookup().await;
        if ok {
            info!(ip = %ip, "deferring to external source for host IP");
            host_ip = ip;
        } else if source.exits_on_failure() {
            anyhow::bail!(
                "could not resolve initial host IP from {}",
                cli.ip_lookup_source
            );
        } else {
            warn!("external IP lookup failed, keeping configured IP");
        }
        ip_source = Some(source);
    }

    if cli.require_label {
        info!("SERVICE_REGISTER label is required to register containers");
    }

    let docker = Arc::new(DockerRuntime::connect()?);

    let mut adapter_registry = builtin_registry();
    if cli.registry_uri.starts_with("elb-log:") {
        // The LB subsystem needs the instance identity and an AWS config;
        // only pay for that when the selected backend is LB-aware
        let identity = match aws::load_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "could not load instance identity (not running on EC2?)");
                aws::AwsIdentity::default()
            }
        };
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if !identity.region.is_empty() {
            loader = loader.region(Region::new(identity.region.clone()));
        }
        let sdk_config = loader.load().await;
        let subsystem = Arc::new(ElbSubsystem::new(
            &sdk_config,
            Arc::new(TtlCache::new()),
            identity.instance_id,
            cli.ttl_refresh,
        ));
        adapter_registry.register("elb-log", Box::new(ElbLogAdapterFactory::new(subsystem)));
    }
    let adapter = match adapter_registry.adapter_for(&cli.registry_uri) {
        Ok(adapter) => adapter,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    let config = Config {
        host_ip: host_ip.clone(),
        internal: cli.internal,
        use_ip_from_label: cli.use_ip_from_label.clone(),
        force_tags: cli.tags.clone(),
        refresh_ttl: cli.ttl,
        refresh_interval: cli.ttl_refresh,
        deregister_check: cli
            .deregister
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        cleanup: cli.cleanup,
        require_label: cli.require_label,
        hostname,
    };

    info!("creating bridge");
    let bridge = Bridge::start(
        docker.clone() as Arc<dyn ContainerRuntime>,
        adapter,
        config,
    );
    info!("bridge created");

    // Wait for the backend to become reachable
    let mut attempt: i64 = 0;
    loop {
        debug!(attempt, max = cli.retry_attempts, "connecting to backend");
        match bridge.ping().await {
            Ok(()) => break,
            Err(e) => {
                if cli.retry_attempts != -1 && attempt >= cli.retry_attempts {
                    anyhow::bail!("unable to reach registry backend: {e}");
                }
                tokio::time::sleep(Duration::from_millis(cli.retry_interval as u64)).await;
                attempt += 1;
            }
        }
    }

    // Subscribe before the initial sync so no event in between is lost
    let mut events = docker.event_stream();

    bridge
        .push_sync(SyncMessage {
            quiet: false,
            ip: String::new(),
        })
        .await;

    let (quit_tx, _) = broadcast::channel::<()>(1);

    if cli.ttl_refresh > 0 {
        let period = Duration::from_secs(cli.ttl_refresh as u64);

        // Dead-container pruning runs on its own ticker so refresh can work
        // independently
        let prune_bridge = bridge.clone();
        let mut prune_quit = quit_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => prune_bridge.prune_dead_containers().await,
                    _ = prune_quit.recv() => {
                        debug!("quit received, exiting prune loop");
                        return;
                    }
                }
            }
        });

        let refresh_bridge = bridge.clone();
        let mut refresh_quit = quit_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => refresh_bridge.refresh().await,
                    _ = refresh_quit.recv() => {
                        debug!("quit received, exiting refresh loop");
                        return;
                    }
                }
            }
        });
    }

    if cli.resync > 0 {
        let period = Duration::from_secs(cli.resync as u64);
        let resync_bridge = bridge.clone();
        let mut resync_quit = quit_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        resync_bridge
                            .push_sync(SyncMessage { quiet: true, ip: String::new() })
                            .await;
                    }
                    _ = resync_quit.recv() => {
                        debug!("quit received, exiting resync loop");
                        return;
                    }
                }
            }
        });
    }

    if let Some(source) = ip_source {
        tokio::spawn(run_poll_loop(
            source,
            bridge.clone(),
            host_ip.clone(),
            quit_tx.subscribe(),
        ));
    }

    // Main loop: drain container events, one task per event so a slow
    // inspect cannot stall the stream
    loop {
        tokio::select! {
            maybe_event = events.next() => {
                match maybe_event {
                    Some(event) => {
                        let bridge = bridge.clone();
                        match event.kind {
                            ContainerEventKind::Start => {
                                debug!(container_id = %event.container_id, "docker event received: start");
                                tokio::spawn(async move {
                                    bridge.add(&event.container_id, false, "").await;
                                });
                            }
                            ContainerEventKind::Die => {
                                debug!(container_id = %event.container_id, "docker event received: die");
                                tokio::spawn(async move {
                                    bridge.remove_on_exit(&event.container_id).await;
                                });
                            }
                        }
                    }
                    None => {
                        error!("docker event stream closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    let _ = quit_tx.send(());
    Ok(())
}
