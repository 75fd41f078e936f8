//! External IP discovery
//!
//! Some deployments NAT the host behind an address only an external service
//! knows. The agent can poll such an endpoint and, when the address changes,
//! reallocate every registered service to the new IP via a sync sweep.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use portside_core::SyncMessage;

use crate::bridge::Bridge;
use crate::error::Result;

/// HTTP timeout for one lookup attempt
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the background poll
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Base wait between failed attempts, multiplied by the attempt number
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Fetches the body of the lookup endpoint. Swappable for tests.
#[async_trait]
pub trait IpLookupClient: Send + Sync {
    /// GET `url` and return the response body
    async fn fetch(&self, url: &str) -> Result<String>;
}

struct HttpLookupClient {
    client: reqwest::Client,
}

impl HttpLookupClient {
    fn new() -> Result<Self> {
        let client = reqwest::Client::builder().timeout(LOOKUP_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl IpLookupClient for HttpLookupClient {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        Ok(response.text().await?)
    }
}

/// Reads the host's public IP from a user-supplied HTTP endpoint.
pub struct ExternalIpSource {
    url: String,
    retries: u32,
    retry_interval: Duration,
    exit_on_failure: bool,
    client: Box<dyn IpLookupClient>,
}

impl ExternalIpSource {
    /// Create a source polling `url`, with up to `retries` attempts per
    /// lookup.
    pub fn new(url: impl Into<String>, retries: u32) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            retries,
            retry_interval: RETRY_INTERVAL,
            exit_on_failure: false,
            client: Box::new(HttpLookupClient::new()?),
        })
    }

    /// Terminate the process when a lookup exhausts its retries
    pub fn exit_on_failure(mut self, exit: bool) -> Self {
        self.exit_on_failure = exit;
        self
    }

    /// Override the wait between attempts
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Swap the HTTP client, for tests
    pub fn with_client(mut self, client: Box<dyn IpLookupClient>) -> Self {
        self.client = client;
        self
    }

    /// Whether lookup failure is configured to be fatal
    pub fn exits_on_failure(&self) -> bool {
        self.exit_on_failure
    }

    /// Resolve the current external IP.
    ///
    /// Returns `(ip, true)` on success and `("", false)` once every attempt
    /// has failed. The body must be an IPv4 dotted-quad.
    pub async fn lookup(&self) -> (String, bool) {
        let mut attempt = 1u32;
        while attempt <= self.retries {
            match self.client.fetch(&self.url).await {
                Ok(body) => {
                    let candidate = body.trim();
                    if candidate.parse::<Ipv4Addr>().is_ok() {
                        info!(ip = %candidate, "resolved external IP");
                        return (candidate.to_string(), true);
                    }
                    error!(
                        source = %self.url,
                        body = %candidate,
                        "external source returned something other than an IPv4 address"
                    );
                }
                Err(e) => {
                    error!(source = %self.url, error = %e, "external IP lookup failed");
                }
            }
            if attempt < self.retries {
                tokio::time::sleep(self.retry_interval * attempt).await;
            }
            attempt += 1;
        }
        error!("all retries used when getting ip from external source");
        (String::new(), false)
    }
}

/// Poll the external source and trigger a quiet reallocation sweep whenever
/// the address changes. Runs until the quit channel closes.
pub async fn run_poll_loop(
    source: ExternalIpSource,
    bridge: Arc<Bridge>,
    initial_ip: String,
    mut quit: broadcast::Receiver<()>,
) {
    let mut last_ip = initial_ip;
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (ip, ok) = source.lookup().await;
                if !ok {
                    if source.exit_on_failure {
                        error!("external IP lookup failed and exit-on-ip-lookup-failure is set");
                        std::process::exit(1);
                    }
                    debug!(last_ip = %last_ip, "keeping last known IP after failed lookup");
                    continue;
                }
                if ip != last_ip {
                    info!(old = %last_ip, new = %ip, "external IP changed, scheduling reallocation");
                    bridge
                        .push_sync(SyncMessage { quiet: true, ip: ip.clone() })
                        .await;
                    last_ip = ip;
                }
            }
            _ = quit.recv() => {
                debug!("quit received, exiting external IP poll loop");
                return;
            }
        }
    }
}
