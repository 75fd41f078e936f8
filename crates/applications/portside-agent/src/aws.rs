//! EC2 instance identity
//!
//! The load balancer subsystem matches targets by `(instance-id, port)`, so
//! the agent needs to know which instance it runs on. Queried once at
//! startup from the instance metadata endpoint (IMDSv2).

use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// EC2 instance metadata endpoint base URL
const METADATA_BASE: &str = "http://169.254.169.254";

/// Seconds an IMDSv2 session token stays valid
const TOKEN_TTL_SECS: &str = "60";

/// How long to wait for the metadata endpoint before concluding we are not
/// on EC2
const METADATA_TIMEOUT: Duration = Duration::from_secs(3);

/// This host's identity within AWS
#[derive(Debug, Clone, Default)]
pub struct AwsIdentity {
    /// EC2 instance id, e.g. `i-0abc123`
    pub instance_id: String,
    /// Region the instance runs in, e.g. `us-east-1`
    pub region: String,
}

/// Query instance identity from the metadata endpoint.
///
/// Fails fast when not running on EC2.
pub async fn load_identity() -> Result<AwsIdentity> {
    let client = reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()?;

    // IMDSv2: a session token gates every metadata read
    let token = client
        .put(format!("{METADATA_BASE}/latest/api/token"))
        .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECS)
        .send()
        .await?
        .text()
        .await?;

    let instance_id = client
        .get(format!("{METADATA_BASE}/latest/meta-data/instance-id"))
        .header("X-aws-ec2-metadata-token", &token)
        .send()
        .await?
        .text()
        .await?;

    let region = client
        .get(format!("{METADATA_BASE}/latest/meta-data/placement/region"))
        .header("X-aws-ec2-metadata-token", &token)
        .send()
        .await?
        .text()
        .await?;

    debug!(instance_id = %instance_id, region = %region, "resolved instance identity");
    Ok(AwsIdentity {
        instance_id,
        region,
    })
}
