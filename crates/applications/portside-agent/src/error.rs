//! Error types for the agent

use thiserror::Error;

/// Agent result type
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration error, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Docker API error
    #[error("Docker API error: {0}")]
    Docker(String),

    /// The container is gone from the daemon (already reaped)
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Registry adapter error
    #[error("registry error: {0}")]
    Registry(#[from] portside_core::CoreError),

    /// AWS API error
    #[error("AWS API error: {0}")]
    Aws(String),

    /// The orchestrator reports no load balancer for this service.
    /// Treated as "nothing to do", not a failure.
    #[error("no load balancer associated: {0}")]
    NoLoadBalancer(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// External IP lookup exhausted its retries
    #[error("ip lookup failed: {0}")]
    IpLookup(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Create a Docker API error
    pub fn docker(msg: impl Into<String>) -> Self {
        Self::Docker(msg.into())
    }

    /// Create an AWS API error
    pub fn aws(msg: impl Into<String>) -> Self {
        Self::Aws(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
