//! The registry adapter plug-point
//!
//! Discovery backends implement `RegistryAdapter`; the agent works through
//! this interface ONLY - never concrete backend types. Factories are looked
//! up by the scheme of the registry URI given on the command line.

use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

use crate::error::CoreError;
use crate::types::Service;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Interface every discovery backend must implement.
#[async_trait]
pub trait RegistryAdapter: Send + Sync {
    /// Health probe used during agent startup
    async fn ping(&self) -> Result<()>;

    /// Create or update the record for one service
    async fn register(&self, service: &Service) -> Result<()>;

    /// Remove the record for one service
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Renew the lease for one service
    async fn refresh(&self, service: &Service) -> Result<()>;

    /// Enumerate every service the backend currently holds
    async fn services(&self) -> Result<Vec<Service>>;
}

/// Constructs an adapter for a parsed registry URI.
pub trait AdapterFactory: Send + Sync {
    /// Build an adapter instance for `uri`
    fn new_adapter(&self, uri: &Url) -> Arc<dyn RegistryAdapter>;
}
