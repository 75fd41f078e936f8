//! Error types shared with adapter implementations

use thiserror::Error;

/// Core error type for registry operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("bad registry uri: {0}")]
    BadUri(String),

    #[error("unrecognized registry adapter: {0}")]
    UnknownAdapter(String),

    #[error("registry operation failed: {0}")]
    Registry(String),

    #[error("internal error: {0}")]
    Internal(String),
}
