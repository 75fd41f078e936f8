//! Portside Core - Shared types and the registry plug-point
//!
//! This crate defines the abstractions shared between:
//! - portside-agent (the per-host registrator binary)
//! - registry adapter implementations (in-tree or external)
//!
//! Key types:
//! - RegistryAdapter trait (interface for discovery backends)
//! - Service / ServicePort / DeadContainer records
//! - Error types

pub mod error;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
