//! Robin core data model
//!
//! Shared types for the edge load-balancer control plane: the service
//! registration/selector/front-end model, validation, deterministic
//! ordering, and the runtime configuration flag surface. Every other
//! Robin crate depends on this one instead of redeclaring these shapes.

pub mod config;
pub mod error;
pub mod model;

pub use error::{Error, Result};

/// Robin version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
