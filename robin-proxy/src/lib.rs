//! Proxy supervisor for Robin.
//!
//! haproxy is an external black box; this crate only validates, atomically
//! swaps, and gracefully reloads its configuration via child-process
//! invocations. It never terminates traffic itself.

pub mod error;
pub mod supervisor;

pub use error::{Error, Result};
pub use supervisor::ProxySupervisor;
