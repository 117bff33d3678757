//! The reconciler: two cooperating tasks, a watcher that
//! drives a change counter, and an applier that samples it and re-renders
//! the proxy configuration. Glued to the topology source, the ACME
//! manager, and the proxy supervisor built by the other crates.

pub mod reconciler;

pub use reconciler::Reconciler;
