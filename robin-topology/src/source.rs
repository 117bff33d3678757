use async_trait::async_trait;
use robin_core::model::ServiceRegistration;

use crate::error::Result;

/// A topology source: something that can list the currently routable
/// services and notify the caller when that set might have changed.
///
/// Implemented by both the etcd-backed source and the Kubernetes-backed
/// source; the reconciler holds one as `Box<dyn TopologySource>` chosen at
/// startup by `--backend`.
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Returns the current, normalized, deduplicated, sorted list of
    /// service registrations. Mode defaults to `http` where unspecified.
    async fn services(&self) -> Result<Vec<ServiceRegistration>>;

    /// Blocks until the source believes something changed. Does not itself
    /// return the new state; the caller re-fetches via `services()`.
    async fn watch(&self) -> Result<()>;
}
