//! Topology sources for Robin: etcd and Kubernetes backends that both
//! resolve to a single `Box<dyn TopologySource>` the reconciler consumes.

pub mod discovered;
pub mod error;
pub mod etcd_source;
pub mod kube_source;
pub mod merge;
pub mod source;

pub use discovered::DiscoveredService;
pub use error::{Error, Result};
pub use etcd_source::EtcdTopologySource;
pub use kube_source::KubernetesTopologySource;
pub use source::TopologySource;
