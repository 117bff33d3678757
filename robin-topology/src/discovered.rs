use robin_core::model::ServiceInstance;

/// A backend discovered directly from the topology source, before it has
/// been joined against any front-end routing intent.
///
/// Etcd produces these from `<prefix>/service/<svc>/<instanceId>` keys;
/// Kubernetes produces them from `Service` + `Endpoints`/pod lookups. Both
/// sources hand a `Vec<DiscoveredService>` to [`crate::merge::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    pub port: u16,
    pub instances: Vec<ServiceInstance>,
}

impl DiscoveredService {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            instances: Vec::new(),
        }
    }

    /// `instanceId = "host:container:port"`. A service name suffix of
    /// `-N` (where the id's trailing component is numeric) designates a
    /// *virtual* service representing that one instance alone; callers
    /// split those into their own `DiscoveredService` before merging.
    pub fn parse_instance_id(id: &str) -> Option<(&str, &str, u16)> {
        let mut parts = id.splitn(3, ':');
        let host = parts.next()?;
        let container = parts.next()?;
        let port = parts.next()?.parse().ok()?;
        Some((host, container, port))
    }
}
