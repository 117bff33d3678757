//! End-to-end: register a front-end record through the registry API layer,
//! join it against a discovered backend, render it, and hand the result to
//! the proxy supervisor — the full reconcile pipeline minus a live etcd or
//! haproxy, exercised the same way `robin-reconciler`'s own unit test does
//! but crossing the crate boundary the real binary crosses.

use std::sync::Arc;

use robin_api::FrontendRegistry;
use robin_config::RenderOptions;
use robin_core::model::{normalize, FrontendRecord, ServiceSelector};
use robin_proxy::ProxySupervisor;
use robin_tls::InMemoryKvStore;
use robin_topology::merge::merge;
use robin_topology::DiscoveredService;

#[tokio::test]
async fn registered_frontend_flows_through_to_a_rendered_config() {
    let kv = Arc::new(InMemoryKvStore::new());
    let registry = FrontendRegistry::new(kv.clone());

    let record = FrontendRecord {
        service: "web".into(),
        mode: Default::default(),
        selectors: vec![ServiceSelector {
            domain: "example.com".into(),
            ..Default::default()
        }],
        http_check_path: None,
        http_check_method: None,
        sticky: false,
        backup: false,
        edge_port: None,
    };

    assert!(registry.create("web", &record).await.unwrap());

    let frontends = registry.list().await.unwrap();
    assert_eq!(frontends.len(), 1);

    let mut discovered = DiscoveredService::new("web", 8080);
    discovered
        .instances
        .push(robin_core::model::ServiceInstance::new("10.0.0.5", 8080));

    let services = normalize(merge(&frontends, &[discovered]));
    assert_eq!(services.len(), 1);

    let config = robin_config::render(&services, &RenderOptions::default()).unwrap();
    assert!(config.contains("example.com"));
    assert!(config.contains("frontend"));

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("haproxy.cfg");
    let supervisor = ProxySupervisor::new("true", &config_path);
    supervisor.apply(&config).await.unwrap();

    let written = tokio::fs::read_to_string(&config_path).await.unwrap();
    assert_eq!(written, config);
}
