//! The watcher/applier pair and the reconcile pipeline they
//! drive.
//!
//! The two tasks share nothing but a change counter and a notification.
//! The same "two cooperating tasks, no shared mutable business state" shape
//! `AcmeManager::spawn_background_tasks` uses for its own cache-invalidation
//! watcher and renewal loop. `lastConfig` and the proxy's child PID are
//! owned exclusively by the applier; nothing
//! else in the process ever touches them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use robin_config::RenderOptions;
use robin_core::model::ServiceRegistration;
use robin_proxy::ProxySupervisor;
use robin_tls::AcmeManager;
use robin_topology::TopologySource;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Upper bound on how stale the applied configuration can be when nothing
/// wakes the applier directly bounds
/// latency independent of wakeups").
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// How long the watcher waits before retrying after `source.watch()`
/// returns an error, so a persistently failing source doesn't spin.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Drives the reconcile loop for the lifetime of the process.
pub struct Reconciler {
    source: Arc<dyn TopologySource>,
    acme: Option<Arc<AcmeManager>>,
    proxy: ProxySupervisor,
    options: RenderOptions,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn TopologySource>,
        acme: Option<Arc<AcmeManager>>,
        proxy: ProxySupervisor,
        options: RenderOptions,
    ) -> Self {
        Self { source, acme, proxy, options }
    }

    /// Spawns the watcher and applier tasks and runs the applier loop on
    /// the calling task. Never returns under normal operation.
    pub async fn run(self) {
        let counter = Arc::new(AtomicU64::new(0));
        let notify = Arc::new(Notify::new());

        tokio::spawn(watch_loop(self.source.clone(), counter.clone(), notify.clone()));

        self.apply_loop(counter, notify).await;
    }

    async fn apply_loop(self, counter: Arc<AtomicU64>, notify: Arc<Notify>) {
        let mut last_config: Option<String> = None;

        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = sleep(REFRESH_INTERVAL) => {}
            }

            // The counter itself only needs to be observed, not compared:
            // `reconcile_once` already no-ops when the rendered config is
            // unchanged, so a spurious wakeup (or the refresh timer firing
            // with nothing new) costs one cheap render, not a reload.
            let _ = counter.load(Ordering::Acquire);
            self.reconcile_once(&mut last_config).await;
        }
    }

    async fn reconcile_once(&self, last_config: &mut Option<String>) {
        let mut services = match self.source.services().await {
            Ok(services) => services,
            Err(err) => {
                error!(%err, "failed to list services from topology source");
                return;
            }
        };

        if let Some(acme) = &self.acme {
            services = acme.extend(services).await;
        }

        services.sort_by(|a, b| a.full_string().cmp(&b.full_string()));

        let config = match robin_config::render(&services, &self.options) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "failed to render proxy configuration, keeping previous config");
                return;
            }
        };

        if last_config.as_deref() == Some(config.as_str()) {
            return;
        }

        if let Err(err) = self.proxy.apply(&config).await {
            warn!(%err, "proxy rejected or failed to apply new configuration");
            return;
        }

        info!("applied new proxy configuration");
        *last_config = Some(config);

        if let Some(acme) = &self.acme {
            acme.set_used_domains(used_domains(&services)).await;
        }
    }
}

async fn watch_loop(source: Arc<dyn TopologySource>, counter: Arc<AtomicU64>, notify: Arc<Notify>) {
    loop {
        match source.watch().await {
            Ok(()) => {
                counter.fetch_add(1, Ordering::AcqRel);
                notify.notify_one();
            }
            Err(err) => {
                warn!(%err, "topology watch failed, re-arming after delay");
                sleep(WATCH_RETRY_DELAY).await;
            }
        }
    }
}

/// Every domain named by a public, domain-bearing selector. What the ACME
/// manager's renewal loop should keep alive.
fn used_domains(services: &[ServiceRegistration]) -> Vec<String> {
    let mut domains: Vec<String> = services
        .iter()
        .filter(|svc| svc.public)
        .flat_map(|svc| svc.selectors.iter())
        .map(|sel| sel.domain.clone())
        .filter(|domain| !domain.is_empty())
        .collect();
    domains.sort();
    domains.dedup();
    domains
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use robin_core::model::{ServiceInstance, ServiceSelector};
    use robin_tls::InMemoryKvStore;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify as TestNotify;

    struct FakeSource {
        services: StdMutex<Vec<ServiceRegistration>>,
        changed: Arc<TestNotify>,
    }

    #[async_trait]
    impl TopologySource for FakeSource {
        async fn services(&self) -> robin_topology::Result<Vec<ServiceRegistration>> {
            Ok(self.services.lock().unwrap().clone())
        }

        async fn watch(&self) -> robin_topology::Result<()> {
            self.changed.notified().await;
            Ok(())
        }
    }

    fn sample_registration() -> ServiceRegistration {
        ServiceRegistration {
            service_name: "web".into(),
            service_port: 8080,
            edge_port: 80,
            public: true,
            mode: Default::default(),
            instances: vec![ServiceInstance::new("10.0.0.1", 8080)],
            selectors: vec![ServiceSelector {
                domain: "example.com".into(),
                ..Default::default()
            }],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
        }
    }

    #[tokio::test]
    async fn reconcile_once_applies_and_skips_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("haproxy.cfg");
        let proxy = ProxySupervisor::new("true", &config_path);
        let source: Arc<dyn TopologySource> = Arc::new(FakeSource {
            services: StdMutex::new(vec![sample_registration()]),
            changed: Arc::new(TestNotify::new()),
        });

        let reconciler = Reconciler::new(source, None, proxy, RenderOptions::default());
        let mut last_config = None;
        reconciler.reconcile_once(&mut last_config).await;
        assert!(last_config.is_some());
        let first = last_config.clone();

        reconciler.reconcile_once(&mut last_config).await;
        assert_eq!(last_config, first);
    }

    #[tokio::test]
    async fn used_domains_dedupes_and_sorts() {
        let _ = Arc::new(InMemoryKvStore::new());
        let mut a = sample_registration();
        let mut b = sample_registration();
        b.selectors[0].domain = "a.example.com".into();
        a.selectors[0].domain = "b.example.com".into();
        a.selectors.push(ServiceSelector {
            domain: "a.example.com".into(),
            ..Default::default()
        });

        let domains = used_domains(&[a, b]);
        assert_eq!(domains, vec!["a.example.com".to_string(), "b.example.com".to_string()]);
    }
}
