use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Node, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use robin_core::model::{normalize, FrontendRecord, Mode, ServiceInstance, ServiceRegistration, ServiceSelector};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::discovered::DiscoveredService;
use crate::error::{Error, Result};
use crate::merge::merge;
use crate::source::TopologySource;

/// The annotation that, when present on an Ingress, switches it from
/// "derive one registration per path rule" to "parse a JSON array of
/// FrontendRecord and run the same merge algorithm as the etcd source".
const FRONTEND_RECORDS_ANNOTATION: &str = "pulcy.com.robin.frontend.records";

/// Bounded buffer each resource kind's event pump feeds into (spec §5:
/// "one goroutine-equivalent per resource kind, each with a bounded
/// buffered channel (default 32)").
const EVENT_BUFFER: usize = 32;

/// Delay before a resource kind's event pump reconnects after its watch
/// stream errors out or closes.
const PUMP_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct KubernetesTopologySource {
    client: Client,
    /// Fed by the four per-resource-kind event pumps spawned at
    /// construction time (Node, Service, Endpoints, Ingress).
    events: AsyncMutex<mpsc::Receiver<()>>,
    /// Set by a pump when its bounded channel overflows, so the next
    /// `watch()` call returns immediately instead of waiting for a fresh
    /// event that may never individually arrive for the dropped one.
    resync: Arc<AtomicBool>,
}

impl KubernetesTopologySource {
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn new(client: Client) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let resync = Arc::new(AtomicBool::new(false));

        spawn_pump("node", Api::<Node>::all(client.clone()), tx.clone(), resync.clone());
        spawn_pump("service", Api::<Service>::all(client.clone()), tx.clone(), resync.clone());
        spawn_pump("endpoints", Api::<Endpoints>::all(client.clone()), tx.clone(), resync.clone());
        spawn_pump("ingress", Api::<Ingress>::all(client.clone()), tx, resync.clone());

        Self {
            client,
            events: AsyncMutex::new(rx),
            resync,
        }
    }

    async fn discovered_services(&self) -> Result<Vec<DiscoveredService>> {
        let services: Api<Service> = Api::all(self.client.clone());
        let endpoints: Api<Endpoints> = Api::all(self.client.clone());

        let services = services.list(&Default::default()).await?;
        let endpoints = endpoints.list(&Default::default()).await?;

        let mut by_name: BTreeMap<String, DiscoveredService> = BTreeMap::new();

        for svc in &services.items {
            let Some(meta_name) = svc.metadata.name.clone() else {
                continue;
            };
            let namespace = svc.metadata.namespace.clone().unwrap_or_default();
            let port = svc
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .map(|p| p.port as u16)
                .unwrap_or(0);

            let qualified = format!("{meta_name}.{namespace}");
            by_name.insert(meta_name.clone(), DiscoveredService::new(meta_name.clone(), port));
            by_name.insert(qualified.clone(), DiscoveredService::new(qualified, port));
        }

        for ep in &endpoints.items {
            let Some(name) = ep.metadata.name.clone() else {
                continue;
            };
            let namespace = ep.metadata.namespace.clone().unwrap_or_default();
            let mut instances = Vec::new();
            for subset in ep.subsets.iter().flatten() {
                let ports: Vec<u16> = subset
                    .ports
                    .iter()
                    .flatten()
                    .map(|p| p.port as u16)
                    .collect();
                let port = ports.first().copied().unwrap_or(0);
                for addr in subset.addresses.iter().flatten() {
                    instances.push(ServiceInstance::new(addr.ip.clone(), port));
                }
            }

            for key in [name.clone(), format!("{name}.{namespace}")] {
                if let Some(existing) = by_name.get_mut(&key) {
                    existing.instances = instances.clone();
                }
            }
        }

        Ok(by_name.into_values().filter(|s| !s.instances.is_empty()).collect())
    }

    /// Ingresses without the frontend-records annotation: one registration
    /// per host/path rule, `public=true`, `mode=http`.
    fn raw_ingress_registrations(
        ingress: &Ingress,
        discovered: &[DiscoveredService],
    ) -> Vec<ServiceRegistration> {
        let mut out = Vec::new();
        let Some(spec) = &ingress.spec else {
            return out;
        };
        for rule in spec.rules.iter().flatten() {
            let Some(host) = &rule.host else { continue };
            let Some(http) = &rule.http else { continue };
            for path in &http.paths {
                let Some(backend_service) = &path.backend.service else {
                    continue;
                };
                let Some(discovered_service) = discovered.iter().find(|d| d.name == backend_service.name) else {
                    continue;
                };
                let path_prefix = path.path.clone().unwrap_or_default();
                out.push(ServiceRegistration {
                    service_name: discovered_service.name.clone(),
                    service_port: discovered_service.port,
                    edge_port: 80,
                    public: true,
                    mode: Mode::Http,
                    instances: discovered_service.instances.clone(),
                    selectors: vec![ServiceSelector {
                        weight: 100,
                        domain: host.clone(),
                        path_prefix,
                        ssl_cert_name: None,
                        tmp_ssl_cert_path: None,
                        users: vec![],
                        rewrite_rules: vec![],
                        allow_unauthorized: false,
                        allow_insecure: false,
                        port: None,
                        private: false,
                    }],
                    http_check_path: None,
                    http_check_method: None,
                    sticky: false,
                    backup: false,
                });
            }
        }
        out
    }

    fn annotated_frontend_records(ingress: &Ingress) -> Option<Vec<(String, FrontendRecord)>> {
        let raw = ingress
            .metadata
            .annotations
            .as_ref()?
            .get(FRONTEND_RECORDS_ANNOTATION)?;
        match serde_json::from_str::<Vec<FrontendRecord>>(raw) {
            Ok(records) => Some(
                records
                    .into_iter()
                    .enumerate()
                    .map(|(i, r)| (format!("{}-{i}", ingress.metadata.name.clone().unwrap_or_default()), r))
                    .collect(),
            ),
            Err(err) => {
                warn!(%err, ingress = ?ingress.metadata.name, "failed to parse frontend-records annotation");
                None
            }
        }
    }
}

/// Spawns one long-running event pump for a single resource kind (Node,
/// Service, Endpoints, or Ingress). Each touched object sends `()` into the
/// shared bounded channel; when the channel is full the oldest event has
/// already been dropped by the receiver catching up, so this pump just
/// raises the divergence alarm and lets the next `watch()` call trigger a
/// full resync instead of blocking. The stream is recreated after any
/// error or close, after `PUMP_RETRY_DELAY`.
fn spawn_pump<K>(kind: &'static str, api: Api<K>, tx: mpsc::Sender<()>, resync: Arc<AtomicBool>)
where
    K: kube::Resource<DynamicType = ()> + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut stream = watcher(api.clone(), watcher::Config::default())
                .touched_objects()
                .boxed();

            loop {
                match stream.try_next().await {
                    Ok(Some(_)) => {
                        if tx.try_send(()).is_err() {
                            warn!(kind, "event pump overflowed its bounded channel, scheduling full resync");
                            resync.store(true, Ordering::SeqCst);
                        }
                    }
                    Ok(None) => {
                        warn!(kind, "watch stream closed, reconnecting");
                        break;
                    }
                    Err(err) => {
                        warn!(kind, %err, "watch stream error, reconnecting");
                        break;
                    }
                }
            }

            tokio::time::sleep(PUMP_RETRY_DELAY).await;
        }
    });
}

#[async_trait::async_trait]
impl TopologySource for KubernetesTopologySource {
    async fn services(&self) -> Result<Vec<ServiceRegistration>> {
        let discovered = self.discovered_services().await?;

        let ingresses: Api<Ingress> = Api::all(self.client.clone());
        let ingresses = ingresses.list(&Default::default()).await?;

        let mut registrations = Vec::new();
        for ingress in &ingresses.items {
            if let Some(frontends) = Self::annotated_frontend_records(ingress) {
                registrations.extend(merge(&frontends, &discovered));
            } else {
                registrations.extend(Self::raw_ingress_registrations(ingress, &discovered));
            }
        }

        debug!(count = registrations.len(), "merged kubernetes topology");
        Ok(normalize(registrations))
    }

    async fn watch(&self) -> Result<()> {
        if self.resync.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        match self.events.lock().await.recv().await {
            Some(()) => Ok(()),
            None => Err(Error::WatchClosed),
        }
    }
}
