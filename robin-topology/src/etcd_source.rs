use std::collections::BTreeMap;

use etcd_client::{Client, GetOptions, WatchOptions};
use robin_core::model::{normalize, FrontendRecord, ServiceInstance, ServiceRegistration};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::discovered::DiscoveredService;
use crate::error::{Error, Result};
use crate::merge::merge;
use crate::source::TopologySource;

/// Watches `<prefix>/service/<svc>/<instanceId>` and `<prefix>/frontend/<id>`
/// in etcd and joins them into service registrations. `instanceId = "host:container:port"`; the value is
/// `"<ip>:<port>"`.
pub struct EtcdTopologySource {
    client: AsyncMutex<Client>,
    prefix: String,
}

impl EtcdTopologySource {
    pub async fn connect(endpoints: &[String], prefix: String) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: AsyncMutex::new(client),
            prefix,
        })
    }

    fn service_prefix(&self) -> String {
        format!("{}/service/", self.prefix)
    }

    fn frontend_prefix(&self) -> String {
        format!("{}/frontend/", self.prefix)
    }

    async fn fetch_services(&self) -> Result<Vec<DiscoveredService>> {
        let prefix = self.service_prefix();
        let mut client = self.client.lock().await;
        let resp = client
            .get(prefix.as_bytes(), Some(GetOptions::new().with_prefix()))
            .await?;

        // svc name -> ordered instances, keyed by raw instance key for a
        // deterministic index (needed to derive `<svc>-<N>` virtual names).
        let mut by_service: BTreeMap<String, Vec<(String, ServiceInstance)>> = BTreeMap::new();

        for kv in resp.kvs() {
            let key = kv.key_str().unwrap_or_default();
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((svc, instance_id)) = rest.split_once('/') else {
                warn!(key, "skipping malformed service key");
                continue;
            };
            let value = kv.value_str().unwrap_or_default();
            let Some((ip, port)) = value.split_once(':') else {
                warn!(key, value, "skipping malformed instance value");
                continue;
            };
            let Ok(port) = port.parse::<u16>() else {
                warn!(key, value, "skipping non-numeric instance port");
                continue;
            };
            by_service
                .entry(svc.to_string())
                .or_default()
                .push((instance_id.to_string(), ServiceInstance::new(ip, port)));
        }

        let mut discovered = Vec::new();
        for (name, mut instances) in by_service {
            instances.sort_by(|a, b| a.0.cmp(&b.0));
            let port = instances.first().map(|(_, i)| i.port).unwrap_or(0);

            let mut svc = DiscoveredService::new(name.clone(), port);
            svc.instances = instances.iter().map(|(_, i)| i.clone()).collect();
            discovered.push(svc);

            for (idx, (_, instance)) in instances.into_iter().enumerate() {
                let mut virtual_svc = DiscoveredService::new(format!("{name}-{idx}"), instance.port);
                virtual_svc.instances = vec![instance];
                discovered.push(virtual_svc);
            }
        }

        Ok(discovered)
    }

    async fn fetch_frontends(&self) -> Result<Vec<(String, FrontendRecord)>> {
        let prefix = self.frontend_prefix();
        let mut client = self.client.lock().await;
        let resp = client
            .get(prefix.as_bytes(), Some(GetOptions::new().with_prefix()))
            .await?;

        let mut out = Vec::new();
        for kv in resp.kvs() {
            let key = kv.key_str().unwrap_or_default();
            let Some(id) = key.strip_prefix(&prefix) else {
                continue;
            };
            let value = kv.value_str().unwrap_or_default();
            let record: FrontendRecord = serde_json::from_str(value).map_err(|source| Error::MalformedFrontend {
                key: key.to_string(),
                source,
            })?;
            out.push((id.to_string(), record));
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl TopologySource for EtcdTopologySource {
    async fn services(&self) -> Result<Vec<ServiceRegistration>> {
        let discovered = self.fetch_services().await?;
        let frontends = self.fetch_frontends().await?;
        let merged = merge(&frontends, &discovered);
        debug!(count = merged.len(), "merged etcd topology");
        Ok(normalize(merged))
    }

    async fn watch(&self) -> Result<()> {
        let mut client = self.client.lock().await;
        let (mut watcher, mut stream) = client
            .watch(
                self.prefix.as_bytes(),
                Some(WatchOptions::new().with_prefix()),
            )
            .await?;
        drop(client);

        match stream.message().await? {
            Some(_resp) => Ok(()),
            None => {
                let _ = watcher.cancel().await;
                Err(Error::WatchClosed)
            }
        }
    }
}
