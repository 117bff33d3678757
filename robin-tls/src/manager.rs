//! Glues the mutex service, certificate store/cache, ACME client, and
//! challenge provider into the single subsystem the reconciler talks to
//!.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use robin_core::model::{Mode, ServiceRegistration, ServiceSelector};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::acme::{combine_bundle, days_until_expiry, AcmeClient};
use crate::cert_cache::CertFileCache;
use crate::cert_store::CertStore;
use crate::challenge::ChallengeProvider;
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::mutex::Mutex;

const MUTEX_NAME: &str = "requestCertificates";
const MUTEX_TTL: Duration = Duration::from_secs(30);
const REQUEST_DELAY: Duration = Duration::from_secs(5);
const RENEWAL_THRESHOLD_DAYS: i64 = 14;
const RENEWAL_RETRY_BUDGET: u32 = 15;
const RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const RENEWAL_FULL_PASS: Duration = Duration::from_secs(2 * 60 * 60);
const RENEWAL_IDLE_PASS: Duration = Duration::from_secs(10);

/// The path segment the synthetic challenge-routing registration matches.
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Coordinates ACME issuance and renewal across the cluster. One instance
/// per process; `kv` is shared with the rest of the cluster so the mutex
/// and certificate store are visible to every replica.
pub struct AcmeManager {
    kv: Arc<dyn KvStore>,
    client: AcmeClient,
    challenges: Arc<ChallengeProvider>,
    store: Arc<CertStore>,
    cache: Arc<CertFileCache>,
    acme_http_port: u16,
    used_domains: RwLock<Vec<String>>,
}

impl AcmeManager {
    /// Spec §4.4 "Start": validates required configuration (email,
    /// directory URL, key/registration paths) and constructs the client.
    /// Returns `None` (the subsystem disables itself cleanly) when any
    /// are missing, rather than erroring.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        directory_url: &str,
        email: Option<&str>,
        private_key_path: Option<&PathBuf>,
        registration_path: Option<&PathBuf>,
        key_bits: u32,
        tmp_certificate_path: PathBuf,
        acme_http_port: u16,
    ) -> Result<Option<Arc<Self>>> {
        let (Some(email), Some(key_path), Some(reg_path)) = (email, private_key_path, registration_path) else {
            info!("acme subsystem disabled: email, private-key-path, or registration-path not configured");
            return Ok(None);
        };
        if directory_url.is_empty() {
            info!("acme subsystem disabled: empty directory url");
            return Ok(None);
        }

        crate::acme::ensure_account_key(key_path, key_bits).await?;
        let client = AcmeClient::register(directory_url, email, reg_path).await?;

        let store = Arc::new(CertStore::new(kv.clone()));
        let cache = Arc::new(CertFileCache::new(tmp_certificate_path, store.clone()));
        let challenges = Arc::new(ChallengeProvider::new(kv.clone()));

        Ok(Some(Arc::new(Self {
            kv,
            client,
            challenges,
            store,
            cache,
            acme_http_port,
            used_domains: RwLock::new(Vec::new()),
        })))
    }

    /// Spawns the cache-invalidation watcher, the HTTP-01 listener, and the
    /// renewal monitor as independent background tasks.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move { this.watch_store_and_invalidate_cache().await });

        let this = self.clone();
        let addr = format!("0.0.0.0:{}", self.acme_http_port).parse().expect("valid socket addr");
        let challenges = self.challenges.clone();
        tokio::spawn(async move {
            if let Err(err) = challenges.serve(addr).await {
                error!(%err, "acme http-01 challenge listener exited");
            }
            let _ = &this;
        });

        let this = self.clone();
        tokio::spawn(async move { this.renewal_loop().await });
    }

    async fn watch_store_and_invalidate_cache(&self) {
        loop {
            if self.store.watch().await.is_ok() {
                self.cache.clear().await;
            }
        }
    }

    /// Spec §4.4 "Extend": enriches public, domain-bearing, cert-less
    /// selectors with a materialized path when available, kicks off async
    /// issuance for the rest, and appends the synthetic challenge-routing
    /// registration.
    pub async fn extend(self: &Arc<Self>, mut services: Vec<ServiceRegistration>) -> Vec<ServiceRegistration> {
        let mut needs_issuance = Vec::new();

        for service in &mut services {
            if !service.public {
                continue;
            }
            for selector in &mut service.selectors {
                if selector.domain.is_empty() || selector.ssl_cert_name.is_some() || selector.is_secure() {
                    continue;
                }
                match self.cache.get(&selector.domain).await {
                    Ok(Some(path)) => {
                        selector.tmp_ssl_cert_path = Some(path.to_string_lossy().into_owned());
                    }
                    Ok(None) => needs_issuance.push(selector.domain.clone()),
                    Err(err) => {
                        warn!(domain = %selector.domain, %err, "failed to consult certificate file cache");
                        needs_issuance.push(selector.domain.clone());
                    }
                }
            }
        }

        if !needs_issuance.is_empty() {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.request_certificates(&needs_issuance).await;
            });
        }

        services.push(challenge_routing_registration(self.acme_http_port));
        services
    }

    /// Spec §4.4 "requestCertificates": single-flight across the cluster
    /// via the named mutex, best-effort per domain.
    pub async fn request_certificates(&self, domains: &[String]) -> Result<Vec<String>> {
        let mutex = Mutex::new(MUTEX_NAME, MUTEX_TTL, self.kv.clone());
        if mutex.lock().await.is_err() {
            return Err(Error::NotMaster);
        }

        sleep(REQUEST_DELAY).await;

        let mut failed = Vec::new();
        for domain in domains {
            match self.client.issue(domain, &self.challenges).await {
                Ok(cert) => {
                    let bundle = combine_bundle(&cert);
                    if let Err(err) = self.store.store(domain, &bundle).await {
                        error!(domain, %err, "failed to persist issued certificate");
                        failed.push(domain.clone());
                    }
                }
                Err(err) => {
                    warn!(domain, %err, "certificate issuance failed");
                    failed.push(domain.clone());
                }
            }
        }

        let _ = mutex.unlock().await;
        Ok(failed)
    }

    /// Called by the reconciler every reconcile with every domain mentioned
    /// by a public, domain-bearing selector.
    pub async fn set_used_domains(&self, domains: Vec<String>) {
        *self.used_domains.write().await = domains;
    }

    async fn renewal_loop(&self) {
        loop {
            let domains = self.used_domains.read().await.clone();
            if domains.is_empty() {
                sleep(RENEWAL_IDLE_PASS).await;
                continue;
            }

            for domain in &domains {
                if let Err(err) = self.renew_if_needed(domain).await {
                    warn!(domain, %err, "renewal check failed");
                }
            }

            sleep(RENEWAL_FULL_PASS).await;
        }
    }

    async fn renew_if_needed(&self, domain: &str) -> Result<()> {
        let Some(blob) = self.store.load(domain).await? else {
            return Ok(());
        };
        let days_left = days_until_expiry(&blob)?;
        if days_left > RENEWAL_THRESHOLD_DAYS {
            return Ok(());
        }

        info!(domain, days_left, "certificate nearing expiry, renewing");
        for attempt in 1..=RENEWAL_RETRY_BUDGET {
            match self.request_certificates(std::slice::from_ref(&domain.to_string())).await {
                Ok(failed) if failed.is_empty() => return Ok(()),
                Ok(_) => {}
                Err(Error::NotMaster) => {
                    // Another replica is issuing; this is expected, not a failure.
                }
                Err(err) => warn!(domain, attempt, %err, "renewal attempt errored"),
            }
            sleep(RENEWAL_RETRY_DELAY).await;
        }
        warn!(domain, "exhausted renewal retry budget");
        Ok(())
    }
}

/// The synthetic registration that routes ACME's well-known path to the
/// internal challenge listener.
fn challenge_routing_registration(acme_http_port: u16) -> ServiceRegistration {
    ServiceRegistration {
        service_name: "__acme_challenge".to_string(),
        service_port: acme_http_port,
        edge_port: 80,
        public: true,
        mode: Mode::Http,
        instances: vec![robin_core::model::ServiceInstance::new("127.0.0.1", acme_http_port)],
        selectors: vec![ServiceSelector {
            weight: 100,
            domain: String::new(),
            path_prefix: CHALLENGE_PATH_PREFIX.to_string(),
            ssl_cert_name: None,
            tmp_ssl_cert_path: None,
            users: vec![],
            rewrite_rules: vec![],
            allow_unauthorized: true,
            allow_insecure: true,
            port: None,
            private: false,
        }],
        http_check_path: None,
        http_check_method: None,
        sticky: false,
        backup: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    #[tokio::test]
    async fn extend_appends_challenge_route() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let manager = AcmeManager::start(
            kv,
            "https://example.invalid/directory",
            None,
            None,
            None,
            4096,
            std::env::temp_dir(),
            8011,
        )
        .await
        .unwrap();
        assert!(manager.is_none());
    }

    #[test]
    fn challenge_registration_matches_wellknown_prefix() {
        let reg = challenge_routing_registration(8011);
        assert_eq!(reg.selectors[0].path_prefix, "/.well-known/acme-challenge/");
        assert!(reg.public);
    }
}
