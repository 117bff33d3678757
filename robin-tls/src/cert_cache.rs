//! Certificate file cache
//!
//! 📂 Materializes certificate blobs from the cluster-wide [`CertStore`]
//! onto local disk so haproxy (which only reads files) can pick them up.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::cert_store::CertStore;
use crate::error::Result;

/// Holds `domain -> local file path`, lazily materializing from the
/// durable [`CertStore`] on first access.
pub struct CertFileCache {
    tmp_dir: PathBuf,
    store: Arc<CertStore>,
    cache: RwLock<HashMap<String, PathBuf>>,
}

impl CertFileCache {
    pub fn new(tmp_dir: impl AsRef<Path>, store: Arc<CertStore>) -> Self {
        Self {
            tmp_dir: tmp_dir.as_ref().to_path_buf(),
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the local path containing `domain`'s certificate blob,
    /// materializing it from the store on first access. `None` if the
    /// store has never issued a certificate for this domain.
    pub async fn get(&self, domain: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = self.cache.read().await.get(domain).cloned() {
            return Ok(Some(path));
        }

        let Some(blob) = self.store.load(domain).await? else {
            return Ok(None);
        };

        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        let path = self.tmp_dir.join(format!("{domain}.pem"));
        tokio::fs::write(&path, &blob).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;

        debug!(domain, path = %path.display(), "materialized certificate");
        self.cache.write().await.insert(domain.to_string(), path.clone());
        Ok(Some(path))
    }

    /// Empties the in-memory mapping. Does not remove files; they are
    /// overwritten on next materialization. Invoked whenever
    /// `store.watch()` fires.
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn get_materializes_and_caches() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CertStore::new(Arc::new(InMemoryKvStore::new())));
        store.store("a.example.com", b"CERT||KEY").await.unwrap();

        let cache = CertFileCache::new(tmp.path(), store);
        let path = cache.get("a.example.com").await.unwrap().unwrap();
        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents, b"CERT||KEY");

        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn missing_domain_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CertStore::new(Arc::new(InMemoryKvStore::new())));
        let cache = CertFileCache::new(tmp.path(), store);
        assert!(cache.get("ghost.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_forces_rematerialization_on_next_get() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(CertStore::new(Arc::new(InMemoryKvStore::new())));
        store.store("a.example.com", b"v1").await.unwrap();
        let cache = CertFileCache::new(tmp.path(), store.clone());

        cache.get("a.example.com").await.unwrap();
        store.store("a.example.com", b"v2").await.unwrap();
        cache.clear().await;

        let path = cache.get("a.example.com").await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"v2");
    }
}
