//! Certificate Storage Management
//!
//! 💾 Durable, cluster-visible mapping `domain -> certificate blob` (spec
//! §4.2). Backed by the same [`crate::kv::KvStore`] abstraction as the
//! mutex service rather than the local filesystem, so that every replica
//! sees the same certificates and the file cache (§4.3) can invalidate on
//! `watch()`.

use std::sync::Arc;

use crate::error::Result;
use crate::kv::KvStore;

/// Key prefix under which certificate blobs live, relative to the
/// configured etcd path (`lb/acme/certificates/<domain>` per spec §6).
const CERTIFICATES_PREFIX: &str = "lb/acme/certificates";

/// A thread-safe, cluster-durable store for certificate blobs.
///
/// Certificates are opaque bytes: the concatenation of the leaf
/// certificate, its chain, and the private key, exactly as haproxy
/// expects them in a single `.pem` file.
pub struct CertStore {
    kv: Arc<dyn KvStore>,
}

impl CertStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(domain: &str) -> String {
        format!("{CERTIFICATES_PREFIX}/{domain}")
    }

    /// Retrieves the latest blob for `domain`, or `None` if never issued.
    pub async fn load(&self, domain: &str) -> Result<Option<Vec<u8>>> {
        self.kv.get(&Self::key(domain)).await
    }

    /// Overwrites the blob for `domain` atomically. Partial/failed
    /// issuances must never reach this call. Callers only store a
    /// complete bundle on ACME success.
    pub async fn store(&self, domain: &str, blob: &[u8]) -> Result<()> {
        tracing::info!(domain, "storing certificate");
        self.kv.put(&Self::key(domain), blob).await
    }

    /// Blocks until the next write under the certificate prefix. Rapid
    /// successive writes may coalesce into a single wakeup.
    pub async fn watch(&self) -> Result<()> {
        self.kv.watch_prefix(CERTIFICATES_PREFIX).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    #[tokio::test]
    async fn store_then_load_roundtrips() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let store = CertStore::new(kv);

        assert!(store.load("a.example.com").await.unwrap().is_none());
        store.store("a.example.com", b"CERT||KEY").await.unwrap();
        assert_eq!(
            store.load("a.example.com").await.unwrap(),
            Some(b"CERT||KEY".to_vec())
        );
    }

    #[tokio::test]
    async fn overwrite_replaces_the_prior_blob() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let store = CertStore::new(kv);

        store.store("a.example.com", b"v1").await.unwrap();
        store.store("a.example.com", b"v2").await.unwrap();
        assert_eq!(store.load("a.example.com").await.unwrap(), Some(b"v2".to_vec()));
    }
}
