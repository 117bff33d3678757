//! KV-store abstraction shared by the mutex service, certificate store, and
//! ACME challenge map. `EtcdKvStore` is the production backend; `InMemoryKvStore`
//! backs unit tests without a running etcd.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::{Error, Result};

/// Minimal operations every topology-agnostic cluster-state consumer needs:
/// plain get/put/delete, TTL'd create-if-absent (mutex acquisition),
/// compare-and-swap (mutex refresh), compare-and-delete (mutex release),
/// and a coalesced change notification.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// Creates `key = value` with a lease of `ttl`, only if `key` is
    /// currently absent. Returns whether the create succeeded.
    async fn create_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Atomically sets `key = value` (refreshing its TTL) only if the
    /// current value equals `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;

    /// Atomically deletes `key` only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Blocks until something under `prefix` changes. Multiple rapid
    /// writes may coalesce into a single wakeup.
    async fn watch_prefix(&self, prefix: &str) -> Result<()>;

    /// Returns every `(key, value)` pair under `prefix`, with `prefix`
    /// itself stripped from the returned keys. Used by the front-end
    /// registry to list all records.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Production backend: etcd via lease-scoped keys and transactions.
///
/// Every key is joined under `prefix`, so this store and the topology source's own etcd client
/// agree on where the cluster state lives.
pub struct EtcdKvStore {
    client: AsyncMutex<Client>,
    prefix: String,
}

impl EtcdKvStore {
    pub async fn connect(endpoints: &[String], prefix: impl Into<String>) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;
        Ok(Self {
            client: AsyncMutex::new(client),
            prefix: prefix.into(),
        })
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}/{key}", self.prefix.trim_end_matches('/'))
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = self.scoped(key);
        let mut client = self.client.lock().await;
        let resp = client
            .get(key, None)
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = self.scoped(key);
        let mut client = self.client.lock().await;
        client
            .put(key, value, None)
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.scoped(key);
        let mut client = self.client.lock().await;
        client
            .delete(key, None)
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let key = self.scoped(key);
        let mut client = self.client.lock().await;
        let lease = client
            .lease_grant(ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;

        let txn = Txn::new()
            .when(vec![Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease.id())),
            )]);
        let resp = client.txn(txn).await.map_err(|e| Error::Kv(e.to_string()))?;
        Ok(resp.succeeded())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let key = self.scoped(key);
        let mut client = self.client.lock().await;
        let lease = client
            .lease_grant(ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;

        let txn = Txn::new()
            .when(vec![Compare::value(key.as_str(), CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease.id())),
            )]);
        let resp = client.txn(txn).await.map_err(|e| Error::Kv(e.to_string()))?;
        Ok(resp.succeeded())
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let key = self.scoped(key);
        let mut client = self.client.lock().await;
        let txn = Txn::new()
            .when(vec![Compare::value(key.as_str(), CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::delete(key.as_str(), None)]);
        let resp = client.txn(txn).await.map_err(|e| Error::Kv(e.to_string()))?;
        Ok(resp.succeeded())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<()> {
        let prefix = self.scoped(prefix);
        let mut client = self.client.lock().await;
        let (mut watcher, mut stream) = client
            .watch(prefix.as_str(), Some(etcd_client::WatchOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;
        drop(client);

        match stream.message().await.map_err(|e| Error::Kv(e.to_string()))? {
            Some(_) => Ok(()),
            None => {
                let _ = watcher.cancel().await;
                Err(Error::Kv(format!("watch on {prefix} closed")))
            }
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let scoped_prefix = self.scoped(prefix);
        let mut client = self.client.lock().await;
        let resp = client
            .get(scoped_prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| Error::Kv(e.to_string()))?;

        let strip = format!("{scoped_prefix}/");
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let key = kv.key_str().ok()?;
                let suffix = key.strip_prefix(&strip)?;
                Some((suffix.to_string(), kv.value().to_vec()))
            })
            .collect())
    }
}

/// In-memory backend used by unit tests throughout `robin-tls`.
#[derive(Default)]
pub struct InMemoryKvStore {
    inner: Arc<AsyncMutex<HashMap<String, Vec<u8>>>>,
    notify: Arc<Notify>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.lock().await.insert(key.to_string(), value.to_vec());
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().await.remove(key);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<bool> {
        let mut map = self.inner.lock().await;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), value.to_vec());
        drop(map);
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        _ttl: Duration,
    ) -> Result<bool> {
        let mut map = self.inner.lock().await;
        if map.get(key).map(|v| v.as_slice()) != Some(expected) {
            return Ok(false);
        }
        map.insert(key.to_string(), value.to_vec());
        drop(map);
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut map = self.inner.lock().await;
        if map.get(key).map(|v| v.as_slice()) != Some(expected) {
            return Ok(false);
        }
        map.remove(key);
        drop(map);
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn watch_prefix(&self, _prefix: &str) -> Result<()> {
        self.notify.notified().await;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let strip = format!("{prefix}/");
        Ok(self
            .inner
            .lock()
            .await
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&strip).map(|suffix| (suffix.to_string(), v.clone())))
            .collect())
    }
}
