//! Named, TTL-bounded, cluster-wide mutual exclusion.
//!
//! Used by the ACME client so only one replica issues a certificate for a
//! given domain/window at a time. KV-store agnostic: create-if-absent with
//! TTL to acquire, compare-and-swap to refresh, compare-and-delete to
//! release.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::kv::KvStore;

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn fresh_token() -> String {
    format!("{}-{}", std::process::id(), TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// A single-use, TTL-refreshed cluster lock.
pub struct Mutex {
    key: String,
    ttl: Duration,
    kv: Arc<dyn KvStore>,
    token: String,
    /// `true` once `lock()` has been called, successfully or not. A
    /// `Mutex` value is single-use.
    attempted: AtomicBool,
    /// `true` while this instance believes it holds the lock. Cleared by
    /// the refresher on a failed refresh (surrender, not panic, see
    /// design notes) or by `unlock()`.
    locked: Arc<AtomicBool>,
    refresher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Mutex {
    pub fn new(key: impl Into<String>, ttl: Duration, kv: Arc<dyn KvStore>) -> Self {
        Self {
            key: key.into(),
            ttl,
            kv,
            token: fresh_token(),
            attempted: AtomicBool::new(false),
            locked: Arc::new(AtomicBool::new(false)),
            refresher: tokio::sync::Mutex::new(None),
        }
    }

    /// Non-blocking. Succeeds exactly once per `Mutex` instance.
    pub async fn lock(&self) -> Result<()> {
        if self.attempted.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyUsed(self.key.clone()));
        }

        let created = self
            .kv
            .create_if_absent(&self.key, self.token.as_bytes(), self.ttl)
            .await?;
        if !created {
            return Err(Error::AlreadyLocked(self.key.clone()));
        }

        self.locked.store(true, Ordering::SeqCst);
        self.spawn_refresher().await;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Atomically deletes the record conditionally on ownership. Local
    /// state is cleared *before* the remote delete so the refresher can
    /// never race a delete-then-refresh.
    pub async fn unlock(&self) -> Result<()> {
        if !self.locked.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.refresher.lock().await.take() {
            handle.abort();
        }
        self.kv.compare_and_delete(&self.key, self.token.as_bytes()).await?;
        Ok(())
    }

    async fn spawn_refresher(&self) {
        let interval = self
            .ttl
            .checked_div(2)
            .and_then(|half| half.checked_sub(Duration::from_secs(1)))
            .unwrap_or(Duration::from_secs(1));

        let kv = self.kv.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        let ttl = self.ttl;
        let locked = self.locked.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !locked.load(Ordering::SeqCst) {
                    return;
                }
                match kv
                    .compare_and_swap(&key, token.as_bytes(), token.as_bytes(), ttl)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(mutex = %key, "lock refresh lost ownership, surrendering");
                        locked.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        warn!(mutex = %key, %err, "lock refresh failed, surrendering");
                        locked.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });

        *self.refresher.lock().await = Some(handle);
    }
}
