//! Front-end registry: a thin CRUD layer over `KvStore`, keyed
//! `frontend/<id>`, the same persisted layout the etcd topology source
//! reads back out in `fetch_frontends` (`robin-topology::etcd_source`).

use std::sync::Arc;

use robin_core::model::{self, FrontendRecord};
use robin_tls::KvStore;

use crate::error::{Error, Result};

const PREFIX: &str = "frontend";

#[derive(Clone)]
pub struct FrontendRegistry {
    kv: Arc<dyn KvStore>,
}

impl FrontendRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("{PREFIX}/{id}")
    }

    pub async fn list(&self) -> Result<Vec<(String, FrontendRecord)>> {
        let mut out = Vec::new();
        for (id, value) in self.kv.list_prefix(PREFIX).await? {
            let record: FrontendRecord = serde_json::from_slice(&value)?;
            out.push((id, record));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<Option<FrontendRecord>> {
        match self.kv.get(&Self::key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Validates `record`, then creates it. Returns `Ok(false)` if `id`
    /// already has a record (409 Conflict at the HTTP layer) without
    /// touching it.
    pub async fn create(&self, id: &str, record: &FrontendRecord) -> Result<bool> {
        if !model::is_valid_id(id) {
            return Err(Error::Model(robin_core::Error::Validation(format!(
                "invalid frontend id: {id}"
            ))));
        }
        record.validate(id)?;

        if self.get(id).await?.is_some() {
            return Ok(false);
        }
        let body = serde_json::to_vec(record)?;
        self.kv.put(&Self::key(id), &body).await?;
        Ok(true)
    }

    /// Returns whether a record existed to delete.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        if self.get(id).await?.is_none() {
            return Ok(false);
        }
        self.kv.delete(&Self::key(id)).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robin_core::model::ServiceSelector;
    use robin_tls::InMemoryKvStore;

    fn sample_record() -> FrontendRecord {
        FrontendRecord {
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
        }
    }

    #[tokio::test]
    async fn create_get_list_delete_roundtrip() {
        let registry = FrontendRegistry::new(Arc::new(InMemoryKvStore::new()));
        let record = sample_record();

        assert!(registry.create("web-1", &record).await.unwrap());
        assert_eq!(registry.get("web-1").await.unwrap(), Some(record.clone()));
        assert_eq!(registry.list().await.unwrap(), vec![("web-1".to_string(), record)]);

        assert!(registry.delete("web-1").await.unwrap());
        assert_eq!(registry.get("web-1").await.unwrap(), None);
        assert!(!registry.delete("web-1").await.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let registry = FrontendRegistry::new(Arc::new(InMemoryKvStore::new()));
        let record = sample_record();

        assert!(registry.create("web-1", &record).await.unwrap());
        assert!(!registry.create("web-1", &record).await.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_invalid_id() {
        let registry = FrontendRegistry::new(Arc::new(InMemoryKvStore::new()));
        assert!(registry.create("not valid!", &sample_record()).await.is_err());
    }

    #[tokio::test]
    async fn create_rejects_empty_selectors() {
        let registry = FrontendRegistry::new(Arc::new(InMemoryKvStore::new()));
        let mut record = sample_record();
        record.selectors.clear();
        assert!(registry.create("web-1", &record).await.is_err());
    }
}
