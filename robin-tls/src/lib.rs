//! TLS and ACME automation for Robin: the mutex service (§4.1), the
//! cluster-durable certificate store (§4.2), the local certificate file
//! cache (§4.3), and the ACME client/manager (§4.4). Robin never terminates
//! TLS itself. These modules only ever produce files on disk for haproxy
//! to load.

pub mod acme;
pub mod cert_cache;
pub mod cert_store;
pub mod challenge;
pub mod error;
pub mod kv;
pub mod manager;
pub mod mutex;

pub use cert_cache::CertFileCache;
pub use cert_store::CertStore;
pub use challenge::ChallengeProvider;
pub use error::{Error, Result};
pub use kv::{EtcdKvStore, InMemoryKvStore, KvStore};
pub use manager::AcmeManager;
pub use mutex::Mutex;
