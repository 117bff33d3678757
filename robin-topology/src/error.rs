use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a topology source.
///
/// Everything here is `TransientExternal` in the taxonomy of the reconciler:
/// the watcher logs and retries rather than tearing down the process.
#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("malformed frontend record at {key}: {source}")]
    MalformedFrontend {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed instance key {0}")]
    MalformedInstanceKey(String),

    #[error("malformed instance value {0}")]
    MalformedInstanceValue(String),

    #[error("watch channel closed")]
    WatchClosed,
}
