use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Kv(#[from] robin_tls::Error),

    #[error(transparent)]
    Model(#[from] robin_core::Error),

    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
