use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating or reloading the external proxy.
/// "TransientExternal": logged and retried by the reconciler,
/// never fatal to the process.
#[derive(Error, Debug)]
pub enum Error {
    #[error("haproxy rejected the configuration: {0}")]
    ValidationFailed(String),

    #[error("failed to spawn haproxy: {0}")]
    Spawn(#[from] std::io::Error),
}
