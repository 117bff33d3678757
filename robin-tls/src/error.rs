use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors spanning the mutex service, certificate store/cache, and ACME
/// client. All are `TransientExternal` in the reconciler's taxonomy except
/// `NotMaster`, which is an expected, non-error outcome.
#[derive(Error, Debug)]
pub enum Error {
    #[error("kv store error: {0}")]
    Kv(String),

    #[error("mutex {0} already locked by another peer")]
    AlreadyLocked(String),

    #[error("mutex {0} already used by this instance")]
    AlreadyUsed(String),

    #[error("another replica holds the certificate-issuance mutex")]
    NotMaster,

    #[error("acme protocol error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("acme challenge {0} not offered for domain")]
    ChallengeNotOffered(String),

    #[error("acme order ended in unexpected state: {0:?}")]
    OrderFailed(String),

    #[error("certificate has no domains")]
    EmptyCertificate,

    #[error("failed to parse certificate: {0}")]
    CertParse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
