use thiserror::Error;

pub type Result<T> = std::result::Result<T, RenderError>;

/// Errors raised while synthesizing the haproxy configuration.
/// A `Conflict` aborts the whole render. The reconciler logs it and keeps
/// the previous configuration in force.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RenderError {
    #[error("backend {backend} aggregates services with conflicting {field}")]
    Conflict { backend: String, field: &'static str },

    #[error("selector references an invalid rewrite rule: {0}")]
    InvalidRewrite(String),
}
