use std::path::PathBuf;

/// Static settings the renderer needs beyond the service list itself.
/// Pulled from [`robin_core::config::RunArgs`] by the caller.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub ssl_certs_dir: PathBuf,
    pub force_ssl: bool,
    pub private_ssl_cert: Option<PathBuf>,
    pub public_host: Option<String>,
    pub private_host: Option<String>,
    pub exclude_public: bool,
    pub exclude_private: bool,
    pub stats_port: u16,
    pub stats_user: Option<String>,
    pub stats_password: Option<String>,
    pub stats_ssl_cert: Option<PathBuf>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            ssl_certs_dir: PathBuf::from("/certs/"),
            force_ssl: false,
            private_ssl_cert: None,
            public_host: None,
            private_host: None,
            exclude_public: false,
            exclude_private: false,
            stats_port: 7088,
            stats_user: None,
            stats_password: None,
            stats_ssl_cert: None,
        }
    }
}
