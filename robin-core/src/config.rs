//! Runtime configuration: the flag surface accepted by `robin run`.
//!
//! Kept in `robin-core` (rather than the binary crate) so every other crate
//! can depend on the field shapes without re-declaring them, leaving only
//! the thin `Cli`/`Commands` enum in the binary.

use std::path::PathBuf;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

/// Which topology source backs service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Etcd,
    Kubernetes,
}

/// Log verbosity, forwarded to `tracing_subscriber::EnvFilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Flags accepted by the `run` subcommand.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Topology backend
    #[arg(long, value_enum, default_value_t = Backend::Etcd)]
    pub backend: Backend,
    /// Etcd client URL
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    pub etcd_addr: String,
    /// Etcd cluster endpoints (repeatable)
    #[arg(long = "etcd-endpoint")]
    pub etcd_endpoints: Vec<String>,
    /// Key prefix under which the topology tree lives
    #[arg(long, default_value = "/pulcy/robin")]
    pub etcd_path: String,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Path the rendered haproxy configuration is written to
    #[arg(long, default_value = "/data/config/haproxy.cfg")]
    pub haproxy_conf: PathBuf,

    /// haproxy stats port
    #[arg(long, default_value_t = 7088)]
    pub stats_port: u16,
    /// haproxy stats username
    #[arg(long, env = "ROBIN_STATS_USER")]
    pub stats_user: Option<String>,
    /// haproxy stats password
    #[arg(long, env = "ROBIN_STATS_PASSWORD")]
    pub stats_password: Option<String>,
    /// haproxy stats SSL certificate path
    #[arg(long)]
    pub stats_ssl_cert: Option<String>,

    /// Directory containing named SSL certificates referenced by `sslCertName`
    #[arg(long, default_value = "/certs/")]
    pub ssl_certs: PathBuf,
    /// Force HTTPS redirects for every public, insecure selector
    #[arg(long, default_value_t = false)]
    pub force_ssl: bool,
    /// Certificate used for private TCP passthrough SNI
    #[arg(long)]
    pub private_ssl_cert: Option<String>,

    /// Bind address for the public edge
    #[arg(long)]
    pub public_host: Option<String>,
    /// Bind address for the private edge
    #[arg(long)]
    pub private_host: Option<String>,
    /// Suppress the public frontend entirely
    #[arg(long, default_value_t = false)]
    pub exclude_public: bool,
    /// Suppress the private frontend entirely
    #[arg(long, default_value_t = false)]
    pub exclude_private: bool,

    /// HTTP-01 challenge listener port
    #[arg(long, default_value_t = 8011)]
    pub acme_http_port: u16,
    /// ACME account contact email
    #[arg(long, env = "ROBIN_ACME_EMAIL")]
    pub acme_email: Option<String>,
    /// ACME directory URL
    #[arg(long, default_value = "https://acme-v01.api.letsencrypt.org/directory")]
    pub acme_directory_url: String,
    /// Account key size in bits
    #[arg(long, default_value_t = 4096)]
    pub key_bits: u32,
    /// Path to the persisted ACME account private key
    #[arg(long, default_value = "~/.pulcy/acme/private-key.pem")]
    pub private_key_path: String,
    /// Path to the persisted ACME account registration
    #[arg(long, default_value = "~/.pulcy/acme/registration.json")]
    pub registration_path: String,
    /// Directory materialized certificates are written to for the proxy
    #[arg(long, default_value = "/tmp/certificates")]
    pub tmp_certificate_path: PathBuf,

    /// Metrics bind host (out of scope for the core; reserved for the external endpoint)
    #[arg(long, default_value = "0.0.0.0")]
    pub metrics_host: String,
    /// Metrics bind port
    #[arg(long, default_value_t = 8055)]
    pub metrics_port: u16,
    /// Private haproxy stats port
    #[arg(long, default_value_t = 7089)]
    pub private_stats_port: u16,

    /// Front-end registry API bind host
    #[arg(long, default_value = "0.0.0.0")]
    pub api_host: String,
    /// Front-end registry API bind port
    #[arg(long, default_value_t = 8056)]
    pub api_port: u16,
}

impl RunArgs {
    /// Whether the ACME subsystem has everything it needs to run.
    pub fn acme_is_configured(&self) -> bool {
        self.acme_email.is_some()
            && !self.acme_directory_url.is_empty()
            && !self.private_key_path.is_empty()
            && !self.registration_path.is_empty()
    }

    pub fn private_key_path(&self) -> PathBuf {
        expand_tilde(&self.private_key_path)
    }

    pub fn registration_path(&self) -> PathBuf {
        expand_tilde(&self.registration_path)
    }
}

/// Expands a leading `~` to the user's home directory, the same shorthand
/// the default flag values use.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Arguments for `register acme`.
#[derive(Debug, Clone, Args)]
pub struct RegisterAcmeArgs {
    #[arg(long, env = "ROBIN_ACME_EMAIL")]
    pub acme_email: String,
    #[arg(long, default_value = "https://acme-v01.api.letsencrypt.org/directory")]
    pub acme_directory_url: String,
    #[arg(long, default_value_t = 4096)]
    pub key_bits: u32,
    #[arg(long, default_value = "~/.pulcy/acme/private-key.pem")]
    pub private_key_path: String,
    #[arg(long, default_value = "~/.pulcy/acme/registration.json")]
    pub registration_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acme_requires_all_four_fields() {
        let mut args = bare_args();
        assert!(!args.acme_is_configured());
        args.acme_email = Some("ops@example.com".into());
        assert!(args.acme_is_configured());
    }

    fn bare_args() -> RunArgs {
        RunArgs {
            backend: Backend::Etcd,
            etcd_addr: "http://127.0.0.1:2379".into(),
            etcd_endpoints: vec![],
            etcd_path: "/pulcy/robin".into(),
            log_level: LogLevel::Info,
            haproxy_conf: "/tmp/haproxy.cfg".into(),
            stats_port: 7088,
            stats_user: None,
            stats_password: None,
            stats_ssl_cert: None,
            ssl_certs: "/certs/".into(),
            force_ssl: false,
            private_ssl_cert: None,
            public_host: None,
            private_host: None,
            exclude_public: false,
            exclude_private: false,
            acme_http_port: 8011,
            acme_email: None,
            acme_directory_url: "https://acme-v01.api.letsencrypt.org/directory".into(),
            key_bits: 4096,
            private_key_path: "~/.pulcy/acme/private-key.pem".into(),
            registration_path: "~/.pulcy/acme/registration.json".into(),
            tmp_certificate_path: "/tmp/certificates".into(),
            metrics_host: "0.0.0.0".into(),
            metrics_port: 8055,
            private_stats_port: 7089,
            api_host: "0.0.0.0".into(),
            api_port: 8056,
        }
    }

    #[test]
    fn expand_tilde_resolves_home() {
        let expanded = expand_tilde("~/.pulcy/acme/private-key.pem");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".pulcy/acme/private-key.pem"));
        }
    }
}
