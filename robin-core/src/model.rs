//! Routing data model
//!
//! `ServiceRegistration`, `ServiceSelector`, `FrontendRecord` and friends:
//! the unit of routing that every topology source produces and the config
//! synthesizer consumes.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Frontend/backend traffic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Http,
    Tcp,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Http => "http",
            Mode::Tcp => "tcp",
        }
    }
}

/// A single backend instance `{ip, port}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub ip: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Deterministic textual form used for sorting and server-id derivation.
    pub fn full_string(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl PartialOrd for ServiceInstance {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceInstance {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.full_string().cmp(&other.full_string())
    }
}

/// A basic-auth credential attached to a selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub password_hash: String,
}

impl User {
    pub fn full_string(&self) -> String {
        format!("{}:{}", self.name, self.password_hash)
    }
}

/// Exactly one of `path_prefix` (prepend), `remove_path_prefix`, or `domain`
/// (redirect) must be set; enforced by [`RewriteRule::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl RewriteRule {
    pub fn validate(&self) -> Result<()> {
        let set = [
            self.path_prefix.is_some(),
            self.remove_path_prefix.is_some(),
            self.domain.is_some(),
        ];
        if set.iter().filter(|b| **b).count() != 1 {
            return Err(Error::Validation(
                "rewrite rule must set exactly one of path_prefix, remove_path_prefix, domain"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn full_string(&self) -> String {
        format!(
            "{}|{}|{}",
            self.path_prefix.as_deref().unwrap_or(""),
            self.remove_path_prefix.as_deref().unwrap_or(""),
            self.domain.as_deref().unwrap_or("")
        )
    }
}

/// Matches incoming traffic to a registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSelector {
    #[serde(default)]
    pub weight: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_cert_name: Option<String>,
    /// Materialized from the ACME extension layer; not part of the wire format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_ssl_cert_path: Option<String>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub rewrite_rules: Vec<RewriteRule>,
    #[serde(default)]
    pub allow_unauthorized: bool,
    #[serde(default)]
    pub allow_insecure: bool,
    /// Port this selector is restricted to (TCP mode, SNI-less passthrough).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// True when this selector is only reachable on the private edge port.
    #[serde(default)]
    pub private: bool,
}

impl ServiceSelector {
    pub fn validate(&self) -> Result<()> {
        if self.weight as u32 > 100 {
            return Err(Error::Validation(format!(
                "selector weight {} out of range [0,100]",
                self.weight
            )));
        }
        if let Some(port) = self.port {
            if port == 0 {
                return Err(Error::Validation("selector port must be in [0, 65536)".into()));
            }
        }
        for rule in &self.rewrite_rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// A selector is secure iff it carries cert material.
    pub fn is_secure(&self) -> bool {
        self.ssl_cert_name.is_some() || self.tmp_ssl_cert_path.is_some()
    }

    /// Deterministic textual form used for sorting and deduplication.
    pub fn full_string(&self) -> String {
        let mut users: Vec<String> = self.users.iter().map(User::full_string).collect();
        users.sort();
        let mut rules: Vec<String> = self.rewrite_rules.iter().map(RewriteRule::full_string).collect();
        rules.sort();
        format!(
            "w={} dom={} path={} cert={} tmpcert={} port={} priv={} unauth={} insecure={} users=[{}] rules=[{}]",
            self.weight,
            self.domain,
            self.path_prefix,
            self.ssl_cert_name.as_deref().unwrap_or(""),
            self.tmp_ssl_cert_path.as_deref().unwrap_or(""),
            self.port.map(|p| p.to_string()).unwrap_or_default(),
            self.private,
            self.allow_unauthorized,
            self.allow_insecure,
            users.join(","),
            rules.join(","),
        )
    }
}

impl PartialOrd for ServiceSelector {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.full_string().cmp(&other.full_string()))
    }
}

/// The unit of routing, constructed fresh on every reconcile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_name: String,
    pub service_port: u16,
    pub edge_port: u16,
    pub public: bool,
    #[serde(default)]
    pub mode: Mode,
    pub instances: Vec<ServiceInstance>,
    pub selectors: Vec<ServiceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check_method: Option<String>,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub backup: bool,
}

impl ServiceRegistration {
    /// The key that uniquely identifies a registration within one reconciliation.
    pub fn identity(&self) -> (String, u16, u16, bool) {
        (
            self.service_name.clone(),
            self.service_port,
            self.edge_port,
            self.public,
        )
    }

    /// Deterministic textual form used for sorting.
    pub fn full_string(&self) -> String {
        let mut instances: Vec<String> = self.instances.iter().map(ServiceInstance::full_string).collect();
        instances.sort();
        let mut selectors: Vec<String> = self.selectors.iter().map(ServiceSelector::full_string).collect();
        selectors.sort();
        format!(
            "{}:{}:{}:{}:{}:sticky={}:backup={}:check={}/{}:inst=[{}]:sel=[{}]",
            self.service_name,
            self.service_port,
            self.edge_port,
            self.public,
            self.mode.as_str(),
            self.sticky,
            self.backup,
            self.http_check_method.as_deref().unwrap_or(""),
            self.http_check_path.as_deref().unwrap_or(""),
            instances.join(","),
            selectors.join(","),
        )
    }

    /// Deduplicates selectors (by their deterministic textual form) in place.
    pub fn dedup_selectors(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.selectors.retain(|s| seen.insert(s.full_string()));
    }

    /// A registration with no instances or no selectors must be dropped before rendering.
    pub fn is_renderable(&self) -> bool {
        !self.instances.is_empty() && !self.selectors.is_empty()
    }
}

impl PartialOrd for ServiceRegistration {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.full_string().cmp(&other.full_string()))
    }
}

/// Sorts, dedups selectors, and drops unrenderable registrations. The
/// normalization every topology source must apply before returning.
pub fn normalize(mut services: Vec<ServiceRegistration>) -> Vec<ServiceRegistration> {
    for svc in &mut services {
        svc.instances.sort();
        svc.dedup_selectors();
        svc.selectors
            .sort_by(|a, b| a.full_string().cmp(&b.full_string()));
    }
    services.retain(ServiceRegistration::is_renderable);
    services.sort_by(|a, b| a.full_string().cmp(&b.full_string()));
    services
}

/// The API-visible routing intent keyed by an opaque ID matching `[A-Za-z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendRecord {
    pub service: String,
    #[serde(default)]
    pub mode: Mode,
    pub selectors: Vec<ServiceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check_method: Option<String>,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub backup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_port: Option<u16>,
}

/// `[A-Za-z0-9_-]+`
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl FrontendRecord {
    pub fn validate(&self, id: &str) -> Result<()> {
        if !is_valid_id(id) {
            return Err(Error::Validation(format!("invalid frontend id: {id}")));
        }
        if self.service.is_empty() {
            return Err(Error::Validation("frontend record missing service name".into()));
        }
        if self.selectors.is_empty() {
            return Err(Error::Validation("frontend record must have at least one selector".into()));
        }
        if self.mode == Mode::Tcp && self.edge_port.is_none() {
            let has_port_selector = self.selectors.iter().any(|s| s.port.is_some());
            if !has_port_selector {
                return Err(Error::Validation(
                    "tcp frontend record must specify edge_port or a port-matching selector".into(),
                ));
            }
        }
        for selector in &self.selectors {
            selector.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(domain: &str) -> ServiceSelector {
        ServiceSelector {
            domain: domain.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn rewrite_rule_requires_exactly_one_field() {
        let empty = RewriteRule::default();
        assert!(empty.validate().is_err());

        let both = RewriteRule {
            path_prefix: Some("/a".into()),
            domain: Some("x.com".into()),
            ..Default::default()
        };
        assert!(both.validate().is_err());

        let one = RewriteRule {
            path_prefix: Some("/a".into()),
            ..Default::default()
        };
        assert!(one.validate().is_ok());
    }

    #[test]
    fn selector_weight_out_of_range_is_rejected() {
        let bad = ServiceSelector {
            weight: 150,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn unrenderable_registrations_are_dropped() {
        let no_instances = ServiceRegistration {
            service_name: "api".into(),
            service_port: 80,
            edge_port: 80,
            public: true,
            mode: Mode::Http,
            instances: vec![],
            selectors: vec![selector("api.example.com")],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
        };
        let normalized = normalize(vec![no_instances]);
        assert!(normalized.is_empty());
    }

    #[test]
    fn duplicate_selectors_are_deduplicated() {
        let mut svc = ServiceRegistration {
            service_name: "api".into(),
            service_port: 80,
            edge_port: 80,
            public: true,
            mode: Mode::Http,
            instances: vec![ServiceInstance::new("10.0.0.1", 80)],
            selectors: vec![selector("api.example.com"), selector("api.example.com")],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
        };
        svc.dedup_selectors();
        assert_eq!(svc.selectors.len(), 1);
    }

    #[test]
    fn normalize_is_order_independent() {
        let a = ServiceRegistration {
            service_name: "api".into(),
            service_port: 80,
            edge_port: 80,
            public: true,
            mode: Mode::Http,
            instances: vec![ServiceInstance::new("10.0.0.2", 80), ServiceInstance::new("10.0.0.1", 80)],
            selectors: vec![selector("b.example.com"), selector("a.example.com")],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
        };
        let mut b = a.clone();
        b.instances.reverse();
        b.selectors.reverse();

        let na = normalize(vec![a]);
        let nb = normalize(vec![b]);
        assert_eq!(na[0].full_string(), nb[0].full_string());
    }

    #[test]
    fn frontend_record_validates_id_shape() {
        let record = FrontendRecord {
            service: "api".into(),
            mode: Mode::Http,
            selectors: vec![selector("api.example.com")],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
            edge_port: None,
        };
        assert!(record.validate("good-id_1").is_ok());
        assert!(record.validate("bad id!").is_err());
    }

    #[test]
    fn tcp_frontend_requires_edge_port_or_selector_port() {
        let mut record = FrontendRecord {
            service: "db".into(),
            mode: Mode::Tcp,
            selectors: vec![ServiceSelector::default()],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
            edge_port: None,
        };
        assert!(record.validate("db").is_err());

        record.edge_port = Some(5432);
        assert!(record.validate("db").is_ok());
    }
}
