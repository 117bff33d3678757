//! Joins front-end routing intent against discovered backend services.
//!
//! Shared between the etcd and Kubernetes sources (spec: "the same merge
//! algorithm as the Etcd source is used" for Kubernetes ingress annotations).
//! Produces one [`ServiceRegistration`] per `(frontend, port, privacy, mode)`
//! tuple: a front-end record's selectors are grouped by their effective port
//! and privacy and distributed to the matching edge frontend.

use std::collections::BTreeMap;

use robin_core::model::{FrontendRecord, Mode, ServiceRegistration, ServiceSelector};

use crate::discovered::DiscoveredService;

const DEFAULT_PUBLIC_HTTP_PORT: u16 = 80;
const DEFAULT_PRIVATE_HTTP_PORT: u16 = 81;

/// Resolves a frontend's `service` reference against the discovered set.
/// Tries an exact name match first, then `name-port` (the etcd virtual
/// per-instance service convention), matching the spec's `(name or
/// name-port)` join rule.
fn resolve_service<'a>(
    frontend_service: &str,
    discovered: &'a [DiscoveredService],
) -> Option<&'a DiscoveredService> {
    discovered
        .iter()
        .find(|d| d.name == frontend_service)
        .or_else(|| {
            discovered
                .iter()
                .find(|d| d.name.starts_with(&format!("{frontend_service}-")))
        })
}

fn group_key(selector: &ServiceSelector, record: &FrontendRecord) -> (u16, bool) {
    let port = selector
        .port
        .or(record.edge_port)
        .unwrap_or(match record.mode {
            Mode::Tcp => record.edge_port.unwrap_or(0),
            Mode::Http => {
                if selector.private {
                    DEFAULT_PRIVATE_HTTP_PORT
                } else {
                    DEFAULT_PUBLIC_HTTP_PORT
                }
            }
        });
    (port, selector.private)
}

/// Joins `(id, FrontendRecord)` pairs against discovered services, emitting
/// one `ServiceRegistration` per distinct `(edgePort, private, mode)` group
/// within each frontend. Missing service references are silently skipped;
/// the registration becomes renderable again once the backend appears.
pub fn merge(
    frontends: &[(String, FrontendRecord)],
    discovered: &[DiscoveredService],
) -> Vec<ServiceRegistration> {
    let mut out = Vec::new();

    for (_id, record) in frontends {
        let Some(service) = resolve_service(&record.service, discovered) else {
            continue;
        };

        let mut groups: BTreeMap<(u16, bool), Vec<ServiceSelector>> = BTreeMap::new();
        for selector in &record.selectors {
            groups
                .entry(group_key(selector, record))
                .or_default()
                .push(selector.clone());
        }

        for ((edge_port, private), selectors) in groups {
            out.push(ServiceRegistration {
                service_name: service.name.clone(),
                service_port: service.port,
                edge_port,
                public: !private,
                mode: record.mode,
                instances: service.instances.clone(),
                selectors,
                http_check_path: record.http_check_path.clone(),
                http_check_method: record.http_check_method.clone(),
                sticky: record.sticky,
                backup: record.backup,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use robin_core::model::ServiceInstance;

    fn selector(domain: &str, private: bool) -> ServiceSelector {
        ServiceSelector {
            weight: 100,
            domain: domain.to_string(),
            path_prefix: String::new(),
            ssl_cert_name: None,
            tmp_ssl_cert_path: None,
            users: vec![],
            rewrite_rules: vec![],
            allow_unauthorized: false,
            allow_insecure: false,
            port: None,
            private,
        }
    }

    #[test]
    fn groups_selectors_by_privacy() {
        let record = FrontendRecord {
            service: "api".into(),
            mode: Mode::Http,
            selectors: vec![selector("api.example.com", false), selector("internal.api", true)],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
            edge_port: None,
        };
        let discovered = vec![DiscoveredService {
            name: "api".into(),
            port: 8080,
            instances: vec![ServiceInstance::new("10.0.0.2", 8080)],
        }];

        let regs = merge(&[("f1".into(), record)], &discovered);
        assert_eq!(regs.len(), 2);
        assert!(regs.iter().any(|r| r.edge_port == 80 && r.public));
        assert!(regs.iter().any(|r| r.edge_port == 81 && !r.public));
    }

    #[test]
    fn missing_service_is_skipped() {
        let record = FrontendRecord {
            service: "ghost".into(),
            mode: Mode::Http,
            selectors: vec![selector("ghost.example.com", false)],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
            edge_port: None,
        };
        assert!(merge(&[("f1".into(), record)], &[]).is_empty());
    }

    #[test]
    fn virtual_instance_service_resolves_by_name_prefix() {
        let record = FrontendRecord {
            service: "api".into(),
            mode: Mode::Http,
            selectors: vec![selector("api.example.com", false)],
            http_check_path: None,
            http_check_method: None,
            sticky: false,
            backup: false,
            edge_port: None,
        };
        let discovered = vec![DiscoveredService {
            name: "api-3".into(),
            port: 8080,
            instances: vec![ServiceInstance::new("10.0.0.5", 8080)],
        }];
        let regs = merge(&[("f1".into(), record)], &discovered);
        assert_eq!(regs.len(), 1);
        assert_eq!(regs[0].service_name, "api-3");
    }
}
