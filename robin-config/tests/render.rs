//! End-to-end rendering scenarios.
//!
//! Each test builds a small topology by hand and asserts the rendered
//! haproxy configuration *contains* the fragments spec §8 calls out —
//! the same "expected render contains ..." wording the spec itself uses,
//! rather than a byte-exact golden diff (haproxy config is assembled from
//! many independently-ordered sections; pinning the whole file would make
//! these tests brittle to unrelated section reordering).

use robin_config::{render, RenderError, RenderOptions};
use robin_core::model::{Mode, ServiceInstance, ServiceRegistration, ServiceSelector};

fn selector(domain: &str) -> ServiceSelector {
    ServiceSelector {
        weight: 100,
        domain: domain.to_string(),
        ..Default::default()
    }
}

fn http_service(name: &str, port: u16, edge_port: u16, instances: Vec<ServiceInstance>, selectors: Vec<ServiceSelector>) -> ServiceRegistration {
    ServiceRegistration {
        service_name: name.to_string(),
        service_port: port,
        edge_port,
        public: true,
        mode: Mode::Http,
        instances,
        selectors,
        http_check_path: None,
        http_check_method: None,
        sticky: false,
        backup: false,
    }
}

/// Collapses runs of whitespace and trims trailing blank lines, the
/// canonicalization spec §8 asks for before comparing renders.
fn canonicalize(text: &str) -> String {
    text.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

#[test]
fn scenario_1_single_http_service() {
    let service = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.2", 8080)],
        vec![selector("api.example.com")],
    );

    let rendered = render(&[service], &RenderOptions::default()).unwrap();
    let canon = canonicalize(&rendered);

    assert!(canon.contains("frontend public_http_in_80"));
    assert!(canon.contains("bind *:80"));
    assert!(canon.contains("hdr_dom(host) -i api.example.com"));
    assert!(canon.contains("use_backend backend_api_8080_public_http_in_80 if acl0"));
    assert!(canon.contains("backend backend_api_8080_public_http_in_80"));
    assert!(canon.contains("balance roundrobin"));
    assert!(canon.contains("server s0-10_0_0_2-8080 10.0.0.2:8080"));
}

#[test]
fn scenario_2_sticky_and_health_check() {
    let mut service = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.2", 8080)],
        vec![selector("api.example.com")],
    );
    service.sticky = true;
    service.http_check_path = Some("/health".to_string());
    service.http_check_method = Some("GET".to_string());

    let rendered = render(&[service], &RenderOptions::default()).unwrap();

    assert!(rendered.contains("balance source"));
    assert!(rendered.contains("option httpchk GET /health"));
    assert!(rendered.contains("server s0-10_0_0_2-8080 10.0.0.2:8080 check"));
}

#[test]
fn scenario_3_backup_pool() {
    let primary = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.2", 8080)],
        vec![selector("api.example.com")],
    );
    let mut backup = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.3", 8080)],
        vec![selector("api.example.com")],
    );
    backup.backup = true;

    let rendered = render(&[primary, backup], &RenderOptions::default()).unwrap();

    // Both feed the same ACL / backend pair (identical selector content).
    assert_eq!(rendered.matches("hdr_dom(host) -i api.example.com").count(), 1);
    assert!(rendered.contains("server s0-10_0_0_2-8080 10.0.0.2:8080\n") || rendered.contains("server s0-10_0_0_2-8080 10.0.0.2:8080"));
    assert!(rendered.contains("server s1-10_0_0_3-8080 10.0.0.3:8080 check backup"));
}

#[test]
fn scenario_4_private_http_frontend() {
    let mut sel = selector("internal.example.com");
    sel.private = true;
    let service = http_service(
        "internal-api",
        9090,
        81,
        vec![ServiceInstance::new("10.0.1.2", 9090)],
        vec![sel],
    );

    let rendered = render(&[service], &RenderOptions::default()).unwrap();

    assert!(rendered.contains("frontend private_http_in_81"));
    // The public frontend still exists (always created) but carries no ACL for this domain.
    let public_section = rendered
        .split("frontend public_http_in_80")
        .nth(1)
        .unwrap()
        .split("frontend ")
        .next()
        .unwrap();
    assert!(!public_section.contains("internal.example.com"));

    let private_section = rendered
        .split("frontend private_http_in_81")
        .nth(1)
        .unwrap()
        .split("\n\n")
        .next()
        .unwrap();
    assert!(private_section.contains("internal.example.com"));
}

#[test]
fn scenario_5_tcp_passthrough_with_sni() {
    let service = ServiceRegistration {
        service_name: "db".to_string(),
        service_port: 5432,
        edge_port: 8022,
        public: true,
        mode: Mode::Tcp,
        instances: vec![ServiceInstance::new("10.0.2.2", 5432)],
        selectors: vec![ServiceSelector::default()],
        http_check_path: None,
        http_check_method: None,
        sticky: false,
        backup: false,
    };

    let rendered = render(&[service], &RenderOptions::default()).unwrap();

    assert!(rendered.contains("frontend public_tcp_in_8022"));
    assert!(rendered.contains("acl always_true"));
    assert!(rendered.contains("use_backend backend_db_5432_public_tcp_in_8022 if acl0"));
    // The section header is anchored at line start to avoid matching the
    // `use_backend backend_...` reference above it.
    let backend_section = rendered
        .split("\nbackend backend_db_5432_public_tcp_in_8022\n")
        .nth(1)
        .unwrap();
    assert!(backend_section.starts_with("    mode tcp\n"));
}

#[test]
fn scenario_6_duplicate_selector_is_deduplicated() {
    let a = http_service(
        "dup",
        9000,
        80,
        vec![ServiceInstance::new("10.0.3.1", 9000)],
        vec![selector("dup.example.com")],
    );
    let b = http_service(
        "dup",
        9000,
        80,
        vec![ServiceInstance::new("10.0.3.2", 9000)],
        vec![selector("dup.example.com")],
    );

    let rendered = render(&[a, b], &RenderOptions::default()).unwrap();

    assert_eq!(rendered.matches("hdr_dom(host) -i dup.example.com").count(), 1);
    assert_eq!(rendered.matches("use_backend").count(), 1);
    assert!(rendered.contains("server s0-10_0_3_1-9000 10.0.3.1:9000"));
    assert!(rendered.contains("server s1-10_0_3_2-9000 10.0.3.2:9000"));
}

#[test]
fn render_is_deterministic_and_order_independent() {
    let a = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.2", 8080), ServiceInstance::new("10.0.0.1", 8080)],
        vec![selector("b.example.com"), selector("a.example.com")],
    );

    let once = render(&[a.clone()], &RenderOptions::default()).unwrap();
    let twice = render(&[a.clone()], &RenderOptions::default()).unwrap();
    assert_eq!(once, twice, "render must be a pure, deterministic function of its input");

    let mut reordered = a.clone();
    reordered.instances.reverse();
    reordered.selectors.reverse();
    let from_reordered = render(&[reordered], &RenderOptions::default()).unwrap();
    assert_eq!(once, from_reordered, "render must normalize instance/selector order internally");
}

#[test]
fn empty_instances_drops_the_registration() {
    let service = http_service("ghost", 8080, 80, vec![], vec![selector("ghost.example.com")]);
    let rendered = render(&[service], &RenderOptions::default()).unwrap();
    assert!(!rendered.contains("ghost.example.com"));
}

#[test]
fn conflicting_sticky_flags_in_one_backend_is_a_render_error() {
    let a = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.2", 8080)],
        vec![selector("api.example.com")],
    );
    let mut b = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.3", 8080)],
        vec![selector("api.example.com")],
    );
    b.sticky = true;

    let err = render(&[a, b], &RenderOptions::default()).unwrap_err();
    assert!(matches!(err, RenderError::Conflict { field: "sticky", .. }));
}

#[test]
fn force_ssl_with_a_cert_defines_the_backend_the_https_sibling_references() {
    let mut sel = selector("api.example.com");
    sel.ssl_cert_name = Some("api.pem".to_string());
    let service = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.2", 8080)],
        vec![sel],
    );
    let opts = RenderOptions {
        force_ssl: true,
        ..Default::default()
    };

    let rendered = render(&[service], &opts).unwrap();

    // An HTTPS sibling frontend is created because a public cert exists.
    assert!(rendered.contains("frontend public_https_in_443"));

    // Every use_backend reference must name a backend that is actually defined,
    // the same contract haproxy's `-c` validation enforces.
    for line in rendered.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("use_backend ") {
            let name = rest.split_whitespace().next().unwrap();
            assert!(
                rendered.contains(&format!("backend {name}\n")),
                "use_backend references undefined backend {name}"
            );
        }
    }
}

#[test]
fn insecure_selector_with_force_ssl_redirects_without_use_backend_on_http() {
    let service = http_service(
        "api",
        8080,
        80,
        vec![ServiceInstance::new("10.0.0.2", 8080)],
        vec![selector("api.example.com")],
    );
    let opts = RenderOptions {
        force_ssl: true,
        ..Default::default()
    };

    let rendered = render(&[service], &opts).unwrap();
    let public_section = rendered
        .split("frontend public_http_in_80")
        .nth(1)
        .unwrap()
        .split("\n\n")
        .next()
        .unwrap();

    assert!(public_section.contains("redirect scheme https if !{ ssl_fc }"));
    assert!(!public_section.contains("use_backend backend_api_8080_public_http_in_80"));
}
