//! The deterministic haproxy config synthesizer.
//!
//! `render` is a pure function of a normalized service list and static
//! [`RenderOptions`]: no IO, no clocks, no randomness. The reconciler
//! can diff successive renders to decide whether a reload is needed
//! (step "compare to lastConfig").

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use robin_core::model::{Mode, ServiceInstance, ServiceRegistration, ServiceSelector};

use crate::error::{RenderError, Result};
use crate::options::RenderOptions;

const PUBLIC_HTTP_PORT: u16 = 80;
const PRIVATE_HTTP_PORT: u16 = 81;
const PUBLIC_HTTPS_PORT: u16 = 443;

/// Identifies one haproxy `frontend` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FrontendKey {
    port: u16,
    public: bool,
    mode: Mode,
}

impl FrontendKey {
    fn name(&self) -> String {
        format!(
            "{}_{}_in_{}",
            if self.public { "public" } else { "private" },
            self.mode.as_str(),
            self.port
        )
    }
}

/// One (registration, selector) pair routed to a particular frontend.
struct Route<'a> {
    registration: &'a ServiceRegistration,
    selector: &'a ServiceSelector,
}

fn frontend_key_for(registration: &ServiceRegistration, selector: &ServiceSelector) -> FrontendKey {
    FrontendKey {
        port: selector.port.unwrap_or(registration.edge_port),
        public: registration.public && !selector.private,
        mode: registration.mode,
    }
}

/// The deterministic, selector-content-only key that groups routes sharing
/// an ACL/backend pair.
fn rule_key(selector: &ServiceSelector) -> String {
    let mut users: Vec<String> = selector.users.iter().map(|u| u.full_string()).collect();
    users.sort();
    let mut rules: Vec<String> = selector.rewrite_rules.iter().map(|r| r.full_string()).collect();
    rules.sort();
    format!(
        "dom={} path={} unauth={} insecure={} users=[{}] rules=[{}]",
        selector.domain,
        selector.path_prefix,
        selector.allow_unauthorized,
        selector.allow_insecure,
        users.join(","),
        rules.join(","),
    )
}

fn cert_path(selector: &ServiceSelector, certs_dir: &Path) -> Option<PathBuf> {
    if let Some(tmp) = &selector.tmp_ssl_cert_path {
        return Some(PathBuf::from(tmp));
    }
    selector.ssl_cert_name.as_ref().map(|name| certs_dir.join(name))
}

fn server_id(index: usize, ip: &str, port: u16) -> String {
    let sanitized: String = ip.chars().map(|c| if c == '.' || c == ':' { '_' } else { c }).collect();
    format!("s{index}-{sanitized}-{port}")
}

fn group_routes<'r, 'a>(routes: &'r [Route<'a>]) -> BTreeMap<String, Vec<&'r Route<'a>>> {
    let mut groups: BTreeMap<String, Vec<&Route>> = BTreeMap::new();
    for route in routes {
        groups.entry(rule_key(route.selector)).or_default().push(route);
    }
    groups
}

/// Assigns a stable backend name to every (frontend, rule-set) pair, in a
/// pass independent of rendering order so the plain-HTTP frontend and its
/// HTTPS sibling agree on the name for the same underlying rule set.
fn precompute_backend_names(routes_by_frontend: &BTreeMap<FrontendKey, Vec<Route>>) -> BTreeMap<(FrontendKey, String), String> {
    let mut names = BTreeMap::new();
    for (key, routes) in routes_by_frontend {
        let groups = group_routes(routes);
        let mut used_bases: BTreeMap<String, usize> = BTreeMap::new();
        for (rk, group) in &groups {
            let lead = group[0];
            let base = format!(
                "backend_{}_{}_{}",
                lead.registration.service_name,
                lead.registration.service_port,
                key.name()
            );
            let count = used_bases.entry(base.clone()).or_insert(0);
            let name = if *count == 0 { base.clone() } else { format!("{base}_{}", *count + 1) };
            *count += 1;
            names.insert((*key, rk.clone()), name);
        }
    }
    names
}

/// Renders the full haproxy configuration text for `services`.
///
/// `services` need not be pre-sorted; `render` normalizes internally so
/// that any permutation of the same logical topology produces byte-identical
/// output.
pub fn render(services: &[ServiceRegistration], opts: &RenderOptions) -> Result<String> {
    let services = robin_core::model::normalize(services.to_vec());

    let mut routes_by_frontend: BTreeMap<FrontendKey, Vec<Route>> = BTreeMap::new();
    for registration in &services {
        for selector in &registration.selectors {
            let key = frontend_key_for(registration, selector);
            if key.public && opts.exclude_public {
                continue;
            }
            if !key.public && opts.exclude_private {
                continue;
            }
            routes_by_frontend
                .entry(key)
                .or_default()
                .push(Route { registration, selector });
        }
    }

    if !opts.exclude_public {
        routes_by_frontend
            .entry(FrontendKey { port: PUBLIC_HTTP_PORT, public: true, mode: Mode::Http })
            .or_default();
    }
    if !opts.exclude_private {
        routes_by_frontend
            .entry(FrontendKey { port: PRIVATE_HTTP_PORT, public: false, mode: Mode::Http })
            .or_default();
    }

    let public_http_key = FrontendKey { port: PUBLIC_HTTP_PORT, public: true, mode: Mode::Http };
    let certs = collect_certs(routes_by_frontend.get(&public_http_key), &opts.ssl_certs_dir);
    let has_https_sibling = !opts.exclude_public && !certs.is_empty();

    let backend_names = precompute_backend_names(&routes_by_frontend);

    let mut out = String::new();
    render_global_and_defaults(&mut out, opts);
    render_userlists(&mut out, &routes_by_frontend);

    let mut backends = BackendAccumulator::default();

    for (key, routes) in &routes_by_frontend {
        render_frontend(&mut out, *key, *key, routes, opts, &certs, false, &backend_names, &mut backends)?;
    }

    if has_https_sibling {
        let routes: Vec<Route> = routes_by_frontend[&public_http_key]
            .iter()
            .map(|r| Route { registration: r.registration, selector: r.selector })
            .collect();
        let https_key = FrontendKey { port: PUBLIC_HTTPS_PORT, public: true, mode: Mode::Http };
        render_frontend(&mut out, https_key, public_http_key, &routes, opts, &certs, true, &backend_names, &mut backends)?;
    }

    render_backends(&mut out, &backends)?;
    render_fallback(&mut out);
    render_stats(&mut out, opts);

    Ok(out)
}

fn collect_certs(routes: Option<&Vec<Route>>, certs_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = BTreeSet::new();
    if let Some(routes) = routes {
        for route in routes {
            if !route.registration.public || route.selector.private {
                continue;
            }
            if let Some(path) = cert_path(route.selector, certs_dir) {
                if let Some(parent) = path.parent() {
                    dirs.insert(parent.to_path_buf());
                }
            }
        }
    }
    dirs.into_iter().collect()
}

fn render_global_and_defaults(out: &mut String, opts: &RenderOptions) {
    out.push_str("global\n");
    out.push_str("    daemon\n");
    out.push_str("    maxconn 65536\n");
    out.push_str("    log /dev/log local0\n");
    out.push_str("    tune.ssl.default-dh-param 2048\n");
    out.push_str("    ssl-default-bind-ciphers ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384\n");
    out.push_str("    ssl-default-bind-options no-sslv3 no-tls-tickets\n");
    out.push('\n');

    out.push_str("defaults\n");
    out.push_str("    mode tcp\n");
    out.push_str("    option http-server-close\n");
    out.push_str("    option dontlognull\n");
    out.push_str("    timeout connect 5s\n");
    out.push_str("    timeout client 50s\n");
    out.push_str("    timeout server 50s\n");
    out.push_str("    errorfile 503 /etc/haproxy/errors/503.http\n");
    let _ = opts;
    out.push('\n');
}

fn userlist_name(registration: &ServiceRegistration, selector: &ServiceSelector, routes: &[Route]) -> String {
    let idx = routes.iter().position(|r| std::ptr::eq(r.selector, selector)).unwrap_or(0);
    format!("userlist_{}_{}_{idx}", registration.service_name, registration.service_port)
}

fn render_userlists(out: &mut String, routes_by_frontend: &BTreeMap<FrontendKey, Vec<Route>>) {
    let mut emitted = BTreeSet::new();
    for routes in routes_by_frontend.values() {
        for route in routes {
            if route.selector.users.is_empty() {
                continue;
            }
            let name = userlist_name(route.registration, route.selector, routes);
            if !emitted.insert(name.clone()) {
                continue;
            }
            let _ = writeln!(out, "userlist {name}");
            let mut users = route.selector.users.clone();
            users.sort_by(|a, b| a.name.cmp(&b.name));
            for user in &users {
                let _ = writeln!(out, "    user {} password {}", user.name, user.password_hash);
            }
            out.push('\n');
        }
    }
}

/// Accumulates backend definitions across every frontend that references them.
#[derive(Default)]
struct BackendAccumulator<'a> {
    backends: BTreeMap<String, BackendGroup<'a>>,
    order: Vec<String>,
}

struct BackendGroup<'a> {
    mode: Mode,
    sticky: Option<bool>,
    http_check: Option<(String, String)>,
    allow_unauthorized: bool,
    members: Vec<(&'a ServiceRegistration, &'a ServiceInstance)>,
}

#[allow(clippy::too_many_arguments)]
fn render_frontend(
    out: &mut String,
    key: FrontendKey,
    naming_key: FrontendKey,
    routes: &[Route],
    opts: &RenderOptions,
    certs: &[PathBuf],
    is_https_sibling: bool,
    backend_names: &BTreeMap<(FrontendKey, String), String>,
    backends: &mut BackendAccumulator,
) -> Result<()> {
    let name = if is_https_sibling { "public_https_in_443".to_string() } else { key.name() };
    let is_secure = is_https_sibling;
    let bind_host = if key.public {
        opts.public_host.as_deref().unwrap_or("*")
    } else {
        opts.private_host.as_deref().unwrap_or("*")
    };

    let _ = writeln!(out, "frontend {name}");
    if key.mode == Mode::Tcp {
        out.push_str("    mode tcp\n");
    } else {
        out.push_str("    mode http\n");
    }

    if is_https_sibling {
        let crt_list = certs.iter().map(|d| format!("crt {}", d.display())).collect::<Vec<_>>().join(" ");
        let _ = writeln!(out, "    bind {bind_host}:{PUBLIC_HTTPS_PORT} ssl {crt_list} no-sslv3");
    } else if key.mode == Mode::Tcp && !key.public {
        if let Some(cert) = &opts.private_ssl_cert {
            let _ = writeln!(
                out,
                "    bind {bind_host}:{} ssl generate-certificates ca-sign-file {} crt {}",
                key.port,
                cert.display(),
                cert.display()
            );
        } else {
            let _ = writeln!(out, "    bind {bind_host}:{}", key.port);
        }
    } else {
        let _ = writeln!(out, "    bind {bind_host}:{}", key.port);
    }

    let groups = group_routes(routes);
    let populate_backends = !is_https_sibling;

    let mut acl_counter = 0usize;
    for (rk, group) in &groups {
        let lead = group[0];
        let backend_name = backend_names
            .get(&(naming_key, rk.clone()))
            .cloned()
            .unwrap_or_else(|| format!("backend_{}_{}_{}", lead.registration.service_name, lead.registration.service_port, naming_key.name()));

        if populate_backends {
            accumulate_backend(backends, &backend_name, key.mode, group)?;
        }

        let mut acl_names = Vec::new();
        let host_secure = is_secure || key.mode == Mode::Tcp;
        if !lead.selector.domain.is_empty() {
            let acl = format!("acl{acl_counter}");
            acl_counter += 1;
            if host_secure {
                let _ = writeln!(out, "    acl {acl} ssl_fc_sni -i {}", lead.selector.domain);
            } else {
                let _ = writeln!(out, "    acl {acl} hdr_dom(host) -i {}", lead.selector.domain);
            }
            acl_names.push(acl);
        }
        if !lead.selector.path_prefix.is_empty() {
            let acl = format!("acl{acl_counter}");
            acl_counter += 1;
            let _ = writeln!(out, "    acl {acl} path_beg {}", lead.selector.path_prefix);
            acl_names.push(acl);
        }
        if acl_names.is_empty() && key.mode == Mode::Tcp {
            let acl = format!("acl{acl_counter}");
            acl_counter += 1;
            let _ = writeln!(out, "    acl {acl} always_true");
            acl_names.push(acl);
        }

        let auth_acl = if !lead.selector.users.is_empty() {
            let auth = format!("auth{acl_counter}");
            acl_counter += 1;
            let userlist = userlist_name(lead.registration, lead.selector, routes);
            let _ = writeln!(out, "    acl {auth} http_auth({userlist})");
            Some(auth)
        } else {
            None
        };

        let acl_cond = acl_names.join(" ");

        let redirect_to_https = !is_secure
            && opts.force_ssl
            && !lead.selector.allow_insecure
            && !lead.selector.domain.is_empty()
            && key.mode == Mode::Http;

        let replaced_by_domain_redirect = lead.selector.rewrite_rules.iter().find_map(|r| r.domain.as_ref());

        for rule in &lead.selector.rewrite_rules {
            if let Some(prefix) = &rule.path_prefix {
                let _ = writeln!(out, "    http-request set-path {prefix}%[path] if {acl_cond}");
            }
            if let Some(prefix) = &rule.remove_path_prefix {
                let escaped = prefix.replace('.', "\\.").replace('/', "\\/");
                let _ = writeln!(out, "    reqrep ^{escaped}(.*) \\1 if {acl_cond}");
            }
        }

        if let Some(domain) = replaced_by_domain_redirect {
            let scheme = if is_secure { "https" } else { "http" };
            let _ = writeln!(out, "    http-request redirect prefix {scheme}://{domain} if {acl_cond}");
            continue;
        }

        if redirect_to_https {
            let _ = writeln!(out, "    http-request redirect scheme https if !{{ ssl_fc }} {acl_cond}");
            continue;
        }

        if let Some(auth) = &auth_acl {
            let _ = writeln!(out, "    http-request allow if {acl_cond} {auth}");
            let _ = writeln!(out, "    http-request auth if {acl_cond} !{auth}");
        }

        if acl_cond.is_empty() {
            let _ = writeln!(out, "    default_backend {backend_name}");
        } else {
            let _ = writeln!(out, "    use_backend {backend_name} if {acl_cond}");
        }
    }

    out.push_str("    default_backend fallback\n\n");
    Ok(())
}

fn accumulate_backend<'a>(backends: &mut BackendAccumulator<'a>, name: &str, mode: Mode, routes: &[&Route<'a>]) -> Result<()> {
    if !backends.backends.contains_key(name) {
        backends.order.push(name.to_string());
    }
    let entry = backends.backends.entry(name.to_string()).or_insert_with(|| BackendGroup {
        mode,
        sticky: None,
        http_check: None,
        allow_unauthorized: routes[0].selector.allow_unauthorized,
        members: Vec::new(),
    });

    for route in routes {
        let reg = route.registration;
        match entry.sticky {
            None => entry.sticky = Some(reg.sticky),
            Some(existing) if existing != reg.sticky => {
                return Err(RenderError::Conflict { backend: name.to_string(), field: "sticky" });
            }
            _ => {}
        }
        if let (Some(method), Some(path)) = (&reg.http_check_method, &reg.http_check_path) {
            let pair = (method.clone(), path.clone());
            match &entry.http_check {
                None => entry.http_check = Some(pair),
                Some(existing) if *existing != pair => {
                    return Err(RenderError::Conflict { backend: name.to_string(), field: "http_check" });
                }
                _ => {}
            }
        }
        for instance in &reg.instances {
            entry.members.push((reg, instance));
        }
    }
    Ok(())
}

fn render_backends(out: &mut String, backends: &BackendAccumulator) -> Result<()> {
    for name in &backends.order {
        let group = &backends.backends[name];
        let _ = writeln!(out, "backend {name}");
        if group.mode == Mode::Tcp {
            out.push_str("    mode tcp\n");
        } else {
            out.push_str("    mode http\n");
        }

        let balance = if group.sticky.unwrap_or(false) { "source" } else { "roundrobin" };
        let _ = writeln!(out, "    balance {balance}");

        if group.mode == Mode::Http && !group.allow_unauthorized {
            out.push_str("    http-response set-header Strict-Transport-Security \"max-age=15768000\"\n");
            out.push_str("    http-response set-header X-Frame-Options DENY\n");
            out.push_str("    http-response set-header X-XSS-Protection \"1; mode=block\"\n");
            out.push_str("    http-response set-header X-Content-Type-Options nosniff\n");
        }

        if let Some((method, path)) = &group.http_check {
            let _ = writeln!(out, "    option httpchk {method} {path}");
        }

        let mut members = group.members.clone();
        members.sort_by(|a, b| a.1.full_string().cmp(&b.1.full_string()));

        for (i, (reg, instance)) in members.iter().enumerate() {
            let id = server_id(i, &instance.ip, instance.port);
            let mut tokens = Vec::new();
            if group.http_check.is_some() || reg.backup {
                tokens.push("check");
            }
            if reg.backup {
                tokens.push("backup");
            }
            let suffix = if tokens.is_empty() { String::new() } else { format!(" {}", tokens.join(" ")) };
            let _ = writeln!(out, "    server {id} {}:{}{suffix}", instance.ip, instance.port);
        }
        out.push('\n');
    }
    Ok(())
}

fn render_fallback(out: &mut String) {
    out.push_str("backend fallback\n");
    out.push_str("    mode http\n");
    out.push_str("    http-request deny deny_status 503\n\n");
}

fn render_stats(out: &mut String, opts: &RenderOptions) {
    let _ = writeln!(out, "listen stats");
    let _ = writeln!(out, "    bind *:{}", opts.stats_port);
    out.push_str("    mode http\n");
    out.push_str("    stats enable\n");
    out.push_str("    stats uri /\n");
    if let (Some(user), Some(password)) = (&opts.stats_user, &opts.stats_password) {
        let _ = writeln!(out, "    stats auth {user}:{password}");
    }
    if let Some(cert) = &opts.stats_ssl_cert {
        let _ = writeln!(out, "    bind *:{} ssl crt {}", opts.stats_port, cert.display());
    }
}
