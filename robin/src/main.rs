//! Robin — edge load-balancer control plane.
//!
//! Entry point for the `robin` binary: wires a topology source, the ACME
//! subsystem, the front-end registry API, and the reconciler together per
//! the configured `--backend`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use robin_config::RenderOptions;
use robin_core::config::{Backend, RegisterAcmeArgs, RunArgs};
use robin_proxy::ProxySupervisor;
use robin_reconciler::Reconciler;
use robin_tls::{AcmeManager, EtcdKvStore, KvStore};
use robin_topology::{EtcdTopologySource, KubernetesTopologySource, TopologySource};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Spec §5: grace period between the first termination signal and exit.
const OS_EXIT_DELAY: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "robin", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile cluster topology into the external proxy's configuration.
    Run(RunArgs),
    /// Interactively bootstrap an ACME account.
    RegisterAcme(RegisterAcmeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_tracing(args.log_level.as_filter_directive());
            run(args).await
        }
        Commands::RegisterAcme(args) => {
            init_tracing("info");
            register_acme(args).await
        }
    }
}

fn init_tracing(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn etcd_endpoints(args: &RunArgs) -> Vec<String> {
    if args.etcd_endpoints.is_empty() {
        vec![args.etcd_addr.clone()]
    } else {
        args.etcd_endpoints.clone()
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    spawn_signal_handler();

    let endpoints = etcd_endpoints(&args);

    let source: Arc<dyn TopologySource> = match args.backend {
        Backend::Etcd => Arc::new(EtcdTopologySource::connect(&endpoints, args.etcd_path.clone()).await?),
        Backend::Kubernetes => Arc::new(KubernetesTopologySource::try_default().await?),
    };

    let kv: Arc<dyn KvStore> = Arc::new(EtcdKvStore::connect(&endpoints, args.etcd_path.clone()).await?);

    let acme = AcmeManager::start(
        kv.clone(),
        &args.acme_directory_url,
        args.acme_email.as_deref(),
        Some(&args.private_key_path()),
        Some(&args.registration_path()),
        args.key_bits,
        args.tmp_certificate_path.clone(),
        args.acme_http_port,
    )
    .await?;

    if let Some(manager) = &acme {
        manager.spawn_background_tasks();
    }

    let registry = robin_api::FrontendRegistry::new(kv.clone());
    let api_addr: SocketAddr = format!("{}:{}", args.api_host, args.api_port).parse()?;
    tokio::spawn(async move {
        if let Err(err) = robin_api::run(api_addr, registry).await {
            tracing::error!(%err, "front-end registry api exited");
        }
    });

    let proxy = ProxySupervisor::new("haproxy", args.haproxy_conf.clone());
    let options = render_options(&args);

    Reconciler::new(source, acme, proxy, options).run().await;
    Ok(())
}

async fn register_acme(args: RegisterAcmeArgs) -> anyhow::Result<()> {
    let key_path = robin_core::config::expand_tilde(&args.private_key_path);
    let registration_path = robin_core::config::expand_tilde(&args.registration_path);

    robin_tls::acme::ensure_account_key(&key_path, args.key_bits).await?;
    robin_tls::acme::AcmeClient::register(&args.acme_directory_url, &args.acme_email, &registration_path).await?;

    println!("registered acme account for {}", args.acme_email);
    println!("  private key:  {}", key_path.display());
    println!("  registration: {}", registration_path.display());
    Ok(())
}

fn render_options(args: &RunArgs) -> RenderOptions {
    RenderOptions {
        ssl_certs_dir: args.ssl_certs.clone(),
        force_ssl: args.force_ssl,
        private_ssl_cert: args.private_ssl_cert.as_ref().map(PathBuf::from),
        public_host: args.public_host.clone(),
        private_host: args.private_host.clone(),
        exclude_public: args.exclude_public,
        exclude_private: args.exclude_private,
        stats_port: args.stats_port,
        stats_user: args.stats_user.clone(),
        stats_password: args.stats_password.clone(),
        stats_ssl_cert: args.stats_ssl_cert.as_ref().map(PathBuf::from),
    }
}

/// Spec §5: the first `SIGINT`/`SIGTERM` sets a shutdown flag and schedules
/// exit after [`OS_EXIT_DELAY`]; a second signal exits immediately.
fn spawn_signal_handler() {
    tokio::spawn(async move {
        let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let shutting_down = AtomicBool::new(false);

        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }

            if shutting_down.swap(true, Ordering::SeqCst) {
                tracing::warn!("second termination signal received, exiting immediately");
                std::process::exit(0);
            }

            tracing::info!(delay = ?OS_EXIT_DELAY, "termination signal received, scheduling exit");
            tokio::spawn(async move {
                tokio::time::sleep(OS_EXIT_DELAY).await;
                std::process::exit(0);
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
