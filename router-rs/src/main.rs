//! router-rs: host-based reverse proxy server

use clap::Parser;
use router_rs::authority::{CertbotAuthority, CertificateAuthority, SelfSignedAuthority};
use router_rs::challenge::ChallengeResponder;
use router_rs::config::AuthorityKind;
use router_rs::engine::ForwardEngine;
use router_rs::pages::ErrorPages;
use router_rs::store::CertificateStore;
use router_rs::table::FileSource;
use router_rs::tls::TlsManager;
use router_rs::{AppConfig, CertificateManager, CertificateSettings, Dispatcher, ProxyServer, RouteTableManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "router-rs", version, about = "Host-based reverse proxy with automatic TLS")]
struct Args {
    /// Process configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Route document, overriding `routes.file`
    #[arg(short, long)]
    routes: Option<PathBuf>,

    /// Plaintext listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// TLS listen address
    #[arg(long)]
    https_addr: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "router_rs=info,tower_http=info")]
    log_level: String,

    /// Do not reload the route document when it changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting router-rs v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            AppConfig::from_file(path)?
        }
        None => {
            info!("No config file specified, using development defaults");
            AppConfig::development()
        }
    };
    if let Some(routes) = args.routes {
        config.routes.file = routes;
    }
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(addr) = args.https_addr {
        config.server.https_addr = addr;
    }
    if args.no_watch {
        config.routes.watch = false;
    }
    config.validate()?;

    // Route table
    let tables = Arc::new(RouteTableManager::new(Arc::new(FileSource::new(
        config.routes.file.clone(),
    )))?);
    let _watcher = if config.routes.watch {
        tables.watch()?
    } else {
        None
    };

    // Certificates
    let authority: Arc<dyn CertificateAuthority> = match config.acme.authority {
        AuthorityKind::Certbot => Arc::new(
            CertbotAuthority::new(&config.acme, config.tls.webroot.clone()).map_err(anyhow::Error::msg)?,
        ),
        AuthorityKind::SelfSigned => {
            warn!("Issuing self-signed certificates, browsers will not trust them");
            Arc::new(SelfSignedAuthority::new(config.acme.self_signed_validity_days))
        }
    };
    let certs = Arc::new(CertificateManager::new(
        CertificateStore::new(config.tls.cert_dir.clone()),
        authority,
        CertificateSettings::from(&config.acme),
    ));
    let _sync = Arc::clone(&certs).start_sync_task(tables.subscribe());
    let _renewal = Arc::clone(&certs).start_renewal_task();

    let tls_acceptor = TlsManager::new(config.tls.clone(), Arc::clone(&certs)).build_acceptor()?;

    // Dispatcher and listeners
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&tables),
        ChallengeResponder::new(&config.tls.webroot),
        ForwardEngine::new(Duration::from_secs(config.server.request_timeout_seconds)),
        ErrorPages::new(config.errors.clone()),
    ));
    let server = ProxyServer::new(config.server.clone(), dispatcher, tls_acceptor);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
