//! Lotkeeper daemon.
//!
//! Listens for camera gateway connections, drives verification requests
//! and heartbeats, and reconciles periodic full scans against the
//! occupancy database.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use lotkeeper_core::config::{Config, VerificationConfig};
use lotkeeper_core::tracing_init::init_tracing;

use lotkeeper_daemon::heartbeat::spawn_heartbeat_task;
use lotkeeper_daemon::notify::notifier_from_config;
use lotkeeper_daemon::reconcile::Reconciler;
use lotkeeper_daemon::registry::ConnectionRegistry;
use lotkeeper_daemon::server::{run_gateway_listener, run_scan_listener};
use lotkeeper_daemon::storage::Database;
use lotkeeper_daemon::verify::Coordinator;

#[derive(Parser, Debug)]
#[command(name = "lotkeeper-daemon")]
#[command(version, about = "Lotkeeper daemon - parking facility gateway coordinator")]
struct Args {
    /// JSON configuration file; flags and env vars override its values.
    #[arg(long, env = "LOTKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for the gateway protocol listener [default: 0.0.0.0:9410].
    #[arg(long, env = "LOTKEEPER_GATEWAY_ADDR")]
    gateway_addr: Option<SocketAddr>,

    /// Bind address for the full-scan listener [default: 0.0.0.0:9411].
    #[arg(long, env = "LOTKEEPER_SCAN_ADDR")]
    scan_addr: Option<SocketAddr>,

    /// Database file path.
    #[arg(long, env = "LOTKEEPER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Seconds to wait for a gateway reply before falling back [default: 10].
    #[arg(long, env = "LOTKEEPER_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Seconds between heartbeat probes [default: 30].
    #[arg(long, env = "LOTKEEPER_HEARTBEAT_INTERVAL")]
    heartbeat_interval: Option<u64>,

    /// Disable camera verification; every request takes the fallback path.
    #[arg(long, env = "LOTKEEPER_NO_CAMERA_VERIFICATION")]
    no_camera_verification: bool,

    /// Webhook endpoint for notification dispatch.
    #[arg(long, env = "LOTKEEPER_NOTIFY_WEBHOOK")]
    notify_webhook: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn") [default: info].
    #[arg(long, env = "LOTKEEPER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LOTKEEPER_LOG_JSON")]
    log_json: bool,
}

/// Effective settings: CLI flags and env vars layered over the config
/// file (or its defaults when no file is given).
struct Settings {
    gateway_addr: SocketAddr,
    scan_addr: SocketAddr,
    db_path: Option<PathBuf>,
    log_level: String,
    verification: VerificationConfig,
}

fn resolve(args: Args, base: Config) -> Settings {
    Settings {
        gateway_addr: args
            .gateway_addr
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, base.daemon.gateway_port))),
        scan_addr: args
            .scan_addr
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, base.daemon.scan_port))),
        db_path: args.db_path.or(base.daemon.database_path),
        log_level: args.log_level.unwrap_or(base.daemon.log_level),
        verification: VerificationConfig {
            request_timeout_secs: args
                .request_timeout
                .unwrap_or(base.verification.request_timeout_secs),
            heartbeat_interval_secs: args
                .heartbeat_interval
                .unwrap_or(base.verification.heartbeat_interval_secs),
            camera_verification_enabled: base.verification.camera_verification_enabled
                && !args.no_camera_verification,
            notify_webhook: args.notify_webhook.or(base.verification.notify_webhook),
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_json = args.log_json;

    let base = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let settings = resolve(args, base);

    init_tracing(&format!("lotkeeper_daemon={}", settings.log_level), log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gateway = %settings.gateway_addr,
        scan = %settings.scan_addr,
        "Starting lotkeeper-daemon"
    );

    let db = match settings.db_path {
        Some(path) => {
            info!(path = %path.display(), "Opening database");
            Database::open(&path).await?
        }
        None => {
            let default_path = default_db_path()?;
            info!(path = %default_path.display(), "Opening database (default path)");
            Database::open(&default_path).await?
        }
    };

    let verification = settings.verification;

    let registry = ConnectionRegistry::new();
    let notifier = notifier_from_config(verification.notify_webhook.as_ref());
    let coordinator = Coordinator::new(
        db.clone(),
        registry.clone(),
        notifier.clone(),
        verification.clone(),
    );
    let reconciler = Reconciler::new(db.clone(), notifier);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let heartbeat = spawn_heartbeat_task(
        registry.clone(),
        Duration::from_secs(verification.heartbeat_interval_secs),
        shutdown_rx,
    );

    let gateway_listener = TcpListener::bind(settings.gateway_addr).await?;
    let scan_listener = TcpListener::bind(settings.scan_addr).await?;
    info!("Listeners bound; serving");

    tokio::select! {
        () = run_gateway_listener(gateway_listener, db.clone(), registry, coordinator) => {}
        () = run_scan_listener(scan_listener, reconciler) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = heartbeat.await;
    info!("Shutdown complete");
    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".lotkeeper").join("lotkeeper.db"))
}
