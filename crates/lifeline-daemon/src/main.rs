//! lifeline-daemon - LifeLine emergency lifecycle daemon.
//!
//! Loads the TOML configuration, opens the record store, starts the
//! maintenance sweeps and serves the HTTP API until SIGINT or SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lifeline_core::clock::SystemClock;
use lifeline_core::config::{LifelineConfig, StoreBackend};
use lifeline_core::geo::{GeoIndex, InMemoryGeoIndex};
use lifeline_core::notify::LogNotificationSink;
use lifeline_core::rate_limit::RateLimiter;
use lifeline_core::store::{EmergencyStore, InMemoryEmergencyStore, SqliteEmergencyStore};
use lifeline_daemon::api::{self, AppState};
use lifeline_daemon::metrics::new_shared_registry;
use lifeline_daemon::service::{LifecycleService, ServiceConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// lifeline daemon - emergency lifecycle and helper dispatch
#[derive(Parser, Debug)]
#[command(name = "lifeline-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply if it does not exist)
    #[arg(short, long, default_value = "lifeline.toml")]
    config: PathBuf,

    /// Listen address, overriding `server.listen_addr`
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// `SQLite` database path, overriding `store.sqlite_path`
    #[arg(long)]
    db: Option<PathBuf>,

    /// Keep records in memory only
    #[arg(long, conflicts_with = "db")]
    in_memory: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = LifelineConfig::from_file_or_default(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen.to_string();
    }
    if let Some(db) = &args.db {
        config.store.backend = StoreBackend::Sqlite;
        config.store.sqlite_path = db.clone();
    }
    if args.in_memory {
        config.store.backend = StoreBackend::Memory;
    }
    config.validate().context("invalid configuration")?;

    let store: Arc<dyn EmergencyStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("using in-memory store; records are lost on restart");
            Arc::new(InMemoryEmergencyStore::new())
        },
        StoreBackend::Sqlite => {
            let path = &config.store.sqlite_path;
            info!(path = %path.display(), "opening SQLite store");
            Arc::new(
                SqliteEmergencyStore::open(path)
                    .with_context(|| format!("failed to open store at {}", path.display()))?,
            )
        },
    };

    let helper_index = Arc::new(InMemoryGeoIndex::new());
    let geo: Arc<dyn GeoIndex> = Arc::clone(&helper_index) as Arc<dyn GeoIndex>;
    let mut service = LifecycleService::new(
        store,
        geo,
        Arc::new(LogNotificationSink),
        Arc::new(SystemClock),
        ServiceConfig::from_config(&config),
    );

    let metrics_registry = if config.server.metrics_enabled {
        let registry = new_shared_registry().context("failed to register metrics")?;
        service = service.with_metrics(registry.lifeline_metrics().clone());
        Some(registry)
    } else {
        info!("metrics disabled");
        None
    };
    let service = Arc::new(service);

    let mut state = AppState::new(Arc::clone(&service)).with_helper_locations(helper_index);
    if let Some(registry) = metrics_registry {
        state = state.with_metrics(registry);
    }
    if config.rate_limit.enabled {
        state = state.with_rate_limiter(Arc::new(RateLimiter::<IpAddr>::new(
            config.rate_limit.clone(),
        )));
    }

    let maintenance = config.maintenance.enabled.then(|| {
        let service = Arc::clone(&service);
        let period = config.maintenance.interval();
        info!(interval_secs = period.as_secs(), "starting maintenance sweeps");
        tokio::spawn(run_maintenance(service, period))
    });

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "LifeLine daemon listening");

    axum::serve(
        listener,
        api::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server error")?;

    if let Some(task) = maintenance {
        task.abort();
    }
    info!("LifeLine daemon stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Runs the stale-emergency sweep and the retention purge every `period`.
/// Failures are logged and the loop continues.
async fn run_maintenance(service: Arc<LifecycleService>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match service.expire_stale().await {
            Ok(0) => {},
            Ok(expired) => info!(expired, "stale emergencies timed out"),
            Err(e) => error!(error = %e, "stale sweep failed"),
        }
        if let Err(e) = service.purge_expired().await {
            error!(error = %e, "retention purge failed");
        }
    }
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to register SIGTERM handler: {e}");
            return std::future::pending().await;
        },
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to register SIGINT handler: {e}");
            return std::future::pending().await;
        },
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
