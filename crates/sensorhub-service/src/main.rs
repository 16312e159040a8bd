//! Sensorhub - device hub service.
//!
//! Run with: `cargo run -p sensorhub-service`

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use sensorhub_core::{
    Awakener, ErrorHandler, FanoutStarter, FanoutStopper, LocalMonotonicClock, LocalSystemClock,
    ResolveStore, Starter, Stopper, SystemClock, TaskRunner, TaskRunnerParams,
};
use sensorhub_service::api::{self, AppState, TIME_START_POINT};
use sensorhub_service::config::Config;
use sensorhub_service::discovery::{
    AutodiscoveryHandler, BrowseTask, FanoutServiceHandler, ResolveServiceHandler,
};
use sensorhub_service::registry::{CacheStoreParams, HttpParams, TimeSyncParams};
use sensorhub_service::zeroconf::{ZeroconfAnnouncer, ZeroconfBrowser};
use sensorhub_service::{AwakeStore, CacheStore, Store, StoreAliveMonitor};
use sensorhub_store::{DatabaseStopper, PipelineParams, SamplePipeline, SqliteDb};
use sensorhub_types::Error;

/// Sensorhub - device hub with autodiscovery and telemetry collection.
#[derive(Parser, Debug)]
#[command(name = "sensorhub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Admin API port (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Cache directory (overrides config).
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

/// Awakener used when discovery is disabled.
struct NoopAwakener;

impl Awakener for NoopAwakener {
    fn awake(&self) {}
}

/// Error handler for the browse runner.
struct BrowseErrorHandler;

impl ErrorHandler for BrowseErrorHandler {
    fn handle_error(&self, err: Error) {
        error!(%err, "failed to browse local network");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(cache_dir) = args.cache_dir {
        config.storage.cache_dir = cache_dir;
    }

    config.validate()?;

    let cancel = CancellationToken::new();
    let mut starter = FanoutStarter::default();
    let mut stopper = FanoutStopper::default();

    // Registered first so it stops last: everything else still writes
    // during teardown.
    let db = Arc::new(
        SqliteDb::open(config.storage.cache_dir.join("registry.db"))
            .context("failed to open registration database")?,
    );
    stopper.add(
        "registration-database",
        Arc::new(DatabaseStopper::new(db.clone())),
    );

    let pipeline = Arc::new(
        SamplePipeline::open(
            config.storage.cache_dir.join("samples.db"),
            PipelineParams {
                restore_range_days: config.storage.restore_range_days,
            },
        )
        .context("failed to open sample database")?,
    );

    let resolve_store = Arc::new(ResolveStore::new());

    let service_handler = Arc::new(FanoutServiceHandler::new());
    service_handler.add(Arc::new(ResolveServiceHandler::new(resolve_store.clone())));

    // The browse runner doubles as the awakener: adding a device through
    // the admin API triggers an immediate browse round.
    let awakener: Arc<dyn Awakener> = if config.mdns.browse.enabled {
        let browser = Arc::new(
            ZeroconfBrowser::new(Duration::from_secs(config.mdns.browse.timeout))
                .context("failed to create mDNS browser")?,
        );
        stopper.add("mdns-zeroconf-browser", browser.clone());

        let runner = Arc::new(TaskRunner::new(
            cancel.clone(),
            Arc::new(BrowseTask::new(browser, service_handler.clone())),
            Some(Arc::new(BrowseErrorHandler)),
            TaskRunnerParams {
                update_interval: Duration::from_secs(config.mdns.browse.interval),
                ..Default::default()
            },
        ));
        starter.add(runner.clone());
        stopper.add("mdns-browser-runner", runner.clone());

        runner
    } else {
        Arc::new(NoopAwakener)
    };

    let local_clock: Arc<dyn SystemClock> = Arc::new(LocalSystemClock);

    let cache_store = Arc::new(
        CacheStore::new(
            cancel.clone(),
            local_clock.clone(),
            pipeline.clone(),
            pipeline.clone(),
            db.clone(),
            resolve_store.clone(),
            CacheStoreParams {
                http: HttpParams {
                    fetch_interval: Duration::from_secs(config.device.fetch_interval),
                    fetch_timeout: Duration::from_secs(config.device.fetch_timeout),
                },
                time_sync: TimeSyncParams {
                    disable: !config.device.time_sync.enabled,
                    max_drift_interval: Duration::from_secs(config.device.time_sync.max_drift),
                    restore_interval: Duration::from_secs(
                        config.device.time_sync.restore_interval,
                    ),
                },
            },
        )
        .await
        .map_err(|err| anyhow::anyhow!("failed to restore device store: {err}"))?,
    );
    starter.add(cache_store.clone());
    stopper.add("device-cache-store", cache_store.clone());

    let awake_store = Arc::new(AwakeStore::new(awakener, cache_store.clone()));

    let device_store: Arc<dyn Store> = if config.device.inactive.enabled {
        let monitor = StoreAliveMonitor::new(
            Arc::new(LocalMonotonicClock::default()),
            awake_store,
            Duration::from_secs(config.device.inactive.max_interval),
        )
        .await;

        cache_store.set_alive_monitor(Arc::new(monitor.clone()));

        let runner = Arc::new(TaskRunner::new(
            cancel.clone(),
            monitor.clone(),
            Some(monitor.clone()),
            TaskRunnerParams {
                update_interval: Duration::from_secs(config.device.inactive.update_interval),
                ..Default::default()
            },
        ));
        starter.add(runner.clone());
        stopper.add("device-alive-monitor-runner", runner);

        monitor
    } else {
        awake_store
    };

    if config.mdns.autodiscovery {
        service_handler.add(Arc::new(AutodiscoveryHandler::new(device_store.clone())));
    }

    if config.mdns.server.enabled {
        let announcer = Arc::new(
            ZeroconfAnnouncer::new(&config.mdns.server.hostname, config.server.port)
                .map_err(|err| anyhow::anyhow!("failed to create mDNS announcer: {err}"))?,
        );
        starter.add(announcer.clone());
        stopper.add("mdns-server", announcer);
    }

    let state = Arc::new(AppState {
        store: device_store,
        clock: local_clock,
        time_start_point: TIME_START_POINT,
    });
    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    starter
        .start()
        .await
        .map_err(|err| anyhow::anyhow!("failed to start: {err}"))?;

    info!(%addr, "sensorhub started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // The signal handler cancelled the scope already; stop the runners
    // and release the databases.
    stopper.stop().await.ok();

    info!("graceful shutdown complete");

    Ok(())
}

/// Wait for a termination signal, then cancel the application scope.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!(%err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, stopping services");

    cancel.cancel();
}
