use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use proxy_pool::api::{self, AppState};
use proxy_pool::config::Config;
use proxy_pool::orchestrator::Orchestrator;
use proxy_pool::persistence::build_backend;
use proxy_pool::scanner_driver::ZmapStatsView;
use proxy_pool::snapshot::SnapshotStore;

/// proxy-pool — discovers, validates, and serves open HTTP/SOCKS4/SOCKS5 proxies.
#[derive(Debug, Parser)]
#[command(name = "proxy-pool", version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = tokio::fs::read_to_string(&cli.config)
        .await
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config = Arc::new(Config::from_json(&raw).context("loading configuration")?);

    init_tracing(&config.logging.level, &config.logging.format);

    let metrics_handle = proxy_pool::metrics::install(&config.metrics.namespace);

    let backend = build_backend(&config.storage);
    let store = Arc::new(SnapshotStore::new(backend));
    store.load_from_backing_store().await;

    let cancel = CancellationToken::new();
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), store.clone(), cancel.clone()));

    let (reload_tx, reload_rx) = mpsc::channel(1);

    let api_key = std::env::var(&config.api.api_key_env).ok();
    if config.api.enable_api_key_auth && api_key.is_none() {
        warn!(
            var = %config.api.api_key_env,
            "api.enable_api_key_auth is true but the API key env var is unset; every request will be rejected"
        );
    }
    let rate_limiter = if config.api.enable_ip_rate_limit {
        Some(api::build_rate_limiter(config.api.rate_limit_per_minute))
    } else {
        None
    };

    let scanner_for_stats = orchestrator.scanner();
    let zmap_stats: Arc<dyn Fn() -> ZmapStatsView + Send + Sync> = Arc::new(move || {
        scanner_for_stats
            .as_ref()
            .map(|s| s.stats_view())
            .unwrap_or(ZmapStatsView {
                enabled: false,
                ports: Vec::new(),
                last_scan_time: None,
                last_scan_duration: 0.0,
                candidates_found: 0,
                total_scans: 0,
            })
    });

    let state = AppState {
        snapshots: store.clone(),
        config: Arc::new(config.api.clone()),
        api_key: Arc::new(api_key),
        rate_limiter: Arc::new(rate_limiter),
        reload_tx,
        metrics_handle,
        zmap_stats,
        namespace: Arc::new(config.metrics.namespace.clone()),
    };

    let addr: SocketAddr = config
        .api
        .addr
        .parse()
        .with_context(|| format!("parsing api.addr {}", config.api.addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding api.addr {addr}"))?;
    info!(%addr, "listening");

    let persist_interval = config.storage.persist_interval_seconds;
    let persist_store = store.clone();
    let persist_cancel = cancel.clone();
    let persist_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(persist_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => persist_store.persist().await,
                _ = persist_cancel.cancelled() => return,
            }
        }
    });

    let orchestrator_task = tokio::spawn(orchestrator.run(reload_rx));

    let server_cancel = cancel.clone();
    let server = axum::serve(
        listener,
        api::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        server_cancel.cancelled().await;
    });

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                warn!(error = %e, "API server exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    cancel.cancel();
    let _ = orchestrator_task.await;
    let _ = persist_task.await;
    store.persist().await;
    Ok(())
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if format.eq_ignore_ascii_case("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
