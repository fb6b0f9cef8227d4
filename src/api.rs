//! HTTP API surface, `spec.md` §6. Structured the way the teacher's
//! `server.rs` builds its router: one `AppState` carrying `Arc`-shared
//! state, handlers wired with `.with_state(state)`.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ApiConfig;
use crate::scanner_driver::ZmapStatsView;
use crate::snapshot::SnapshotStore;
use crate::types::{Protocol, Snapshot};

type IpRateLimiter = RateLimiter<
    IpAddr,
    governor::state::keyed::DefaultKeyedStateStore<IpAddr>,
    governor::clock::DefaultClock,
>;

#[derive(Clone)]
pub struct AppState {
    pub snapshots: Arc<SnapshotStore>,
    pub config: Arc<ApiConfig>,
    pub api_key: Arc<Option<String>>,
    pub rate_limiter: Arc<Option<IpRateLimiter>>,
    pub reload_tx: mpsc::Sender<()>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub zmap_stats: Arc<dyn Fn() -> ZmapStatsView + Send + Sync>,
    pub namespace: Arc<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/get-proxy", get(get_proxy))
        .route("/stat", get(stat))
        .route("/reload", post(reload))
        .route("/stats/zmap", get(stats_zmap))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_and_rate_limit,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics_handle.render())
}

/// Authenticates (`X-Api-Key` / `?key=`) and enforces the per-IP token
/// bucket, per §6. `/health` and `/metrics` require neither and are
/// exempted by path below.
async fn auth_and_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let path = request.uri().path();
    if path == "/health" || path == "/metrics" {
        return next.run(request).await;
    }

    if state.config.enable_api_key_auth {
        if let Some(expected) = state.api_key.as_ref() {
            let provided = headers
                .get("X-Api-Key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .or_else(|| query_param(request.uri().query().unwrap_or(""), "key"));
            if provided.as_deref() != Some(expected.as_str()) {
                return err_response(
                    StatusCode::UNAUTHORIZED,
                    "Invalid or missing API key",
                );
            }
        }
    }

    if state.config.enable_ip_rate_limit {
        if let Some(limiter) = state.rate_limiter.as_ref() {
            if limiter.check_key(&addr.ip()).is_err() {
                return err_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
            }
        }
    }

    next.run(request).await
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

fn err_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[derive(Debug, Deserialize)]
struct GetProxyQuery {
    limit: Option<String>,
    all: Option<u8>,
    format: Option<String>,
    protocol: Option<String>,
}

#[derive(Serialize)]
struct ProxyEntry {
    address: String,
    protocol: String,
    alive: bool,
    latency_ms: u64,
    last_check: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct GetProxyResponse {
    total: usize,
    alive: usize,
    proxies: Vec<ProxyEntry>,
}

async fn get_proxy(
    State(state): State<AppState>,
    Query(q): Query<GetProxyQuery>,
) -> axum::response::Response {
    let protocol = match q.protocol.as_deref() {
        None => None,
        Some(p) => match Protocol::parse(p) {
            Some(p) => Some(p),
            None => {
                return err_response(StatusCode::BAD_REQUEST, "invalid protocol filter");
            }
        },
    };

    let all = q.all.unwrap_or(0) == 1;
    let limit: i64 = if all {
        i64::MAX
    } else {
        match q.limit.as_deref().unwrap_or("1").parse::<i64>() {
            Ok(n) => n,
            Err(_) => return err_response(StatusCode::BAD_REQUEST, "limit must be an integer"),
        }
    };
    if limit <= 0 {
        return err_response(StatusCode::BAD_REQUEST, "limit must be > 0");
    }

    let proxies = if all {
        state.snapshots.get_all(protocol)
    } else {
        state.snapshots.get_n(limit as usize, protocol)
    };

    if proxies.is_empty() {
        return err_response(StatusCode::SERVICE_UNAVAILABLE, "No alive proxies available");
    }

    let format_json = q.format.as_deref() == Some("json");
    if format_json {
        let total = state.snapshots.get().proxies.len();
        let body = GetProxyResponse {
            total,
            alive: proxies.len(),
            proxies: proxies
                .into_iter()
                .map(|p| ProxyEntry {
                    address: p.address,
                    protocol: p.protocol.to_string(),
                    alive: true,
                    latency_ms: p.latency_ms,
                    last_check: p.last_check,
                })
                .collect(),
        };
        (StatusCode::OK, Json(body)).into_response()
    } else {
        let text = proxies
            .into_iter()
            .map(|p| p.address)
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        (StatusCode::OK, text).into_response()
    }
}

#[derive(Serialize)]
struct SourceStatView {
    url: String,
    proxies_found: u64,
    error: String,
}

#[derive(Serialize)]
struct StatResponse {
    total_scraped: u64,
    total_alive: u64,
    total_dead: u64,
    alive_percent: String,
    last_check: Option<chrono::DateTime<chrono::Utc>>,
    updated: chrono::DateTime<chrono::Utc>,
    sources: std::collections::HashMap<String, SourceStatView>,
}

async fn stat(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot: Arc<Snapshot> = state.snapshots.get();
    let body = StatResponse {
        total_scraped: snapshot.stats.total_scraped,
        total_alive: snapshot.stats.total_alive,
        total_dead: snapshot.stats.total_dead,
        alive_percent: format!("{:.2}%", snapshot.stats.alive_percent),
        last_check: snapshot.stats.last_check_time,
        updated: snapshot.updated,
        sources: snapshot
            .stats
            .sources
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    SourceStatView {
                        url: v.url.clone(),
                        proxies_found: v.proxies_found,
                        error: v.error.clone(),
                    },
                )
            })
            .collect(),
    };
    (StatusCode::OK, Json(body))
}

async fn reload(State(state): State<AppState>) -> impl IntoResponse {
    // Fire-and-forget: §9 resolves "synchronous wait vs. immediate return"
    // in favor of immediate return, since a full cycle can take tens of
    // minutes.
    let _ = state.reload_tx.try_send(());
    (
        StatusCode::OK,
        Json(serde_json::json!({ "message": "Reload triggered" })),
    )
}

#[derive(Serialize)]
struct ZmapStatResponse {
    enabled: bool,
    ports: Vec<u16>,
    last_scan_time: Option<chrono::DateTime<chrono::Utc>>,
    last_scan_duration: f64,
    candidates_found: u64,
    total_scans: u64,
}

async fn stats_zmap(State(state): State<AppState>) -> impl IntoResponse {
    let view = (state.zmap_stats)();
    let body = ZmapStatResponse {
        enabled: view.enabled,
        ports: view.ports,
        last_scan_time: view.last_scan_time,
        last_scan_duration: view.last_scan_duration,
        candidates_found: view.candidates_found,
        total_scans: view.total_scans,
    };
    (StatusCode::OK, Json(body))
}

pub fn build_rate_limiter(per_minute: u32) -> IpRateLimiter {
    let burst = (per_minute / 10).max(1);
    let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
    RateLimiter::keyed(quota)
}
