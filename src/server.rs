//! HTTP server for the degenscore wallet analysis API.
//!
//! Exposes wallet scores and the raw explorer records behind them, with
//! per-IP rate limiting on the `/api` routes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use eyre::Result;
use governor::{Quota, RateLimiter};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

use crate::address::Address;
use crate::analyzer::Analyzer;
use crate::cache::DEFAULT_SWEEP_INTERVAL;
use crate::error::AnalysisError;
use crate::records::{ActivityRecord, RecordKind};
use crate::scoring::ScoreResult;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Rate limit in requests per minute per IP (0 = no limit)
    pub rate_limit_rpm: u32,
    /// Allowed CORS origins (None/empty = allow any)
    pub allowed_origins: Option<Vec<String>>,
    /// How often expired cache entries are swept
    pub sweep_interval: Duration,
    /// Whether the explorer client has an API key
    pub api_key_configured: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            rate_limit_rpm: 60,
            allowed_origins: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            api_key_configured: false,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub cache_size: u64,
    pub api_key_configured: bool,
    pub uptime_seconds: u64,
}

/// Error body for every non-2xx response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Score with the cache flag alongside the score fields.
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse<'a> {
    #[serde(flatten)]
    pub score: &'a ScoreResult,
    pub cached: bool,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse<'a> {
    pub data: &'a [ActivityRecord],
    pub cached: bool,
}

/// Type alias for per-IP rate limiters
type IpRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Server state
pub struct ServerState {
    pub config: ServerConfig,
    pub analyzer: Analyzer,
    pub start_time: Instant,
    pub rate_limiters: Mutex<HashMap<IpAddr, Arc<IpRateLimiter>>>,
}

impl ServerState {
    pub fn new(config: ServerConfig, analyzer: Analyzer) -> Self {
        Self {
            config,
            analyzer,
            start_time: Instant::now(),
            rate_limiters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_rate_limiter(&self, ip: IpAddr) -> Option<Arc<IpRateLimiter>> {
        let rpm = NonZeroU32::new(self.config.rate_limit_rpm)?;

        let mut limiters = self.rate_limiters.lock().await;

        if let Some(limiter) = limiters.get(&ip) {
            return Some(Arc::clone(limiter));
        }

        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));
        limiters.insert(ip, Arc::clone(&limiter));

        if limiters.len() > 10000 {
            tracing::warn!("rate limiter map exceeded 10000 entries, clearing");
            limiters.clear();
            limiters.insert(ip, Arc::clone(&limiter));
        }

        Some(limiter)
    }
}

fn cors_layer(allowed_origins: &Option<Vec<String>>) -> CorsLayer {
    match allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let allowed: Vec<axum::http::HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods([axum::http::Method::GET])
                .allow_headers([axum::http::header::CONTENT_TYPE])
        }
        _ => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([axum::http::Method::GET])
            .allow_headers(Any),
    }
}

/// Build the application router. `/metrics` is mounted only when a
/// Prometheus handle is supplied.
pub fn router(state: Arc<ServerState>, prometheus: Option<PrometheusHandle>) -> Router {
    let api = Router::new()
        .route("/api/analyze/:address", get(analyze_handler))
        .route(
            "/api/transactions/:address",
            get(|state: State<Arc<ServerState>>, path: Path<String>| {
                records_handler(RecordKind::Transaction, state, path)
            }),
        )
        .route(
            "/api/nft-transactions/:address",
            get(|state: State<Arc<ServerState>>, path: Path<String>| {
                records_handler(RecordKind::NftTransfer, state, path)
            }),
        )
        .route(
            "/api/token-transactions/:address",
            get(|state: State<Arc<ServerState>>, path: Path<String>| {
                records_handler(RecordKind::TokenTransfer, state, path)
            }),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state.clone());

    let mut open = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    if let Some(handle) = prometheus {
        open = open.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    Router::new()
        .merge(open)
        .merge(api)
        .layer(cors_layer(&state.config.allowed_origins))
}

/// Run the HTTP server until Ctrl-C.
pub async fn run_server(config: ServerConfig, analyzer: Analyzer) -> Result<()> {
    let prometheus_handle = crate::metrics::install_prometheus_recorder()?;

    let sweeper = analyzer.cache().spawn_sweeper(config.sweep_interval);
    let state = Arc::new(ServerState::new(config.clone(), analyzer));
    let app = router(state.clone(), Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("degenscore server listening on {}", config.bind_addr);
    tracing::info!(
        "Endpoints: GET /, GET /health, GET /metrics, GET /api/analyze/:address, \
         GET /api/transactions/:address, GET /api/nft-transactions/:address, \
         GET /api/token-transactions/:address"
    );
    if config.rate_limit_rpm > 0 {
        tracing::info!(rate_limit_rpm = config.rate_limit_rpm, "rate limiting enabled");
    }
    if !config.api_key_configured {
        tracing::warn!("no explorer API key configured, upstream calls may be throttled");
    }
    tracing::info!(
        ttl_seconds = state.analyzer.cache().ttl().as_secs(),
        sweep_interval_seconds = config.sweep_interval.as_secs(),
        policy = ?state.analyzer.policy(),
        "analysis cache ready"
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    sweeper.abort();
    tracing::info!("server stopped");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Map an analysis failure to its HTTP status.
pub fn error_status(err: &AnalysisError) -> StatusCode {
    match err {
        AnalysisError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        AnalysisError::Fetch(_) => StatusCode::BAD_GATEWAY,
        AnalysisError::Scoring(_) | AnalysisError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &AnalysisError) -> Response {
    (
        error_status(err),
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Per-IP rate limit in front of the `/api` routes.
async fn rate_limit(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = addr.ip();
    if let Some(limiter) = state.get_rate_limiter(client_ip).await {
        if limiter.check().is_err() {
            tracing::warn!(%client_ip, path = %request.uri().path(), "rate limit exceeded");
            crate::metrics::record_rate_limit_hit();
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorResponse {
                    error: format!(
                        "Rate limit exceeded. Maximum {} requests per minute.",
                        state.config.rate_limit_rpm
                    ),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn index_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "degenscore",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /health",
            "GET /metrics",
            "GET /api/analyze/:address",
            "GET /api/transactions/:address",
            "GET /api/nft-transactions/:address",
            "GET /api/token-transactions/:address",
        ],
    }))
}

/// Health check handler
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        cache_size: state.analyzer.cache().len(),
        api_key_configured: state.config.api_key_configured,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// Wallet score handler
async fn analyze_handler(
    State(state): State<Arc<ServerState>>,
    Path(raw): Path<String>,
) -> Response {
    let start = Instant::now();
    let address = match Address::parse(&raw) {
        Ok(address) => address,
        Err(e) => {
            tracing::debug!(input = %raw, "rejected invalid address");
            return error_response(&e.into());
        }
    };

    match state.analyzer.analyze(&address).await {
        Ok(analysis) => {
            tracing::info!(
                %address,
                total_score = analysis.score.total_score,
                cached = analysis.cached,
                processing_time_ms = start.elapsed().as_millis() as u64,
                "analysis served"
            );
            (
                StatusCode::OK,
                Json(AnalyzeResponse {
                    score: analysis.score.as_ref(),
                    cached: analysis.cached,
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(%address, error = %e, "analysis failed");
            error_response(&e)
        }
    }
}

/// Raw records handler, one route per record kind
async fn records_handler(
    kind: RecordKind,
    State(state): State<Arc<ServerState>>,
    Path(raw): Path<String>,
) -> Response {
    let address = match Address::parse(&raw) {
        Ok(address) => address,
        Err(e) => {
            tracing::debug!(input = %raw, "rejected invalid address");
            return error_response(&e.into());
        }
    };

    match state.analyzer.records(kind, &address).await {
        Ok(result) => {
            tracing::info!(
                %address,
                kind = kind.as_str(),
                count = result.records.len(),
                cached = result.cached,
                "records served"
            );
            (
                StatusCode::OK,
                Json(RecordsResponse {
                    data: result.records.as_slice(),
                    cached: result.cached,
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(%address, kind = kind.as_str(), error = %e, "records fetch failed");
            error_response(&e)
        }
    }
}
