//! # Control API
//!
//! Local HTTP surface for a dashboard front-end.
//!
//! | Method | Path | Effect |
//! |---|---|---|
//! | GET | `/health` | liveness, never authenticated |
//! | GET | `/status` | engine, core, profile, recent log lines |
//! | POST | `/engine/start` | start watchdog + monitor |
//! | POST | `/engine/stop` | stop tasks and core |
//! | POST | `/core/start` | launch the core for a config |
//! | POST | `/core/stop` | stop the core process tree |
//! | GET | `/configs` | imported configs and protocol counts |
//! | GET | `/dns` | DNS servers and last ranking |
//! | GET | `/ports` | listening ports |
//! | GET | `/ping/window` | monitor samples and stats |
//! | POST | `/probe/ping` | safe ping test, needs `confirm: true` |
//! | POST | `/dns/optimize` | DNS ranking, needs `confirm: true`; `accept: true` applies the suggestion |
//! | POST | `/exit` | stop the engine and shut the server down |
//!
//! With an API key configured every route except `/health` requires
//! `Authorization: Bearer <key>`. A global rate limit applies to all routes.

use crate::engine::EngineManager;
use crate::error::UmbraError;
use crate::logging::LogRing;
use crate::probe::{self, Consent, SystemPinger};
use crate::store::SettingsStore;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Notify;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use umbra_core::CoreError;
use umbra_core::netstats::ports_summary;

/// Default control API port.
pub const DEFAULT_PORT: u16 = 8765;

/// Default requests per second across all clients.
pub const DEFAULT_RATE_LIMIT: u32 = 50;

/// Log lines returned by `/status`.
const STATUS_LOG_LINES: usize = 50;

/// Default `/ports` limit.
const DEFAULT_PORT_LIMIT: usize = 20;

// =============================================================================
// STATE
// =============================================================================

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: SettingsStore,
    pub engine: Arc<EngineManager>,
    pub ring: LogRing,
    pub client: reqwest::Client,
    api_key: Option<Arc<str>>,
    limiter: Arc<DefaultDirectRateLimiter>,
    exit: Arc<Notify>,
}

impl AppState {
    pub fn new(store: SettingsStore, engine: Arc<EngineManager>, ring: LogRing) -> Self {
        Self {
            store,
            engine,
            ring,
            client: reqwest::Client::new(),
            api_key: None,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(DEFAULT_RATE_LIMIT).unwrap_or(NonZeroU32::MIN),
            ))),
            exit: Arc::new(Notify::new()),
        }
    }

    /// Require `Authorization: Bearer <key>`. Blank keys disable auth.
    #[must_use]
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(Arc::from);
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        self.limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));
        self
    }

    /// Resolves once `POST /exit` was called.
    pub async fn exit_requested(&self) {
        self.exit.notified().await;
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error body: `{"error": "..."}`.
pub struct ApiError(UmbraError);

impl From<UmbraError> for ApiError {
    fn from(e: UmbraError) -> Self {
        Self(e)
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(UmbraError::Core(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            UmbraError::NotConfirmed => StatusCode::FORBIDDEN,
            UmbraError::Invalid(_) => StatusCode::BAD_REQUEST,
            UmbraError::Engine(_) => StatusCode::CONFLICT,
            UmbraError::Core(
                CoreError::OutOfRange { .. } | CoreError::NotFound(_) | CoreError::UnknownProfile(_),
            ) => StatusCode::NOT_FOUND,
            UmbraError::Core(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// MIDDLEWARE
// =============================================================================

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(key) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if bool::from(provided.as_bytes().ct_eq(key.as_bytes())) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "rejected request without valid API key");
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
    }
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.limiter.check().is_err() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response();
    }
    next.run(request).await
}

fn local_origin(origin: &HeaderValue) -> bool {
    let origin = origin.as_bytes();
    [
        "http://127.0.0.1",
        "http://localhost",
        "https://127.0.0.1",
        "https://localhost",
    ]
    .iter()
    .any(|prefix| origin.starts_with(prefix.as_bytes()))
}

// =============================================================================
// ROUTER
// =============================================================================

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| local_origin(origin)))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/engine/start", post(engine_start))
        .route("/engine/stop", post(engine_stop))
        .route("/core/start", post(core_start))
        .route("/core/stop", post(core_stop))
        .route("/configs", get(configs))
        .route("/dns", get(dns))
        .route("/ports", get(ports))
        .route("/ping/window", get(ping_window))
        .route("/probe/ping", post(probe_ping))
        .route("/dns/optimize", post(dns_optimize))
        .route("/exit", post(exit))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Serve on `127.0.0.1:<port>` until Ctrl-C or `POST /exit`, then stop
/// the engine.
pub async fn serve(state: AppState, port: u16) -> crate::error::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control API listening");

    let engine = Arc::clone(&state.engine);
    let waiter = state.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                () = waiter.exit_requested() => info!("exit requested"),
            }
        })
        .await?;

    engine.shutdown().await;
    info!("control API stopped");
    Ok(())
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let settings = state.store.load()?;
    let engine = state.engine.status().await;
    Ok(Json(json!({
        "engine": engine,
        "active_profile": settings.active_profile(),
        "active_config": settings.active_config().map(|c| c.name.clone()),
        "first_run_pending": settings.is_first_run_pending(),
        "logs": state.ring.tail(STATUS_LOG_LINES),
    })))
}

async fn engine_start(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let host = state.store.load()?.speedtest.monitor_host();
    let started = state.engine.start(&host).await;
    Ok(Json(json!({ "started": started })))
}

async fn engine_stop(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "stopped": state.engine.stop().await }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CoreStartRequest {
    /// Config index; the active profile's config when absent.
    index: Option<usize>,
}

async fn core_start(
    State(state): State<AppState>,
    Json(req): Json<CoreStartRequest>,
) -> ApiResult<Json<Value>> {
    let settings = state.store.load()?;
    let config = match req.index {
        Some(i) => settings.configs.get(i).ok_or(CoreError::OutOfRange {
            what: "config",
            index: i,
            len: settings.configs.len(),
        })?,
        None => settings
            .active_config()
            .ok_or_else(|| CoreError::NotFound("active config".to_string()))?,
    };
    let pid = state
        .engine
        .start_core(config, &settings.core_updates)
        .await?;
    Ok(Json(json!({ "pid": pid, "config": config.name })))
}

async fn core_stop(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "stopped": state.engine.stop_core().await }))
}

async fn configs(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let settings = state.store.load()?;
    let items: Vec<Value> = settings
        .configs
        .iter()
        .enumerate()
        .map(|(i, c)| {
            json!({
                "index": i,
                "name": c.name,
                "type": c.kind,
                "core": c.core,
                "source": c.source,
                "added_at": c.added_at,
            })
        })
        .collect();
    let counts: serde_json::Map<String, Value> = settings
        .protocol_counts()
        .into_iter()
        .map(|(k, n)| (k.as_str().to_string(), json!(n)))
        .collect();
    Ok(Json(json!({
        "configs": items,
        "protocol_counts": counts,
        "subscriptions": settings.subscriptions,
    })))
}

async fn dns(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let settings = state.store.load()?;
    Ok(Json(json!({
        "servers": settings.dns.servers,
        "last_ranking": settings.dns.rank_cache.last_ranking,
        "suggested": settings
            .profiles
            .active_entry()
            .and_then(|p| p.suggested_dns.clone()),
    })))
}

#[derive(Debug, Deserialize)]
struct PortsQuery {
    limit: Option<usize>,
}

async fn ports(
    State(state): State<AppState>,
    Query(q): Query<PortsQuery>,
) -> ApiResult<Json<Value>> {
    let settings = state.store.load()?;
    let ports = state
        .engine
        .listening_ports(q.limit.unwrap_or(DEFAULT_PORT_LIMIT))
        .await?;
    Ok(Json(json!({
        "summary": ports_summary(&ports),
        "ports": ports,
        "port_override": settings.engine.port_override,
    })))
}

async fn ping_window(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.ping_report()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeRequest {
    confirm: bool,
    target: Option<usize>,
    /// `/dns/optimize`: apply the suggestion to the active profile.
    accept: bool,
}

fn consent(req: &ProbeRequest) -> ApiResult<Consent> {
    Consent::from_flag(req.confirm).ok_or(ApiError(UmbraError::NotConfirmed))
}

async fn probe_ping(
    State(state): State<AppState>,
    Json(req): Json<ProbeRequest>,
) -> ApiResult<Json<Value>> {
    let consent = consent(&req)?;
    let host = state
        .store
        .load()?
        .speedtest
        .ping_host(req.target.unwrap_or(0));
    let stats = probe::safe_ping_test(&SystemPinger, &host, consent).await;
    Ok(Json(json!({
        "host": host,
        "stats": stats,
        "summary": stats.to_string(),
    })))
}

async fn dns_optimize(
    State(state): State<AppState>,
    Json(req): Json<ProbeRequest>,
) -> ApiResult<Json<Value>> {
    let consent = consent(&req)?;
    let servers = state.store.load()?.dns.servers;
    let ranked = probe::optimize_dns(&SystemPinger, &servers, consent).await;
    let suggested = state.store.update(|s| {
        let best = probe::store_ranking(s, &ranked)?;
        if req.accept {
            s.accept_dns_suggestion(&best);
        }
        Some(best.server)
    })?;
    let accepted = req.accept && suggested.is_some();
    Ok(Json(json!({
        "ranking": ranked,
        "suggested": suggested,
        "accepted": accepted,
    })))
}

async fn exit(State(state): State<AppState>) -> Json<Value> {
    state.engine.shutdown().await;
    state.exit.notify_one();
    Json(json!({ "exiting": true }))
}
