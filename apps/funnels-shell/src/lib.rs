use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use funnels_client_core::{
    SharedStorage, StartupFlags, TokenPair, TokenStore, TokenStoreError, derive_base_url,
};
use funnels_offline::{
    CacheController, CacheGeneration, CacheManifest, CacheStorage, DiskCacheStorage,
    FetchRequest, HttpNetwork, InterceptedResponse, InterceptorPolicy, MemoryCacheStorage,
    OfflineWorker, RequestDestination, StoredResponse, is_hop_by_hop,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;

pub mod bridge;
pub mod config;


pub const SERVICE_NAME: &str = "funnels-shell";
pub const SOURCE_HEADER: &str = "x-funnels-source";
const CACHE_NO_STORE: &str = "no-cache, no-store, must-revalidate";
const MAX_PROXY_BODY_BYTES: usize = 8 * 1024 * 1024;
const SEC_FETCH_DEST: &str = "sec-fetch-dest";
const FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    worker: Arc<OfflineWorker>,
    token_storage: Arc<SharedStorage>,
    tokens: TokenStore,
    started_at: SystemTime,
}

impl AppState {
    pub fn from_config(config: Config) -> Result<Self> {
        let network = HttpNetwork::new(&config.upstream_url, config.upstream_timeout)
            .context("failed to build upstream client")?;
        let cache_storage: Arc<dyn CacheStorage> = match &config.cache_dir {
            Some(dir) => Arc::new(DiskCacheStorage::new(dir)),
            None => Arc::new(MemoryCacheStorage::new()),
        };
        let worker = OfflineWorker::new(
            Arc::new(CacheController::new(cache_storage)),
            Arc::new(network),
            InterceptorPolicy {
                cache_on_miss: config.cache_on_miss,
            },
        );

        let token_storage = open_token_storage(&config);
        Ok(Self {
            tokens: TokenStore::open(&token_storage),
            token_storage,
            worker: Arc::new(worker),
            config: Arc::new(config),
            started_at: SystemTime::now(),
        })
    }

    pub fn worker(&self) -> &OfflineWorker {
        &self.worker
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// The medium behind [`AppState::tokens`]; every bridge session opens
    /// its own listener on it.
    pub fn token_storage(&self) -> &Arc<SharedStorage> {
        &self.token_storage
    }
}

fn open_token_storage(config: &Config) -> Arc<SharedStorage> {
    match &config.token_store_path {
        Some(path) => SharedStorage::file(path),
        None => SharedStorage::memory(),
    }
}

pub fn open_token_store(config: &Config) -> TokenStore {
    TokenStore::open(&open_token_storage(config))
}

/// Restores any committed generations, then installs and activates the
/// configured shell manifest. An install failure is not fatal: the worker
/// falls back to a restored generation if nothing is active, or to the
/// network alone.
pub async fn start_worker(state: &AppState) {
    let worker = state.worker();
    let manifest = CacheManifest::default_shell(state.config.cache_version.clone());

    let restored = match worker.cache().restore().await {
        Ok(restored) => restored,
        Err(error) => {
            tracing::warn!(
                target: "funnels.shell",
                error = %error,
                "failed to restore cached generations",
            );
            Vec::new()
        }
    };

    match worker.install(manifest).await {
        Ok(_) => {
            if let Err(error) = worker.activate().await {
                tracing::warn!(target: "funnels.shell", error = %error, "worker activation failed");
            }
        }
        Err(error) => {
            tracing::warn!(
                target: "funnels.shell",
                error = %error,
                phase = worker.phase().as_str(),
                "worker install failed; continuing without a fresh cache generation",
            );
            adopt_restored(worker, restored).await;
        }
    }
}

async fn adopt_restored(worker: &OfflineWorker, restored: Vec<CacheGeneration>) {
    if worker.status().await.active_generation.is_some() {
        return;
    }
    let Some(generation) = restored.into_iter().next_back() else {
        return;
    };
    if let Err(error) = worker.adopt(CacheManifest::default_shell(generation)).await {
        tracing::warn!(
            target: "funnels.shell",
            error = %error,
            "failed to adopt restored cache generation",
        );
    }
}

pub async fn build_app(config: Config) -> Result<Router> {
    let state = AppState::from_config(config)?;
    start_worker(&state).await;
    Ok(build_router(state))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/__shell/flags", get(startup_flags))
        .route("/__shell/tokens", post(sync_tokens))
        .route("/__shell/worker", get(worker_status))
        .route("/__shell/bridge", get(bridge::bridge_socket))
        .fallback(proxy)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

pub async fn serve(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr;
    let upstream_url = config.upstream_url.clone();
    let app = build_app(config).await?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(
        service = SERVICE_NAME,
        bind_addr = %bind_addr,
        upstream = %upstream_url,
        "funnels shell listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Startup flags for a page loaded from `scheme://host`.
pub fn flags_for_page(
    config: &Config,
    tokens: &TokenStore,
    scheme: &str,
    host: &str,
) -> Result<StartupFlags> {
    let base_url = derive_base_url(scheme, host, config.service_port)?;
    Ok(StartupFlags::from_store(tokens, base_url)?)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = match state.started_at.elapsed() {
        Ok(duration) => duration.as_secs(),
        Err(_) => 0,
    };

    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds,
    })
}

async fn startup_flags(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = header_str(&headers, HOST.as_str()).unwrap_or_default();
    let scheme = header_str(&headers, FORWARDED_PROTO).unwrap_or("http");

    match flags_for_page(&state.config, &state.tokens, scheme, host) {
        Ok(flags) => {
            let mut response = Json(flags).into_response();
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_NO_STORE));
            response
        }
        Err(error) => error_response(StatusCode::BAD_REQUEST, &error.to_string()),
    }
}

async fn sync_tokens(State(state): State<AppState>, Json(pair): Json<TokenPair>) -> Response {
    match state.tokens.write(&pair) {
        Ok(outcome) => Json(json!({ "outcome": outcome.as_str() })).into_response(),
        Err(error @ TokenStoreError::IncompletePair) => {
            error_response(StatusCode::BAD_REQUEST, &error.to_string())
        }
        Err(error) => {
            tracing::error!(target: "funnels.shell", error = %error, "token write failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist tokens")
        }
    }
}

async fn worker_status(State(state): State<AppState>) -> Response {
    Json(state.worker.status().await).into_response()
}

async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str())
        .to_string();

    let body = match to_bytes(body, MAX_PROXY_BODY_BYTES).await {
        Ok(body) => body,
        Err(error) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, &error.to_string());
        }
    };

    let destination =
        RequestDestination::from_fetch_dest(header_str(&parts.headers, SEC_FETCH_DEST));
    let mut fetch = FetchRequest::new(parts.method.as_str(), target)
        .with_destination(destination)
        .with_body(body.to_vec());
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            fetch = fetch.with_header(name.as_str(), value);
        }
    }

    match state.worker.fetch(&fetch).await {
        Ok(served) => into_http_response(served, parts.uri.path()),
        Err(error) => {
            tracing::warn!(
                target: "funnels.shell",
                key = %fetch.key(),
                error = %error,
                "request could not be served",
            );
            let mut response = (StatusCode::SERVICE_UNAVAILABLE, error.to_string()).into_response();
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static(CACHE_NO_STORE));
            response
        }
    }
}

fn into_http_response(served: InterceptedResponse, path: &str) -> Response {
    let InterceptedResponse { response, source } = served;
    let StoredResponse {
        status,
        headers,
        body,
    } = response;

    let mut http = Response::new(Body::from(body));
    *http.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in &headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            http.headers_mut().append(name, value);
        }
    }

    if !http.headers().contains_key(CONTENT_TYPE) {
        if let Some(guessed) = mime_guess::from_path(path).first() {
            if let Ok(value) = HeaderValue::from_str(guessed.as_ref()) {
                http.headers_mut().insert(CONTENT_TYPE, value);
            }
        }
    }
    http.headers_mut().insert(
        HeaderName::from_static(SOURCE_HEADER),
        HeaderValue::from_static(source.as_str()),
    );
    http
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": { "message": message } }))).into_response()
}
