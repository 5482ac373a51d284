pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod metrics;
pub mod realtime;
pub mod rpc;
pub mod session;

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Duration;
use scrumflow_common::realtime::RealtimeHub;
use tracing::{error, info};

use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::metrics::RelayMetrics;
use crate::session::{CollaborationStore, CollaborativeSessionService, PresenceService};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Everything a relay process shares across requests and sockets.
#[derive(Clone)]
pub struct AppState {
    pub hub: RealtimeHub,
    pub sessions: CollaborativeSessionService,
    pub presence: PresenceService,
    pub metrics: Arc<RelayMetrics>,
}

impl AppState {
    pub fn new(store: CollaborationStore, presence_window: Duration) -> Self {
        let hub = RealtimeHub::new();
        Self {
            sessions: CollaborativeSessionService::new(store.clone(), hub.clone(), presence_window),
            presence: PresenceService::new(store, hub.clone(), presence_window),
            hub,
            metrics: Arc::new(RelayMetrics::default()),
        }
    }

    /// Fresh state over the in-memory store.
    pub fn in_memory(presence_window: Duration) -> Self {
        Self::new(CollaborationStore::memory(), presence_window)
    }
}

pub fn build_router(state: AppState, cors_origins: Option<&str>) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(Arc::clone(&state.metrics));

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(metrics_router)
            .merge(rpc::router(state.sessions, state.presence, Arc::clone(&state.metrics)))
            .merge(realtime::router(state.hub, Arc::clone(&state.metrics))),
        state.metrics,
    )
    .layer(cors::cors_layer(cors_origins))
}

pub fn apply_middleware(router: Router, metrics: Arc<RelayMetrics>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(metrics): State<Arc<RelayMetrics>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render_prometheus(),
    )
        .into_response()
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(
    State(metrics): State<Arc<RelayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    metrics.record_http_request(method.as_str(), &path, response.status().as_u16(), latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    response
}
