//! HTTP surface
//!
//! Every path not under `/_rendergate/` is handed to the [`Orchestrator`].
//! The admin routes expose health, a JSON status document and Prometheus
//! metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::debug;

use crate::breaker::CircuitState;
use crate::error::error_page;
use crate::metrics::write_gauge;
use crate::orchestrator::{InboundRequest, Orchestrator};
use crate::shutdown::{ShutdownController, ShutdownLayer};
use crate::tracing_middleware::{request_tracing_layer, RequestIdLayer};

/// Largest request body forwarded to the origin
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Prefix reserved for the gateway's own endpoints
pub const ADMIN_PREFIX: &str = "/_rendergate";

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    /// The pipeline
    pub orchestrator: Arc<Orchestrator>,
    /// Shutdown coordination
    pub shutdown: ShutdownController,
}

impl AppState {
    /// Bundle the pipeline with a shutdown controller
    pub fn new(orchestrator: Arc<Orchestrator>, shutdown: ShutdownController) -> Self {
        Self {
            orchestrator,
            shutdown,
        }
    }
}

/// Build the full router with tracing, request IDs and shutdown handling
pub fn build_router(state: AppState) -> Router {
    let shutdown = state.shutdown.clone();

    Router::new()
        .route(&format!("{ADMIN_PREFIX}/health"), get(health_handler))
        .route(&format!("{ADMIN_PREFIX}/status"), get(status_handler))
        .route(&format!("{ADMIN_PREFIX}/metrics"), get(metrics_handler))
        .fallback(gateway_handler)
        .with_state(state)
        .layer(ShutdownLayer::new(shutdown))
        .layer(request_tracing_layer())
        .layer(RequestIdLayer::new())
}

/// Catch-all: run the request through the pipeline
async fn gateway_handler(State(state): State<AppState>, request: Request) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Request body rejected");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                error_page(StatusCode::PAYLOAD_TOO_LARGE),
            )
                .into_response();
        }
    };

    let inbound = InboundRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        client_ip,
    };

    state.orchestrator.handle(inbound).await.into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let health = state.shutdown.health_status();
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let orchestrator = &state.orchestrator;

    Json(json!({
        "name": crate::NAME,
        "version": crate::VERSION,
        "circuit": orchestrator.breaker().snapshot(),
        "cache": orchestrator.cache().stats().await,
        "render": orchestrator.renderer().stats(),
        "metrics": orchestrator.metrics().to_json(),
        "shutdown": state.shutdown.health_status(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let orchestrator = &state.orchestrator;
    let mut body = orchestrator.metrics().to_prometheus_format();

    let cache = orchestrator.cache().stats().await;
    let render = orchestrator.renderer().stats();
    let circuit = orchestrator.breaker().snapshot();

    write_gauge(&mut body, "rendergate_cache_entries", "Documents in the cache", cache.entries as f64);
    write_gauge(
        &mut body,
        "rendergate_render_pages_available",
        "Idle browser pages",
        render.available_pages as f64,
    );
    write_gauge(
        &mut body,
        "rendergate_render_queue_depth",
        "Renders waiting for a page",
        render.queued as f64,
    );
    write_gauge(
        &mut body,
        "rendergate_circuit_open",
        "1 while the render circuit is not closed",
        if circuit.state == CircuitState::Closed { 0.0 } else { 1.0 },
    );

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        Body::from(body),
    )
        .into_response()
}
