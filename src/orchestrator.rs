//! Request orchestration
//!
//! Ties the pipeline together for every inbound request:
//!
//! ```text
//! request ──▶ BotClassifier ──▶ DecisionGate
//!                                   │
//!      STATIC / PROXY / BYPASS ◀────┼────▶ RENDER
//!               │                          │
//!               ▼                          ▼
//!          OriginProxy            SwrCache::get_with_ttl
//!                              fresh │  stale │   miss
//!                                HIT │  STALE │   MISS
//!                                    │  + background refresh
//!                                    │        │   CircuitBreaker::execute(
//!                                    │        │       RenderManager::render,
//!                                    │        │       fallback = OriginProxy)
//!                                    ▼        ▼        ▼
//!                                 response + TrafficEvent + GatewayMetrics
//! ```
//!
//! Renders are single-flight per cache key: a miss that finds a render for
//! its key already running (another miss or a background refresh) waits for
//! it and re-reads the cache instead of starting a second one.
//!
//! `?render=debug` skips the cache in both directions and returns a JSON
//! diagnostic instead of the page.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, info_span, instrument, warn, Instrument, Span};
use url::Url;

use crate::bot::{BotClassifier, BotSignal, UserAgentClassifier};
use crate::breaker::{CircuitBreaker, ExecutionResult};
use crate::cache::{derive_key, CacheLookup, RevalidationGuard, SwrCache};
use crate::error::{GatewayError, GatewayResult};
use crate::gate::{Action, DecisionGate, GateInput};
use crate::metrics::GatewayMetrics;
use crate::origin::{origin_url, OriginProxy, OriginResponse};
use crate::render::{RenderManager, RenderPriority, RenderRequest, RenderResult};
use crate::traffic::{LogTrafficSink, TrafficEvent, TrafficSink};

/// Cache outcome header
pub const SSR_CACHE_HEADER: &str = "x-ssr-cache";

/// Render duration header (milliseconds)
pub const SSR_RENDER_TIME_HEADER: &str = "x-ssr-render-time";

/// Set when a render request was answered by the origin
pub const SSR_FALLBACK_HEADER: &str = "x-ssr-fallback";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

// ============================================================================
// Types
// ============================================================================

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Record background revalidation outcomes in the circuit breaker
    pub revalidation_counts_toward_breaker: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            revalidation_counts_toward_breaker: true,
        }
    }
}

/// `X-SSR-Cache` value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    /// Fresh cached document
    Hit,
    /// Rendered (or fallen back) on this request
    Miss,
    /// Stale cached document, refresh scheduled
    Stale,
    /// Debug render, cache not consulted
    Bypass,
}

impl CacheStatus {
    /// Header value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
            Self::Bypass => "BYPASS",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound request, detached from the HTTP framework
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Method
    pub method: Method,
    /// Path and query
    pub uri: Uri,
    /// Headers
    pub headers: HeaderMap,
    /// Body
    pub body: Bytes,
    /// Peer address, if known
    pub client_ip: Option<IpAddr>,
}

impl InboundRequest {
    /// Bodyless request, mostly useful in tests
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: None,
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: header::HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    fn user_agent(&self) -> Option<&str> {
        self.headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

/// Response plus the bookkeeping the HTTP layer logs
#[derive(Debug)]
pub struct GatewayResponse {
    /// HTTP response
    pub response: Response,
    /// Gate action taken
    pub action: Action,
    /// Cache outcome on render paths
    pub cache_status: Option<CacheStatus>,
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        self.response
    }
}

/// What a guarded render produced: a document or the origin's answer
#[derive(Debug)]
enum RenderOutcome {
    Rendered(RenderResult),
    Proxied(OriginResponse),
}

/// Diagnostic payload for `?render=debug`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugReport {
    /// Rendered URL
    pub url: String,
    /// Key the document would be cached under
    pub cache_key: String,
    /// Always `bypass`
    pub cache_decision: String,
    /// Render wall time
    pub render_time_ms: u64,
    /// Status the document would be served with
    pub status_code: u16,
    /// Wait strategy that produced the document
    pub strategy: Option<String>,
    /// Rendered document size
    pub html_bytes: usize,
    /// Breaker state after the render
    pub circuit_state: String,
    /// Bot classification of the request
    pub bot_signal: BotSignal,
    /// Failure, if any
    pub error: Option<String>,
    /// Whether a fallback answered
    pub fallback_used: bool,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// The adaptive render pipeline
pub struct Orchestrator {
    gate: DecisionGate,
    cache: Arc<SwrCache>,
    renderer: Arc<RenderManager>,
    breaker: Arc<CircuitBreaker>,
    origin: Arc<dyn OriginProxy>,
    origin_base: Url,
    classifier: Arc<dyn BotClassifier>,
    traffic: Arc<dyn TrafficSink>,
    metrics: Arc<GatewayMetrics>,
    config: OrchestratorConfig,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("origin_base", &self.origin_base.as_str())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Assemble a pipeline from its components
    ///
    /// Defaults: [`UserAgentClassifier`], [`LogTrafficSink`] and a fresh
    /// [`GatewayMetrics`]; replace them with the `with_*` methods.
    pub fn new(
        gate: DecisionGate,
        cache: Arc<SwrCache>,
        renderer: Arc<RenderManager>,
        breaker: Arc<CircuitBreaker>,
        origin: Arc<dyn OriginProxy>,
        origin_base: Url,
    ) -> Self {
        Self {
            gate,
            cache,
            renderer,
            breaker,
            origin,
            origin_base,
            classifier: Arc::new(UserAgentClassifier::new()),
            traffic: Arc::new(LogTrafficSink),
            metrics: Arc::new(GatewayMetrics::new()),
            config: OrchestratorConfig::default(),
        }
    }

    /// Use a different bot classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn BotClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Use a different traffic sink
    pub fn with_traffic_sink(mut self, traffic: Arc<dyn TrafficSink>) -> Self {
        self.traffic = traffic;
        self
    }

    /// Share a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<GatewayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set orchestrator options
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// The cache
    pub fn cache(&self) -> &Arc<SwrCache> {
        &self.cache
    }

    /// The render manager
    pub fn renderer(&self) -> &Arc<RenderManager> {
        &self.renderer
    }

    /// The render circuit breaker
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The metrics collector
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Every render is bounded by the tighter of the two timeouts
    fn render_budget(&self) -> Duration {
        self.renderer
            .config()
            .default_timeout
            .min(self.breaker.config().timeout_threshold)
    }

    fn ttl_secs(&self) -> u64 {
        self.cache.config().default_ttl.as_secs().max(1)
    }

    /// Handle one request end to end
    #[instrument(
        name = "gateway",
        skip(self, request),
        fields(
            method = %request.method,
            path = %request.uri.path(),
            action = tracing::field::Empty,
            cache = tracing::field::Empty,
        )
    )]
    pub async fn handle(&self, request: InboundRequest) -> GatewayResponse {
        let started = Instant::now();

        let signal = self.classifier.classify(
            request.user_agent(),
            request.client_ip,
            &request.headers,
        );
        let decision = self.gate.classify(
            GateInput {
                method: &request.method,
                path: request.uri.path(),
                query: request.uri.query(),
            },
            &signal,
        );
        Span::current().record("action", decision.action.as_str());

        let path = request.uri.path().to_string();
        let response = match decision.action {
            Action::Render if decision.debug => self.debug_render(&request, &signal).await,
            Action::Render => self.serve_render(&request).await,
            action => self.proxy(request, action).await,
        };

        if let Some(cache) = response.cache_status {
            Span::current().record("cache", cache.as_str());
            self.metrics.record_cache(cache.as_str());
        }

        let duration = started.elapsed();
        let status = response.response.status().as_u16();
        self.metrics
            .record_request(response.action.as_str(), status, duration);
        self.traffic.record(TrafficEvent {
            timestamp: Utc::now(),
            path,
            is_bot: signal.is_bot,
            action: response.action,
            cache_status: response.cache_status.map(|c| c.as_str().to_string()),
            status_code: status,
            duration_ms: duration.as_millis() as u64,
        });

        response
    }

    // ========================================================================
    // Origin paths
    // ========================================================================

    async fn proxy(&self, request: InboundRequest, action: Action) -> GatewayResponse {
        let url = origin_url(&self.origin_base, request.path_and_query());
        let result = self
            .origin
            .forward(request.method, &url, request.headers, request.body)
            .await;

        let response = match result {
            Ok(origin) => origin_response(origin),
            Err(e) => self.error_response(e),
        };

        GatewayResponse {
            response,
            action,
            cache_status: None,
        }
    }

    // ========================================================================
    // Render path
    // ========================================================================

    async fn serve_render(&self, request: &InboundRequest) -> GatewayResponse {
        let key = derive_key(&origin_url(&self.origin_base, request.path_and_query()));

        // Concurrent misses on one key wait for the single render in flight
        // and then re-read the cache.
        let _render_guard = loop {
            if let Some(lookup) = self.cache.get_with_ttl(&key).await {
                let status = if lookup.is_stale {
                    match self.cache.try_begin_revalidation(&key) {
                        Some(guard) => self.spawn_revalidation(key.clone(), guard),
                        None => debug!(key = %key, "Revalidation already running"),
                    }
                    CacheStatus::Stale
                } else {
                    CacheStatus::Hit
                };
                return cached_response(lookup, status);
            }

            match self.cache.try_begin_revalidation(&key) {
                Some(guard) => break guard,
                None => {
                    debug!(key = %key, "Render already in flight, waiting");
                    self.cache.wait_for_render(&key).await;
                }
            }
        };

        let operation = render_page(
            Arc::clone(&self.renderer),
            Arc::clone(&self.metrics),
            key.clone(),
            self.render_budget(),
            RenderPriority::Interactive,
        )
        .map(|result| result.map(RenderOutcome::Rendered));

        let origin = Arc::clone(&self.origin);
        let fallback_url = origin_url(&self.origin_base, request.path_and_query());
        let method = request.method.clone();
        let headers = request.headers.clone();
        let fallback = async move {
            origin
                .forward(method, &fallback_url, headers, Bytes::new())
                .await
                .map(RenderOutcome::Proxied)
        }
        .boxed();

        let result = self.breaker.execute(operation, Some(fallback)).await;
        let response = self.finish_miss(&key, result).await;

        GatewayResponse {
            response,
            action: Action::Render,
            cache_status: Some(CacheStatus::Miss),
        }
    }

    async fn finish_miss(&self, key: &str, result: ExecutionResult<RenderOutcome>) -> Response {
        match result.outcome {
            Ok(RenderOutcome::Rendered(rendered)) => {
                let status = rendered.status_code();
                let render_ms = rendered.duration_ms;
                let html = rendered.html.unwrap_or_default();

                if is_cacheable(status) {
                    let stored = self
                        .cache
                        .set_with_status(key, html.clone(), status, self.ttl_secs())
                        .await;
                    if !stored {
                        warn!(key, bytes = html.len(), "Cache refused rendered document");
                    }
                } else {
                    debug!(key, status, "Rendered status is not cacheable");
                }

                let mut response = html_response(status, html);
                set_header(&mut response, SSR_CACHE_HEADER, CacheStatus::Miss.as_str());
                set_header(&mut response, SSR_RENDER_TIME_HEADER, &render_ms.to_string());
                response
            }
            Ok(RenderOutcome::Proxied(origin)) => {
                self.metrics.record_fallback();
                info!(
                    key,
                    circuit = %result.circuit_state,
                    short_circuited = result.short_circuited,
                    "Render unavailable, served origin response"
                );
                let mut response = origin_response(origin);
                set_header(&mut response, SSR_CACHE_HEADER, CacheStatus::Miss.as_str());
                set_header(&mut response, SSR_FALLBACK_HEADER, "origin");
                response
            }
            Err(error) => {
                // Both the render and the origin fallback failed
                let error = if result.short_circuited {
                    warn!(key, error = %error, "Circuit open and origin unavailable");
                    GatewayError::CircuitOpen {
                        retry_in_ms: self.breaker.config().reset_timeout.as_millis() as u64,
                    }
                } else {
                    warn!(key, error = %error, "Render and origin both failed");
                    match error {
                        GatewayError::Origin(_) => error,
                        other => GatewayError::Origin(other.to_string()),
                    }
                };
                let mut response = self.error_response(error);
                set_header(&mut response, SSR_CACHE_HEADER, CacheStatus::Miss.as_str());
                response
            }
        }
    }

    fn spawn_revalidation(&self, key: String, guard: RevalidationGuard) {
        let cache = Arc::clone(&self.cache);
        let breaker = Arc::clone(&self.breaker);
        let metrics = Arc::clone(&self.metrics);
        let operation = render_page(
            Arc::clone(&self.renderer),
            Arc::clone(&self.metrics),
            key.clone(),
            self.render_budget(),
            RenderPriority::Background,
        );
        let tracked = self.config.revalidation_counts_toward_breaker;
        let ttl_secs = self.ttl_secs();
        let span = info_span!("revalidate", key = %key);

        tokio::spawn(
            async move {
                let _guard = guard;

                let result = if tracked {
                    breaker.execute(operation, None).await
                } else {
                    breaker.execute_untracked(operation, None).await
                };

                match result.outcome {
                    Ok(rendered) => {
                        metrics.record_revalidation(true);
                        let status = rendered.status_code();
                        let html = rendered.html.unwrap_or_default();
                        if is_cacheable(status) {
                            if cache.set_with_status(&key, html, status, ttl_secs).await {
                                debug!("Cache entry refreshed");
                            } else {
                                warn!("Cache refused refreshed document, keeping stale entry");
                            }
                        } else {
                            cache.delete(&key).await;
                            info!(status, "Page now reports a non-cacheable status, entry dropped");
                        }
                    }
                    Err(e) => {
                        metrics.record_revalidation(false);
                        warn!(error = %e, "Revalidation failed, keeping stale entry");
                    }
                }
            }
            .instrument(span),
        );
    }

    // ========================================================================
    // Debug path
    // ========================================================================

    async fn debug_render(&self, request: &InboundRequest, signal: &BotSignal) -> GatewayResponse {
        let url = derive_key(&origin_url(&self.origin_base, request.path_and_query()));
        let started = Instant::now();

        let operation = render_page(
            Arc::clone(&self.renderer),
            Arc::clone(&self.metrics),
            url.clone(),
            self.render_budget(),
            RenderPriority::Interactive,
        );
        let result = self.breaker.execute(operation, None).await;
        let render_time_ms = started.elapsed().as_millis() as u64;

        let (status_code, strategy, html_bytes, error) = match &result.outcome {
            Ok(rendered) => (
                rendered.status_code(),
                rendered.strategy.map(|s| s.as_str().to_string()),
                rendered.html.as_ref().map(String::len).unwrap_or(0),
                None,
            ),
            Err(e) => (e.status_code().as_u16(), None, 0, Some(e.to_string())),
        };

        let report = DebugReport {
            cache_key: url.clone(),
            url,
            cache_decision: "bypass".to_string(),
            render_time_ms,
            status_code,
            strategy,
            html_bytes,
            circuit_state: result.circuit_state.as_str().to_string(),
            bot_signal: signal.clone(),
            error,
            fallback_used: result.fallback_used,
        };

        let mut response = axum::Json(report).into_response();
        set_header(&mut response, SSR_CACHE_HEADER, CacheStatus::Bypass.as_str());
        set_header(&mut response, SSR_RENDER_TIME_HEADER, &render_time_ms.to_string());

        GatewayResponse {
            response,
            action: Action::Render,
            cache_status: Some(CacheStatus::Bypass),
        }
    }

    fn error_response(&self, error: GatewayError) -> Response {
        self.metrics.record_error(error.error_type());
        error.into_response()
    }
}

/// One guarded render, owned so it can move into a background task
async fn render_page(
    renderer: Arc<RenderManager>,
    metrics: Arc<GatewayMetrics>,
    url: String,
    timeout: Duration,
    priority: RenderPriority,
) -> GatewayResult<RenderResult> {
    let request = RenderRequest::new(url)
        .with_timeout(timeout)
        .with_priority(priority);
    let result = renderer.render(request).await;
    metrics.record_render(
        result.is_success(),
        Duration::from_millis(result.duration_ms),
    );
    result.into_result().map_err(GatewayError::from)
}

/// Only 2xx and 3xx documents are written to the cache
fn is_cacheable(status: u16) -> bool {
    (200..400).contains(&status)
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn html_response(status: u16, html: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, [(header::CONTENT_TYPE, HTML_CONTENT_TYPE)], html).into_response()
}

fn cached_response(lookup: CacheLookup, cache_status: CacheStatus) -> GatewayResponse {
    let age = lookup_age_secs(&lookup);
    let mut response = html_response(lookup.status_code, lookup.value);
    set_header(&mut response, SSR_CACHE_HEADER, cache_status.as_str());
    set_header(&mut response, "age", &age.to_string());

    GatewayResponse {
        response,
        action: Action::Render,
        cache_status: Some(cache_status),
    }
}

fn lookup_age_secs(lookup: &CacheLookup) -> i64 {
    (Utc::now() - lookup.rendered_at).num_seconds().max(0)
}

fn origin_response(origin: OriginResponse) -> Response {
    let mut response = Response::new(Body::from(origin.body));
    *response.status_mut() = origin.status;
    *response.headers_mut() = origin.headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cacheable_statuses() {
        assert!(is_cacheable(200));
        assert!(is_cacheable(301));
        assert!(!is_cacheable(404));
        assert!(!is_cacheable(500));
        assert!(!is_cacheable(101));
    }

    #[test]
    fn test_cache_status_header_values() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Bypass.to_string(), "BYPASS");
        assert_eq!(
            serde_json::to_value(CacheStatus::Stale).unwrap(),
            serde_json::json!("STALE")
        );
    }

    #[test]
    fn test_html_response_falls_back_to_ok_for_bad_status() {
        let response = html_response(1000, "<p>x</p>".into());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            HTML_CONTENT_TYPE
        );
    }
}
