//! End-to-end pipeline tests
//!
//! The browser and the origin are replaced by in-memory doubles so the
//! full decision → cache → breaker → render → fallback path can be driven
//! deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use rendergate::bot::BotSignal;
use rendergate::render::{RenderError, RenderedDocument, Renderer, WaitStrategy};
use rendergate::traffic::ChannelTrafficSink;
use rendergate::{
    Action, BreakerConfig, CacheConfig, CacheStatus, CircuitBreaker, CircuitState, DecisionGate,
    GateConfig, GatewayResult, InboundRequest, Orchestrator, OrchestratorConfig, OriginProxy,
    OriginResponse, RenderConfig, RenderManager, SwrCache,
};
use url::Url;

const ORIGIN: &str = "http://origin.test";
const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
const BROWSER: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/126.0 Safari/537.36";

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Clone, Copy)]
enum Mode {
    /// Render `<h1>render N</h1>` where N counts navigations
    Succeed,
    /// Render a page declaring the given status
    Status(u16),
    /// Render a plain page the origin served with the given HTTP status
    HttpStatus(u16),
    /// Browser crash
    Crash,
}

struct FakeRenderer {
    mode: Mutex<Mode>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeRenderer {
    fn new(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn navigate(
        &self,
        _url: &str,
        _wait: WaitStrategy,
        _timeout: Duration,
    ) -> Result<RenderedDocument, RenderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mode = *self.mode.lock().unwrap();
        match mode {
            Mode::Succeed => Ok(RenderedDocument::new(format!("<h1>render {n}</h1>"))),
            Mode::Status(code) => Ok(RenderedDocument::new(format!(
                "<html><head><meta name=\"prerender-status-code\" content=\"{code}\"></head>\
                 <body>gone</body></html>"
            ))),
            Mode::HttpStatus(code) => {
                Ok(RenderedDocument::new("<h1>Not here</h1>").with_status(code))
            }
            Mode::Crash => Err(RenderError::Crash("target closed".into())),
        }
    }
}

#[derive(Default)]
struct FakeOrigin {
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl FakeOrigin {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginProxy for FakeOrigin {
    async fn forward(
        &self,
        _method: Method,
        url: &str,
        _headers: HeaderMap,
        _body: Bytes,
    ) -> GatewayResult<OriginResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let mut response = OriginResponse::new(StatusCode::OK, "<div id=\"app\"></div>");
        response
            .headers
            .insert(header::CONTENT_TYPE, "text/html".parse().unwrap());
        Ok(response)
    }
}

struct Harness {
    orchestrator: Orchestrator,
    renderer: Arc<FakeRenderer>,
    origin: Arc<FakeOrigin>,
}

fn harness(renderer: FakeRenderer, breaker: BreakerConfig, cache: CacheConfig) -> Harness {
    let renderer = Arc::new(renderer);
    let origin = Arc::new(FakeOrigin::default());
    let orchestrator = Orchestrator::new(
        DecisionGate::new(GateConfig::default()),
        Arc::new(SwrCache::new(cache)),
        Arc::new(RenderManager::new(
            renderer.clone(),
            RenderConfig::default().with_max_concurrency(2),
        )),
        Arc::new(CircuitBreaker::new("render", breaker)),
        origin.clone(),
        Url::parse(ORIGIN).unwrap(),
    );
    Harness {
        orchestrator,
        renderer,
        origin,
    }
}

fn default_harness(mode: Mode) -> Harness {
    harness(
        FakeRenderer::new(mode),
        BreakerConfig::default(),
        CacheConfig::default(),
    )
}

fn request(path: &str, user_agent: &str) -> InboundRequest {
    InboundRequest::new(Method::GET, path.parse::<Uri>().unwrap())
        .with_header(header::USER_AGENT, user_agent)
}

fn cache_header(response: &Response) -> Option<&str> {
    response
        .headers()
        .get("x-ssr-cache")
        .and_then(|v| v.to_str().ok())
}

/// Issue `n` identical requests from separate tasks
async fn concurrent(
    orchestrator: &Arc<Orchestrator>,
    path: &str,
    n: usize,
) -> Vec<(Option<CacheStatus>, String)> {
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let orchestrator = Arc::clone(orchestrator);
            let req = request(path, GOOGLEBOT);
            tokio::spawn(async move { orchestrator.handle(req).await })
        })
        .collect();

    let mut results = Vec::with_capacity(n);
    for handle in handles {
        let result = handle.await.unwrap();
        results.push((result.cache_status, body_string(result.response).await));
    }
    results
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_human_request_is_proxied_untouched() {
    let h = default_harness(Mode::Succeed);

    let result = h.orchestrator.handle(request("/about", BROWSER)).await;

    assert_eq!(result.action, Action::Proxy);
    assert_eq!(result.cache_status, None);
    assert!(cache_header(&result.response).is_none());
    assert_eq!(body_string(result.response).await, "<div id=\"app\"></div>");
    assert_eq!(h.origin.calls(), 1);
    assert_eq!(h.renderer.calls(), 0);
    assert_eq!(h.origin.urls.lock().unwrap()[0], "http://origin.test/about");
}

#[tokio::test]
async fn test_bot_asset_request_is_static() {
    let h = default_harness(Mode::Succeed);

    let result = h.orchestrator.handle(request("/assets/app.js", GOOGLEBOT)).await;

    assert_eq!(result.action, Action::Static);
    assert_eq!(h.renderer.calls(), 0);
    assert_eq!(h.origin.calls(), 1);
}

#[tokio::test]
async fn test_bypass_prefix_skips_render() {
    let h = default_harness(Mode::Succeed);

    let result = h.orchestrator.handle(request("/api/users", GOOGLEBOT)).await;

    assert_eq!(result.action, Action::Bypass);
    assert_eq!(h.renderer.calls(), 0);
}

#[tokio::test]
async fn test_bot_post_is_proxied() {
    let h = default_harness(Mode::Succeed);
    let mut req = request("/contact", GOOGLEBOT);
    req.method = Method::POST;

    let result = h.orchestrator.handle(req).await;

    assert_eq!(result.action, Action::Proxy);
    assert_eq!(h.renderer.calls(), 0);
}

// ============================================================================
// Render and cache
// ============================================================================

#[tokio::test]
async fn test_render_miss_then_hit() {
    let h = default_harness(Mode::Succeed);

    let first = h.orchestrator.handle(request("/about", GOOGLEBOT)).await;
    assert_eq!(first.action, Action::Render);
    assert_eq!(first.cache_status, Some(CacheStatus::Miss));
    assert_eq!(first.response.status(), StatusCode::OK);
    assert_eq!(cache_header(&first.response), Some("MISS"));
    assert!(first.response.headers().contains_key("x-ssr-render-time"));
    assert_eq!(body_string(first.response).await, "<h1>render 1</h1>");

    let second = h.orchestrator.handle(request("/about", GOOGLEBOT)).await;
    assert_eq!(second.cache_status, Some(CacheStatus::Hit));
    assert_eq!(cache_header(&second.response), Some("HIT"));
    assert_eq!(second.response.headers().get("age").unwrap(), "0");
    assert_eq!(body_string(second.response).await, "<h1>render 1</h1>");

    assert_eq!(h.renderer.calls(), 1);
    assert_eq!(h.origin.calls(), 0);
}

#[tokio::test]
async fn test_render_params_share_cache_entry() {
    let h = default_harness(Mode::Succeed);

    h.orchestrator
        .handle(request("/pricing?plan=pro", GOOGLEBOT))
        .await;
    let forced = h
        .orchestrator
        .handle(request("/pricing?plan=pro&render=true", BROWSER))
        .await;

    assert_eq!(forced.cache_status, Some(CacheStatus::Hit));
    assert_eq!(h.renderer.calls(), 1);
    assert!(h
        .orchestrator
        .cache()
        .get("http://origin.test/pricing?plan=pro")
        .await
        .is_some());
}

#[tokio::test]
async fn test_non_cacheable_status_is_served_but_not_stored() {
    let h = default_harness(Mode::Status(404));

    let first = h.orchestrator.handle(request("/missing", GOOGLEBOT)).await;
    assert_eq!(first.response.status(), StatusCode::NOT_FOUND);
    assert_eq!(cache_header(&first.response), Some("MISS"));

    let second = h.orchestrator.handle(request("/missing", GOOGLEBOT)).await;
    assert_eq!(second.cache_status, Some(CacheStatus::Miss));
    assert_eq!(h.renderer.calls(), 2);
    assert!(h.orchestrator.cache().is_empty().await);
}

#[tokio::test]
async fn test_redirect_status_is_cached() {
    let h = default_harness(Mode::Status(301));

    let first = h.orchestrator.handle(request("/old", GOOGLEBOT)).await;
    assert_eq!(first.response.status(), StatusCode::MOVED_PERMANENTLY);

    let second = h.orchestrator.handle(request("/old", GOOGLEBOT)).await;
    assert_eq!(second.cache_status, Some(CacheStatus::Hit));
    assert_eq!(second.response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(h.renderer.calls(), 1);
}

#[tokio::test]
async fn test_origin_error_status_is_served_but_not_stored() {
    let h = default_harness(Mode::HttpStatus(404));

    let first = h.orchestrator.handle(request("/deleted", GOOGLEBOT)).await;
    assert_eq!(first.response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_string(first.response).await, "<h1>Not here</h1>");

    let second = h.orchestrator.handle(request("/deleted", GOOGLEBOT)).await;
    assert_eq!(second.cache_status, Some(CacheStatus::Miss));
    assert!(h.orchestrator.cache().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_render() {
    let h = harness(
        FakeRenderer::new(Mode::Succeed).with_delay(Duration::from_millis(200)),
        BreakerConfig::default(),
        CacheConfig::default(),
    );
    let renderer = Arc::clone(&h.renderer);
    let orchestrator = Arc::new(h.orchestrator);

    let results = concurrent(&orchestrator, "/about", 5).await;

    assert_eq!(renderer.calls(), 1);
    assert!(results
        .iter()
        .all(|(_, body)| body == "<h1>render 1</h1>"));
    let misses = results
        .iter()
        .filter(|(status, _)| *status == Some(CacheStatus::Miss))
        .count();
    let hits = results
        .iter()
        .filter(|(status, _)| *status == Some(CacheStatus::Hit))
        .count();
    assert_eq!((misses, hits), (1, 4));
    assert_eq!(orchestrator.cache().revalidation().active(), 0);
}

#[tokio::test]
async fn test_debug_render_bypasses_cache() {
    let h = default_harness(Mode::Succeed);

    let result = h
        .orchestrator
        .handle(request("/about?render=debug", BROWSER))
        .await;

    assert_eq!(result.action, Action::Render);
    assert_eq!(result.cache_status, Some(CacheStatus::Bypass));
    assert_eq!(result.response.status(), StatusCode::OK);
    assert_eq!(cache_header(&result.response), Some("BYPASS"));

    let json: serde_json::Value =
        serde_json::from_str(&body_string(result.response).await).unwrap();
    assert_eq!(json["url"], "http://origin.test/about");
    assert_eq!(json["cache_key"], "http://origin.test/about");
    assert_eq!(json["cache_decision"], "bypass");
    assert_eq!(json["status_code"], 200);
    assert_eq!(json["strategy"], "network_idle");
    assert_eq!(json["html_bytes"], "<h1>render 1</h1>".len());
    assert_eq!(json["circuit_state"], "CLOSED");
    assert_eq!(json["bot_signal"]["is_bot"], false);
    assert!(json["error"].is_null());

    assert!(h.orchestrator.cache().is_empty().await);

    // A later crawler request still renders
    let crawl = h.orchestrator.handle(request("/about", GOOGLEBOT)).await;
    assert_eq!(crawl.cache_status, Some(CacheStatus::Miss));
    assert_eq!(h.renderer.calls(), 2);
}

#[tokio::test]
async fn test_debug_render_reports_failure() {
    let h = default_harness(Mode::Crash);

    let result = h
        .orchestrator
        .handle(request("/about?_render=debug", GOOGLEBOT))
        .await;

    assert_eq!(result.response.status(), StatusCode::OK);
    let json: serde_json::Value =
        serde_json::from_str(&body_string(result.response).await).unwrap();
    assert_eq!(json["bot_signal"]["is_bot"], true);
    assert_eq!(json["status_code"], 502);
    assert!(json["error"].as_str().unwrap().contains("target closed"));
    assert_eq!(json["fallback_used"], false);
    assert_eq!(h.origin.calls(), 0);
}

// ============================================================================
// Stale-while-revalidate
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stale_hits_share_one_revalidation() {
    let h = harness(
        FakeRenderer::new(Mode::Succeed).with_delay(Duration::from_millis(200)),
        BreakerConfig::default(),
        CacheConfig::default().with_default_ttl(Duration::from_secs(10)),
    );

    let first = h.orchestrator.handle(request("/blog", GOOGLEBOT)).await;
    assert_eq!(first.cache_status, Some(CacheStatus::Miss));
    assert_eq!(h.renderer.calls(), 1);

    // Past 80% of the TTL but not expired
    tokio::time::advance(Duration::from_secs(9)).await;

    let renderer = Arc::clone(&h.renderer);
    let orchestrator = Arc::new(h.orchestrator);
    let results = concurrent(&orchestrator, "/blog", 5).await;
    for (status, body) in &results {
        assert_eq!(*status, Some(CacheStatus::Stale));
        assert_eq!(body, "<h1>render 1</h1>");
    }

    // Let the background refresh finish
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(renderer.calls(), 2);
    assert!(!orchestrator.cache().revalidation().is_revalidating("http://origin.test/blog"));
    assert_eq!(orchestrator.cache().stats().await.collapsed_revalidations, 4);

    let fresh = orchestrator.handle(request("/blog", GOOGLEBOT)).await;
    assert_eq!(fresh.cache_status, Some(CacheStatus::Hit));
    assert_eq!(body_string(fresh.response).await, "<h1>render 2</h1>");
}

#[tokio::test(start_paused = true)]
async fn test_failed_revalidation_keeps_stale_entry() {
    let h = harness(
        FakeRenderer::new(Mode::Succeed),
        BreakerConfig::default(),
        CacheConfig::default().with_default_ttl(Duration::from_secs(10)),
    );

    h.orchestrator.handle(request("/docs", GOOGLEBOT)).await;
    h.renderer.set_mode(Mode::Crash);
    tokio::time::advance(Duration::from_secs(9)).await;

    let stale = h.orchestrator.handle(request("/docs", GOOGLEBOT)).await;
    assert_eq!(stale.cache_status, Some(CacheStatus::Stale));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let again = h.orchestrator.handle(request("/docs", GOOGLEBOT)).await;
    assert_eq!(again.cache_status, Some(CacheStatus::Stale));
    assert_eq!(body_string(again.response).await, "<h1>render 1</h1>");
    assert_eq!(h.origin.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_revalidation_to_error_status_drops_entry() {
    let h = harness(
        FakeRenderer::new(Mode::Succeed),
        BreakerConfig::default(),
        CacheConfig::default().with_default_ttl(Duration::from_secs(10)),
    );

    h.orchestrator.handle(request("/product/7", GOOGLEBOT)).await;
    h.renderer.set_mode(Mode::Status(404));
    tokio::time::advance(Duration::from_secs(9)).await;

    h.orchestrator.handle(request("/product/7", GOOGLEBOT)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h
        .orchestrator
        .cache()
        .get("http://origin.test/product/7")
        .await
        .is_none());
}

// ============================================================================
// Circuit breaker and fallback
// ============================================================================

#[tokio::test]
async fn test_render_failure_falls_back_to_origin() {
    let h = default_harness(Mode::Crash);

    let result = h.orchestrator.handle(request("/about", GOOGLEBOT)).await;

    assert_eq!(result.cache_status, Some(CacheStatus::Miss));
    assert_eq!(result.response.status(), StatusCode::OK);
    assert_eq!(cache_header(&result.response), Some("MISS"));
    assert_eq!(
        result.response.headers().get("x-ssr-fallback").unwrap(),
        "origin"
    );
    assert_eq!(body_string(result.response).await, "<div id=\"app\"></div>");
    assert!(h.orchestrator.cache().is_empty().await);
    assert_eq!(h.orchestrator.metrics().origin_fallbacks.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_open_circuit_skips_render() {
    let h = harness(
        FakeRenderer::new(Mode::Crash),
        BreakerConfig::default().with_failure_threshold(3),
        CacheConfig::default(),
    );

    for _ in 0..3 {
        let result = h.orchestrator.handle(request("/about", GOOGLEBOT)).await;
        assert_eq!(result.response.status(), StatusCode::OK);
    }
    assert_eq!(h.orchestrator.breaker().state(), CircuitState::Open);
    assert_eq!(h.renderer.calls(), 3);

    let result = h.orchestrator.handle(request("/about", GOOGLEBOT)).await;
    assert_eq!(result.response.status(), StatusCode::OK);
    assert_eq!(
        result.response.headers().get("x-ssr-fallback").unwrap(),
        "origin"
    );
    assert_eq!(h.renderer.calls(), 3);
    assert_eq!(h.origin.calls(), 4);
    assert_eq!(h.orchestrator.breaker().snapshot().short_circuited, 1);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_recovers_after_reset_timeout() {
    let h = harness(
        FakeRenderer::new(Mode::Crash),
        BreakerConfig::default()
            .with_failure_threshold(2)
            .with_success_threshold(1)
            .with_reset_timeout(Duration::from_secs(5)),
        CacheConfig::default(),
    );

    for _ in 0..2 {
        h.orchestrator.handle(request("/home", GOOGLEBOT)).await;
    }
    assert_eq!(h.orchestrator.breaker().state(), CircuitState::Open);

    h.renderer.set_mode(Mode::Succeed);
    tokio::time::advance(Duration::from_secs(6)).await;

    let result = h.orchestrator.handle(request("/home", GOOGLEBOT)).await;
    assert_eq!(result.cache_status, Some(CacheStatus::Miss));
    assert!(result.response.headers().get("x-ssr-fallback").is_none());
    assert_eq!(h.orchestrator.breaker().state(), CircuitState::Closed);
}

/// Cache a page, make it stale, then let its background refresh crash
async fn fail_background_refresh(revalidation_counts_toward_breaker: bool) -> Harness {
    let Harness {
        orchestrator,
        renderer,
        origin,
    } = harness(
        FakeRenderer::new(Mode::Succeed),
        BreakerConfig::default().with_failure_threshold(1),
        CacheConfig::default().with_default_ttl(Duration::from_secs(10)),
    );
    let h = Harness {
        orchestrator: orchestrator.with_config(OrchestratorConfig {
            revalidation_counts_toward_breaker,
        }),
        renderer,
        origin,
    };

    let first = h.orchestrator.handle(request("/news", GOOGLEBOT)).await;
    assert_eq!(first.cache_status, Some(CacheStatus::Miss));

    h.renderer.set_mode(Mode::Crash);
    tokio::time::advance(Duration::from_secs(9)).await;

    let stale = h.orchestrator.handle(request("/news", GOOGLEBOT)).await;
    assert_eq!(stale.cache_status, Some(CacheStatus::Stale));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.renderer.calls(), 2);
    assert_eq!(
        h.orchestrator.metrics().revalidation_failures.load(Ordering::Relaxed),
        1
    );
    h
}

#[tokio::test(start_paused = true)]
async fn test_untracked_refresh_failure_leaves_circuit_closed() {
    let h = fail_background_refresh(false).await;
    assert_eq!(h.orchestrator.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_tracked_refresh_failure_opens_circuit() {
    let h = fail_background_refresh(true).await;
    assert_eq!(h.orchestrator.breaker().state(), CircuitState::Open);
}

// ============================================================================
// Resources and observability
// ============================================================================

#[tokio::test]
async fn test_page_pool_returns_to_baseline() {
    let h = default_harness(Mode::Succeed);

    for path in ["/a", "/b", "/c?x=1", "/a?render=debug"] {
        h.orchestrator.handle(request(path, GOOGLEBOT)).await;
    }
    h.renderer.set_mode(Mode::Crash);
    h.orchestrator.handle(request("/d", GOOGLEBOT)).await;

    let stats = h.orchestrator.renderer().stats();
    assert_eq!(stats.available_pages, 2);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
}

#[tokio::test]
async fn test_traffic_events_recorded() {
    let h = default_harness(Mode::Succeed);
    let (sink, mut rx) = ChannelTrafficSink::new(8);
    let orchestrator = h.orchestrator.with_traffic_sink(Arc::new(sink));

    orchestrator.handle(request("/about", GOOGLEBOT)).await;
    orchestrator.handle(request("/about", BROWSER)).await;

    let rendered = rx.recv().await.unwrap();
    assert_eq!(rendered.path, "/about");
    assert!(rendered.is_bot);
    assert_eq!(rendered.action, Action::Render);
    assert_eq!(rendered.cache_status.as_deref(), Some("MISS"));
    assert_eq!(rendered.status_code, 200);

    let proxied = rx.recv().await.unwrap();
    assert!(!proxied.is_bot);
    assert_eq!(proxied.action, Action::Proxy);
    assert_eq!(
        serde_json::to_value(&proxied).unwrap()["action"],
        serde_json::json!("PROXY")
    );
    assert_eq!(proxied.cache_status, None);
}

#[tokio::test]
async fn test_custom_classifier_is_used() {
    struct EveryoneIsABot;
    impl rendergate::BotClassifier for EveryoneIsABot {
        fn classify(
            &self,
            _user_agent: Option<&str>,
            _ip: Option<std::net::IpAddr>,
            _headers: &HeaderMap,
        ) -> BotSignal {
            BotSignal::bot(1.0, vec!["test".into()])
        }
    }

    let h = default_harness(Mode::Succeed);
    let orchestrator = h.orchestrator.with_classifier(Arc::new(EveryoneIsABot));

    let result = orchestrator.handle(request("/about", BROWSER)).await;
    assert_eq!(result.action, Action::Render);
}
