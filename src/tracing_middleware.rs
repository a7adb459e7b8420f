//! Request tracing and log initialisation
//!
//! ```text
//! Request ──> RequestIdLayer ──> TraceLayer(RequestSpan) ──> Router
//!                  │                      │
//!                  ▼                      ▼
//!           X-Request-ID        http_request span: method, path,
//!           (echoed back)       client_ip, status, ssr_cache, duration_ms
//! ```
//!
//! Output format comes from `RG_LOG_FORMAT` (`json`, `pretty`, `compact`);
//! filtering from `RUST_LOG`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::{header, header::HeaderName, HeaderValue, Request, Response};
use tower::{Layer, Service};
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{MakeSpan, OnRequest, OnResponse, TraceLayer};
use tracing::{info_span, Span};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::orchestrator::SSR_CACHE_HEADER;

/// Request ID header
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Log format variable
pub const LOG_FORMAT_ENV: &str = "RG_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info,tower_http=info,chromiumoxide=warn,hyper=info";
const VERBOSE_FILTER: &str = "debug,chromiumoxide=info,hyper=info";

// ============================================================================
// Request ID
// ============================================================================

/// Identifier attached to every request and echoed in the response
#[derive(Clone, Debug)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Random v4 UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Reuse an upstream ID
    pub fn from_string<S: Into<String>>(id: S) -> Self {
        Self(id.into().into())
    }

    /// As a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reads or generates `X-Request-ID`
#[derive(Clone, Debug)]
pub struct RequestIdLayer {
    header_name: HeaderName,
}

impl RequestIdLayer {
    /// Layer using `x-request-id`
    pub fn new() -> Self {
        Self {
            header_name: HeaderName::from_static(REQUEST_ID_HEADER),
        }
    }
}

impl Default for RequestIdLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService {
            inner,
            header_name: self.header_name.clone(),
        }
    }
}

/// Service produced by [`RequestIdLayer`]
#[derive(Clone, Debug)]
pub struct RequestIdService<S> {
    inner: S,
    header_name: HeaderName,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestIdService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = RequestIdFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let request_id = request
            .headers()
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(RequestId::from_string)
            .unwrap_or_default();

        request.extensions_mut().insert(request_id.clone());

        RequestIdFuture {
            future: self.inner.call(request),
            request_id,
            header_name: self.header_name.clone(),
        }
    }
}

/// Future that stamps the request ID on the response
#[pin_project::pin_project]
pub struct RequestIdFuture<F> {
    #[pin]
    future: F,
    request_id: RequestId,
    header_name: HeaderName,
}

impl<F, ResBody, E> std::future::Future for RequestIdFuture<F>
where
    F: std::future::Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut response = futures::ready!(this.future.poll(cx))?;
        if let Ok(value) = HeaderValue::from_str(this.request_id.as_str()) {
            response.headers_mut().insert(this.header_name.clone(), value);
        }
        Poll::Ready(Ok(response))
    }
}

// ============================================================================
// Spans
// ============================================================================

/// Builds the `http_request` span
#[derive(Clone, Debug)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.as_str())
            .unwrap_or("unknown");
        let client_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| anonymize_ip(*addr))
            .unwrap_or_else(|| "unknown".to_string());

        info_span!(
            "http_request",
            request_id = %request_id,
            method = %request.method(),
            path = %request.uri().path(),
            client_ip = %client_ip,
            status = tracing::field::Empty,
            ssr_cache = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        )
    }
}

/// Drop the host part of client addresses before logging
fn anonymize_ip(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => {
            let [a, b, c, _] = v4.ip().octets();
            format!("{a}.{b}.{c}.0")
        }
        SocketAddr::V6(v6) => {
            let s = v6.ip().segments();
            format!("{:x}:{:x}:{:x}::", s[0], s[1], s[2])
        }
    }
}

/// Logs the request line with its user agent
#[derive(Clone, Debug)]
pub struct OnRequestLog;

impl<B> OnRequest<B> for OnRequestLog {
    fn on_request(&mut self, request: &Request<B>, _span: &Span) {
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        tracing::debug!(
            target: "http::request",
            uri = %request.uri(),
            user_agent,
            "incoming request"
        );
    }
}

/// Records status, cache outcome and latency
#[derive(Clone, Debug, Default)]
pub struct OnResponseLog;

impl<B> OnResponse<B> for OnResponseLog {
    fn on_response(self, response: &Response<B>, latency: Duration, span: &Span) {
        let status = response.status().as_u16();
        let duration_ms = latency.as_secs_f64() * 1000.0;
        let ssr_cache = response
            .headers()
            .get(SSR_CACHE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");

        span.record("status", status);
        span.record("ssr_cache", ssr_cache);
        span.record("duration_ms", duration_ms);

        match status {
            500.. => tracing::error!(target: "http::response", status, ssr_cache, duration_ms, "server error"),
            400..=499 => tracing::warn!(target: "http::response", status, ssr_cache, duration_ms, "client error"),
            _ => tracing::info!(target: "http::response", status, ssr_cache, duration_ms, "completed"),
        }
    }
}

/// tower-http trace layer wired to [`RequestSpan`] and the loggers above
pub fn request_tracing_layer(
) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan, OnRequestLog, OnResponseLog>
{
    TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_request(OnRequestLog)
        .on_response(OnResponseLog)
}

// ============================================================================
// Subscriber
// ============================================================================

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Multi-line, coloured
    #[default]
    Pretty,
    /// Single line
    Compact,
}

impl LogFormat {
    /// From `RG_LOG_FORMAT`; JSON in release builds when unset
    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| Self::parse(&s))
            .unwrap_or(if cfg!(debug_assertions) {
                Self::Pretty
            } else {
                Self::Json
            })
    }

    /// Parse a format name
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `verbose`. Returns `false` if a subscriber was
/// already installed.
pub fn init_tracing(format: LogFormat, verbose: bool) -> bool {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.is_ok()
}
