//! Origin proxy
//!
//! Human traffic, static assets and render fallbacks are forwarded to the
//! origin application untouched apart from hop-by-hop headers, which are
//! stripped in both directions (RFC 7230 section 6.1). Redirects are not
//! followed: the client sees the origin's 3xx as-is.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{GatewayError, GatewayResult};

/// Connection-scoped headers that must not be forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response relayed from the origin
#[derive(Debug, Clone)]
pub struct OriginResponse {
    /// Origin status
    pub status: StatusCode,
    /// Origin headers, hop-by-hop headers removed
    pub headers: HeaderMap,
    /// Origin body
    pub body: Bytes,
}

impl OriginResponse {
    /// Plain response, mostly useful for tests and fallbacks
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Forwards a request to the origin application
#[async_trait]
pub trait OriginProxy: Send + Sync + 'static {
    /// Forward a request to `url` and return the origin's response
    async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> GatewayResult<OriginResponse>;
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Join the origin base URL with a request's path and query
///
/// Any path prefix on the base is kept.
pub fn origin_url(base: &Url, path_and_query: &str) -> String {
    let base = base.as_str().trim_end_matches('/');
    if path_and_query.starts_with('/') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

/// Origin proxy settings
#[derive(Debug, Clone)]
pub struct OriginConfig {
    /// Origin base URL
    pub base_url: Url,
    /// Whole-request timeout
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl OriginConfig {
    /// Settings for `base_url` with default timeouts
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// [`OriginProxy`] over HTTP
#[derive(Debug, Clone)]
pub struct HttpOriginProxy {
    client: reqwest::Client,
    config: OriginConfig,
}

impl HttpOriginProxy {
    /// Build the HTTP client
    pub fn new(config: OriginConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Config(format!("origin client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Origin base URL
    pub fn base_url(&self) -> &Url {
        &self.config.base_url
    }
}

#[async_trait]
impl OriginProxy for HttpOriginProxy {
    #[instrument(name = "origin", skip(self, headers, body))]
    async fn forward(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> GatewayResult<OriginResponse> {
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Origin request failed");
                GatewayError::Origin(e.to_string())
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        // The body is re-framed by the gateway
        headers.remove(header::CONTENT_LENGTH);

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Origin(format!("reading body: {}", e)))?;

        debug!(status = status.as_u16(), bytes = body.len(), "Origin responded");
        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}
