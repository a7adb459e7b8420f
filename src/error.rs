//! Gateway error types
//!
//! Errors are split by layer. [`RenderError`](crate::render::RenderError)
//! belongs to the render subsystem and never reaches the HTTP layer on its
//! own; the circuit breaker and orchestrator fold it into [`GatewayError`],
//! which carries the HTTP status mapping.

use std::time::Duration;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::render::RenderError;

/// Crate-level error type with HTTP status code mapping
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    // =========================================================================
    // Request classification (defaults to PROXY, never surfaced)
    // =========================================================================
    /// The inbound request could not be classified
    #[error("Malformed request: {0}")]
    Classification(String),

    // =========================================================================
    // Render pipeline
    // =========================================================================
    /// The render subsystem failed
    #[error("Render failed: {0}")]
    Render(#[from] RenderError),

    /// The circuit breaker short-circuited the call
    #[error("Circuit open: render subsystem unavailable, retry in {retry_in_ms}ms")]
    CircuitOpen {
        /// Milliseconds until the breaker admits a trial call
        retry_in_ms: u64,
    },

    /// A breaker-guarded operation exceeded its hard timeout
    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),

    // =========================================================================
    // Origin
    // =========================================================================
    /// The origin application could not be reached or answered badly
    #[error("Origin error: {0}")]
    Origin(String),

    // =========================================================================
    // Startup
    // =========================================================================
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O failure (socket bind, browser process)
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Render(RenderError::CapacityExceeded { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Render(RenderError::Timeout { .. }) | Self::OperationTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Render(_) | Self::Origin(_) => StatusCode::BAD_GATEWAY,
            Self::Classification(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error type, used as a metrics label
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Classification(_) => "classification",
            Self::Render(e) => e.error_type(),
            Self::CircuitOpen { .. } => "circuit_open",
            Self::OperationTimeout(_) => "operation_timeout",
            Self::Origin(_) => "origin",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }

    /// Whether the circuit breaker should count this as a render failure
    pub fn is_render_failure(&self) -> bool {
        matches!(self, Self::Render(_) | Self::OperationTimeout(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Minimal HTML error page served to crawlers when every path failed
pub fn error_page(status: StatusCode) -> String {
    let reason = status.canonical_reason().unwrap_or("Error");
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{code} {reason}</title>\
         <meta name=\"robots\" content=\"noindex\"></head>\
         <body><h1>{code} {reason}</h1></body></html>",
        code = status.as_u16(),
        reason = reason
    )
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        metrics::counter!("rendergate_errors_total", "type" => self.error_type()).increment(1);

        let mut response = (
            status,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            error_page(status),
        )
            .into_response();

        if let Self::CircuitOpen { retry_in_ms } = self {
            let secs = retry_in_ms.div_ceil(1000).max(1);
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::CircuitOpen { retry_in_ms: 10 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Origin("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Render(RenderError::Timeout { timeout_ms: 5 }).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Render(RenderError::CapacityExceeded { queued: 4 }).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Render(RenderError::Crash("gone".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_render_failure_classification() {
        assert!(GatewayError::Render(RenderError::EmptyDocument).is_render_failure());
        assert!(GatewayError::OperationTimeout(Duration::from_secs(1)).is_render_failure());
        assert!(!GatewayError::Origin("x".into()).is_render_failure());
        assert!(!GatewayError::CircuitOpen { retry_in_ms: 0 }.is_render_failure());
    }

    #[test]
    fn test_error_page_is_minimal_html() {
        let page = error_page(StatusCode::BAD_GATEWAY);
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("502 Bad Gateway"));
        assert!(page.contains("noindex"));
    }

    #[test]
    fn test_circuit_open_response_has_retry_after() {
        let response = GatewayError::CircuitOpen { retry_in_ms: 2500 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }
}
