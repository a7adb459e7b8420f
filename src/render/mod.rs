//! Render subsystem
//!
//! The only part of the gateway that drives a browser. [`RenderManager`]
//! owns the bounded page pool and the navigation fallback chain; the
//! browser itself sits behind the narrow [`Renderer`] trait so tests and
//! alternative engines can stand in for Chromium.
//!
//! ```text
//! RenderRequest ──▶ PagePool ──▶ NetworkIdle ──timeout──▶ NetworkAlmostIdle
//!                   (lease)          │                          │
//!                                    ▼                     timeout
//!                                 document ◀── DomContentLoaded ◀┘
//!                                    │            + settle delay
//!                                    ▼
//!                              status probe ──▶ RenderResult
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "chromium")]
pub mod chromium;
pub mod manager;
pub mod status;

#[cfg(feature = "chromium")]
pub use chromium::{ChromiumConfig, ChromiumRenderer};
pub use manager::{PageLease, PagePool, RenderConfig, RenderManager, RenderStats};
pub use status::{is_valid_status, parse_status_meta};

// ============================================================================
// Errors
// ============================================================================

/// Render failures
///
/// These never reach the HTTP layer directly; the orchestrator folds them
/// into [`GatewayError`](crate::error::GatewayError).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Every wait strategy ran out of time
    #[error("Render timed out after {timeout_ms}ms")]
    Timeout {
        /// Overall render budget
        timeout_ms: u64,
    },

    /// The browser or tab died
    #[error("Browser crashed: {0}")]
    Crash(String),

    /// Navigation failed (DNS, TLS, aborted load)
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// The page pool and its wait queue are both full
    #[error("Render capacity exceeded ({queued} requests queued)")]
    CapacityExceeded {
        /// Queue depth at rejection time
        queued: usize,
    },

    /// The page rendered to an empty document
    #[error("Rendered document is empty")]
    EmptyDocument,
}

impl RenderError {
    /// Short machine-readable error type
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "render_timeout",
            Self::Crash(_) => "render_crash",
            Self::Navigation(_) => "render_navigation",
            Self::CapacityExceeded { .. } => "render_capacity",
            Self::EmptyDocument => "render_empty",
        }
    }
}

// ============================================================================
// Wait strategies
// ============================================================================

/// How long to wait after navigation before snapshotting the DOM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// No network activity for 500ms
    NetworkIdle,
    /// Network mostly quiet for 250ms
    NetworkAlmostIdle,
    /// `DOMContentLoaded` plus a fixed settle delay
    DomContentLoaded,
}

impl WaitStrategy {
    /// Fallback order, most thorough first
    pub const CHAIN: [WaitStrategy; 3] = [
        WaitStrategy::NetworkIdle,
        WaitStrategy::NetworkAlmostIdle,
        WaitStrategy::DomContentLoaded,
    ];

    /// Strategy name used in logs, headers and diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkIdle => "network_idle",
            Self::NetworkAlmostIdle => "network_almost_idle",
            Self::DomContentLoaded => "dom_content_loaded",
        }
    }

    /// Quiet window for the network-based strategies
    pub fn quiet_window(&self) -> Option<Duration> {
        match self {
            Self::NetworkIdle => Some(Duration::from_millis(500)),
            Self::NetworkAlmostIdle => Some(Duration::from_millis(250)),
            Self::DomContentLoaded => None,
        }
    }

    /// Share of the overall budget given to this step
    ///
    /// `remaining` is what is left of the budget when the step starts; the
    /// last step always gets all of it.
    pub fn budget(&self, total: Duration, remaining: Duration) -> Duration {
        let share = match self {
            Self::NetworkIdle => total / 2,
            Self::NetworkAlmostIdle => total / 4,
            Self::DomContentLoaded => remaining,
        };
        share.min(remaining)
    }
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Requests and results
// ============================================================================

/// Scheduling class of a render
///
/// Carried for logs and metrics; the page pool queue is strictly FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPriority {
    /// A crawler is waiting on the response
    #[default]
    Interactive,
    /// Stale-while-revalidate refresh
    Background,
}

impl RenderPriority {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Background => "background",
        }
    }
}

/// A render job
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Absolute URL to render
    pub url: String,
    /// Overall budget, `None` for the manager default
    pub timeout: Option<Duration>,
    /// Scheduling class
    pub priority: RenderPriority,
}

impl RenderRequest {
    /// Interactive render with the default timeout
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: None,
            priority: RenderPriority::Interactive,
        }
    }

    /// Override the overall budget
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the scheduling class
    pub fn with_priority(mut self, priority: RenderPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// What a [`Renderer`] hands back for one navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    /// Serialized DOM
    pub html: String,
    /// HTTP status of the main document response, if the engine saw one
    pub status_code: Option<u16>,
}

impl RenderedDocument {
    /// Document without an engine-reported status
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            status_code: None,
        }
    }

    /// Attach the main document's HTTP status
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// Outcome of [`RenderManager::render`]
#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    /// Rendered HTML on success
    pub html: Option<String>,
    /// Status requested by the page via meta tag or the engine
    pub status_code_override: Option<u16>,
    /// Wall time including queueing
    pub duration_ms: u64,
    /// Failure, if any
    pub error: Option<RenderError>,
    /// Strategy that produced the document
    pub strategy: Option<WaitStrategy>,
}

impl RenderResult {
    pub(crate) fn success(
        html: String,
        status_code_override: Option<u16>,
        strategy: WaitStrategy,
        duration_ms: u64,
    ) -> Self {
        Self {
            html: Some(html),
            status_code_override,
            duration_ms,
            error: None,
            strategy: Some(strategy),
        }
    }

    pub(crate) fn failure(error: RenderError, duration_ms: u64) -> Self {
        Self {
            html: None,
            status_code_override: None,
            duration_ms,
            error: Some(error),
            strategy: None,
        }
    }

    /// Whether a document was produced
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.html.is_some()
    }

    /// Status to serve the document with
    pub fn status_code(&self) -> u16 {
        self.status_code_override.unwrap_or(200)
    }

    /// Split into a `Result` for breaker bookkeeping
    pub fn into_result(self) -> Result<Self, RenderError> {
        match (&self.error, &self.html) {
            (Some(error), _) => Err(error.clone()),
            (None, None) => Err(RenderError::EmptyDocument),
            (None, Some(_)) => Ok(self),
        }
    }
}

// ============================================================================
// Renderer seam
// ============================================================================

/// A browser engine able to load a URL and serialize the resulting DOM
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    /// Navigate to `url`, wait according to `wait`, return the DOM
    ///
    /// Implementations should give up after `timeout` and report
    /// [`RenderError::Timeout`]; the manager enforces the bound as well.
    async fn navigate(
        &self,
        url: &str,
        wait: WaitStrategy,
        timeout: Duration,
    ) -> Result<RenderedDocument, RenderError>;

    /// Release engine resources at shutdown
    async fn close(&self) {}
}
