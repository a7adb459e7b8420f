//! RenderGate - Bot-Aware Prerender Gateway
//!
//! A reverse proxy that sits in front of a single-page application. Human
//! visitors are proxied straight to the origin; crawlers get a fully
//! rendered HTML snapshot produced by a headless browser.
//!
//! # Architecture
//!
//! ```text
//!                   ┌──────────────┐
//! request ─────────▶│ DecisionGate │── STATIC / PROXY / BYPASS ──▶ OriginProxy
//!                   └──────┬───────┘
//!                          │ RENDER
//!                          ▼
//!                   ┌──────────────┐  fresh / stale
//!                   │   SwrCache   │──────────────▶ cached snapshot
//!                   └──────┬───────┘       (stale: single-flight refresh)
//!                          │ miss
//!                          ▼
//!                   ┌──────────────┐  open / failed
//!                   │CircuitBreaker│──────────────▶ OriginProxy (fallback)
//!                   └──────┬───────┘
//!                          ▼
//!                   ┌──────────────┐
//!                   │RenderManager │── page pool ──▶ Renderer (Chromium/CDP)
//!                   └──────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use rendergate::render::{RenderError, RenderedDocument, Renderer, WaitStrategy};
//! use rendergate::{
//!     BreakerConfig, CacheConfig, CircuitBreaker, DecisionGate, GateConfig, HttpOriginProxy,
//!     Orchestrator, OriginConfig, RenderConfig, RenderManager, SwrCache,
//! };
//!
//! struct StaticRenderer;
//!
//! #[async_trait]
//! impl Renderer for StaticRenderer {
//!     async fn navigate(
//!         &self,
//!         _url: &str,
//!         _wait: WaitStrategy,
//!         _timeout: std::time::Duration,
//!     ) -> Result<RenderedDocument, RenderError> {
//!         Ok(RenderedDocument::new("<html><body>hello</body></html>"))
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let origin_url = rendergate::config::parse_origin("http://127.0.0.1:3000")?;
//! let origin = Arc::new(HttpOriginProxy::new(OriginConfig::new(origin_url.clone()))?);
//!
//! let orchestrator = Orchestrator::new(
//!     DecisionGate::new(GateConfig::default()),
//!     Arc::new(SwrCache::new(CacheConfig::default())),
//!     Arc::new(RenderManager::new(Arc::new(StaticRenderer), RenderConfig::default())),
//!     Arc::new(CircuitBreaker::new("render", BreakerConfig::default())),
//!     origin,
//!     origin_url,
//! );
//! # let _ = orchestrator;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bot;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod orchestrator;
pub mod origin;
pub mod render;
pub mod server;
pub mod shutdown;
pub mod tracing_middleware;
pub mod traffic;

pub use bot::{BotClassifier, BotSignal, UserAgentClassifier};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState, ExecutionResult};
pub use cache::{derive_key, CacheConfig, CacheLookup, CacheStats, SwrCache};
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gate::{Action, Decision, DecisionGate, GateConfig, GateInput};
pub use metrics::GatewayMetrics;
pub use orchestrator::{CacheStatus, GatewayResponse, InboundRequest, Orchestrator, OrchestratorConfig};
pub use origin::{HttpOriginProxy, OriginConfig, OriginProxy, OriginResponse};
pub use render::{RenderConfig, RenderError, RenderManager, RenderResult, Renderer};
pub use server::{build_router, AppState};
pub use shutdown::{shutdown_signal, ShutdownController};
pub use traffic::{TrafficEvent, TrafficSink};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
