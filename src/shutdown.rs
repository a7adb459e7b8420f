//! Graceful shutdown
//!
//! ```text
//! SIGTERM / SIGINT / Ctrl+C
//!         │
//!         ▼
//! ShutdownController::initiate_shutdown
//!         │   state: Running → Draining
//!         ├──▶ ShutdownLayer answers new requests with 503 + Retry-After
//!         ├──▶ axum stops accepting connections
//!         ▼
//! wait until in-flight requests reach zero (bounded by drain timeout)
//!         │   state: Draining → Stopped
//!         ▼
//! RenderManager::shutdown closes the page pool and the browser
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, error, info, warn};

use crate::error::error_page;

/// Default time allowed for in-flight requests to finish
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Added to the remaining drain time in `Retry-After`
const RETRY_AFTER_PADDING_SECS: u64 = 5;

/// Lifecycle of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownState {
    /// Serving traffic
    Running,
    /// Refusing new requests, finishing in-flight ones
    Draining,
    /// Drained (or gave up waiting)
    Stopped,
}

impl std::fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// Coordinates draining; cheap to clone
#[derive(Clone)]
pub struct ShutdownController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    shutting_down: AtomicBool,
    state_tx: watch::Sender<ShutdownState>,
    notify: Notify,
    in_flight: AtomicU64,
    drain_timeout: Duration,
    started: RwLock<Option<Instant>>,
}

impl std::fmt::Debug for ShutdownController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownController")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("drain_timeout", &self.inner.drain_timeout)
            .finish()
    }
}

impl ShutdownController {
    /// Controller with the default drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS))
    }

    /// Controller with a custom drain timeout
    pub fn with_timeout(drain_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ShutdownState::Running);
        Self {
            inner: Arc::new(ControllerInner {
                shutting_down: AtomicBool::new(false),
                state_tx,
                notify: Notify::new(),
                in_flight: AtomicU64::new(0),
                drain_timeout,
                started: RwLock::new(None),
            }),
        }
    }

    /// Whether draining has begun
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Current state
    pub fn state(&self) -> ShutdownState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions
    pub fn state_receiver(&self) -> watch::Receiver<ShutdownState> {
        self.inner.state_tx.subscribe()
    }

    /// Requests currently being handled
    pub fn in_flight(&self) -> u64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Configured drain timeout
    pub fn drain_timeout(&self) -> Duration {
        self.inner.drain_timeout
    }

    /// Track a request until the guard is dropped
    pub fn request_guard(&self) -> RequestGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            controller: self.clone(),
        }
    }

    /// Resolves once [`initiate_shutdown`](Self::initiate_shutdown) has been called
    pub async fn wait_for_shutdown(&self) {
        let notified = self.inner.notify.notified();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Time since draining began
    pub fn shutdown_elapsed(&self) -> Option<Duration> {
        self.inner
            .started
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|started| started.elapsed())
    }

    /// `Retry-After` for requests refused while draining
    pub fn retry_after_secs(&self) -> u64 {
        let remaining = match self.shutdown_elapsed() {
            Some(elapsed) => self.inner.drain_timeout.saturating_sub(elapsed),
            None => self.inner.drain_timeout,
        };
        remaining.as_secs() + RETRY_AFTER_PADDING_SECS
    }

    /// Stop admitting requests and wait for in-flight ones; runs once
    pub async fn initiate_shutdown(&self) {
        if self
            .inner
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already in progress");
            return;
        }

        *self
            .inner
            .started
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
        self.set_state(ShutdownState::Draining);
        self.inner.notify.notify_waiters();

        self.drain().await;
        self.set_state(ShutdownState::Stopped);
    }

    fn set_state(&self, state: ShutdownState) {
        self.inner.state_tx.send_replace(state);
        info!(state = %state, "Shutdown state changed");
    }

    async fn drain(&self) {
        let deadline = Instant::now() + self.inner.drain_timeout;
        info!(
            in_flight = self.in_flight(),
            timeout = ?self.inner.drain_timeout,
            "Draining in-flight requests"
        );

        loop {
            let active = self.in_flight();
            if active == 0 {
                info!("All requests drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(in_flight = active, "Drain timeout reached");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Health payload for the admin endpoint
    pub fn health_status(&self) -> HealthStatus {
        let state = self.state();
        let draining = state != ShutdownState::Running;
        HealthStatus {
            status: if draining { "draining" } else { "ok" },
            healthy: !draining,
            state,
            in_flight: self.in_flight(),
            retry_after_secs: draining.then(|| self.retry_after_secs()),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop
#[derive(Debug)]
pub struct RequestGuard {
    controller: ShutdownController,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.controller.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Health endpoint body
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `ok` or `draining`
    pub status: &'static str,
    /// Whether the process accepts traffic
    pub healthy: bool,
    /// Lifecycle state
    pub state: ShutdownState,
    /// Requests being handled
    pub in_flight: u64,
    /// Suggested client backoff while draining
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Resolves on SIGTERM, SIGINT or Ctrl+C
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => {}
    }
}

/// Wait for a signal, then drive `controller` through draining
pub async fn shutdown_signal_with_controller(controller: ShutdownController) {
    shutdown_signal().await;
    controller.initiate_shutdown().await;
}

// ============================================================================
// Tower layer
// ============================================================================

/// Refuses requests with 503 once draining has begun and tracks the rest
#[derive(Debug, Clone)]
pub struct ShutdownLayer {
    controller: ShutdownController,
}

impl ShutdownLayer {
    /// Wrap services with `controller`
    pub fn new(controller: ShutdownController) -> Self {
        Self { controller }
    }
}

impl<S> Layer<S> for ShutdownLayer {
    type Service = ShutdownService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ShutdownService {
            inner,
            controller: self.controller.clone(),
        }
    }
}

/// Service produced by [`ShutdownLayer`]
#[derive(Debug, Clone)]
pub struct ShutdownService<S> {
    inner: S,
    controller: ShutdownController,
}

impl<S, ReqBody> Service<Request<ReqBody>> for ShutdownService<S>
where
    S: Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let controller = self.controller.clone();

        Box::pin(async move {
            if controller.is_shutting_down() {
                return Ok(draining_response(controller.retry_after_secs()));
            }

            let _guard = controller.request_guard();
            inner.call(req).await
        })
    }
}

fn draining_response(retry_after: u64) -> Response<Body> {
    let mut response = Response::new(Body::from(error_page(StatusCode::SERVICE_UNAVAILABLE)));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, retry_after.into());
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_controller_starts_running() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutting_down());
        assert_eq!(controller.state(), ShutdownState::Running);
        assert_eq!(controller.in_flight(), 0);
        assert!(controller.health_status().healthy);
    }

    #[tokio::test]
    async fn test_request_guard_tracks_in_flight() {
        let controller = ShutdownController::new();
        let first = controller.request_guard();
        let second = controller.request_guard();
        assert_eq!(controller.in_flight(), 2);

        drop(first);
        assert_eq!(controller.in_flight(), 1);
        drop(second);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_requests_stops() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(1));
        controller.initiate_shutdown().await;

        assert!(controller.is_shutting_down());
        assert_eq!(controller.state(), ShutdownState::Stopped);
        assert!(!controller.health_status().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_request() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(10));
        let guard = controller.request_guard();

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.initiate_shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(controller.state(), ShutdownState::Draining);

        drop(guard);
        task.await.unwrap();
        assert_eq!(controller.state(), ShutdownState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(2));
        let _stuck = controller.request_guard();

        controller.initiate_shutdown().await;
        assert_eq!(controller.state(), ShutdownState::Stopped);
        assert_eq!(controller.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_when_already_shutting_down() {
        let controller = ShutdownController::with_timeout(Duration::from_millis(10));
        controller.initiate_shutdown().await;
        controller.wait_for_shutdown().await;
    }

    #[test]
    fn test_retry_after_includes_padding() {
        let controller = ShutdownController::with_timeout(Duration::from_secs(30));
        assert_eq!(controller.retry_after_secs(), 35);
    }

    #[test]
    fn test_draining_response() {
        let response = draining_response(12);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "12");
    }
}
