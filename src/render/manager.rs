//! Render manager and page pool
//!
//! The pool hands out page leases backed by a fair semaphore, so waiters
//! are served in arrival order. The wait queue is bounded: once
//! `queue_capacity` callers are already waiting, further renders fail fast
//! with [`RenderError::CapacityExceeded`] instead of piling up.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::status::{is_valid_status, parse_status_meta};
use super::{RenderError, RenderRequest, RenderResult, RenderedDocument, Renderer, WaitStrategy};

/// Default number of concurrent pages
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default number of renders allowed to wait for a page
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Default overall render budget
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Configuration
// ============================================================================

/// Render manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Page pool size
    pub max_concurrency: usize,
    /// Maximum callers waiting for a page
    pub queue_capacity: usize,
    /// Overall budget when the request does not carry one
    pub default_timeout: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_timeout: DEFAULT_RENDER_TIMEOUT,
        }
    }
}

impl RenderConfig {
    /// Set the page pool size
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the wait queue bound
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the default render budget
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

// ============================================================================
// Page pool
// ============================================================================

/// Fixed-size pool of page slots with a bounded FIFO wait queue
#[derive(Debug)]
pub struct PagePool {
    semaphore: Arc<Semaphore>,
    size: usize,
    queue_capacity: usize,
    waiting: AtomicUsize,
}

/// Exclusive use of one page slot, returned to the pool on drop
#[derive(Debug)]
pub struct PageLease {
    _permit: OwnedSemaphorePermit,
}

struct WaitingSlot<'a>(&'a AtomicUsize);

impl Drop for WaitingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PagePool {
    /// Create a pool of `size` pages
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            queue_capacity,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Lease a page, waiting in line if none is free
    pub async fn acquire(&self) -> Result<PageLease, RenderError> {
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(PageLease { _permit: permit });
        }

        let claimed = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < self.queue_capacity).then_some(waiting + 1)
            });
        if let Err(queued) = claimed {
            return Err(RenderError::CapacityExceeded { queued });
        }
        let _slot = WaitingSlot(&self.waiting);

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RenderError::Crash("page pool closed".to_string()))?;

        Ok(PageLease { _permit: permit })
    }

    /// Free page slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Callers waiting for a page
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Pool size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop handing out leases; waiters fail with a crash error
    pub fn close(&self) {
        self.semaphore.close();
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time render statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderStats {
    /// Page pool size
    pub max_concurrency: usize,
    /// Free page slots
    pub available_pages: usize,
    /// Renders holding a page
    pub in_flight: usize,
    /// Renders waiting for a page
    pub queued: usize,
    /// Renders that produced a document
    pub completed: u64,
    /// Renders that failed
    pub failed: u64,
    /// Renders refused because the queue was full
    pub capacity_rejections: u64,
    /// Times `network_idle` timed out and the chain moved on
    pub network_idle_fallbacks: u64,
    /// Times `network_almost_idle` timed out and the chain moved on
    pub network_almost_idle_fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    capacity_rejections: AtomicU64,
    network_idle_fallbacks: AtomicU64,
    network_almost_idle_fallbacks: AtomicU64,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Bounded, timeout-guarded access to a [`Renderer`]
pub struct RenderManager {
    renderer: Arc<dyn Renderer>,
    pool: PagePool,
    config: RenderConfig,
    counters: Counters,
}

impl std::fmt::Debug for RenderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderManager")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RenderManager {
    /// Create a manager around `renderer`
    pub fn new(renderer: Arc<dyn Renderer>, config: RenderConfig) -> Self {
        info!(
            max_concurrency = config.max_concurrency,
            queue_capacity = config.queue_capacity,
            "Render manager ready"
        );
        Self {
            renderer,
            pool: PagePool::new(config.max_concurrency, config.queue_capacity),
            config,
            counters: Counters::default(),
        }
    }

    /// Configuration (immutable)
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Render `url` interactively with the default budget
    pub async fn render_url(&self, url: &str) -> RenderResult {
        self.render(RenderRequest::new(url)).await
    }

    /// Render a page
    ///
    /// Never panics and never leaks a page lease: the lease is dropped on
    /// every exit path, including cancellation of this future.
    #[instrument(
        name = "render",
        skip(self, request),
        fields(url = %request.url, priority = request.priority.as_str())
    )]
    pub async fn render(&self, request: RenderRequest) -> RenderResult {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let outcome = self.run(&request.url, timeout, started + timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome.and_then(|(doc, strategy)| finish(doc, strategy)) {
            Ok((html, status, strategy)) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(
                    "rendergate_renders_total",
                    "outcome" => "success",
                    "priority" => request.priority.as_str()
                )
                .increment(1);
                metrics::histogram!(
                    "rendergate_render_duration_seconds",
                    "strategy" => strategy.as_str()
                )
                .record(started.elapsed().as_secs_f64());
                info!(
                    strategy = strategy.as_str(),
                    duration_ms,
                    status = ?status,
                    bytes = html.len(),
                    "Render completed"
                );
                RenderResult::success(html, status, strategy, duration_ms)
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if matches!(error, RenderError::CapacityExceeded { .. }) {
                    self.counters
                        .capacity_rejections
                        .fetch_add(1, Ordering::Relaxed);
                }
                metrics::counter!(
                    "rendergate_renders_total",
                    "outcome" => error.error_type(),
                    "priority" => request.priority.as_str()
                )
                .increment(1);
                warn!(error = %error, duration_ms, "Render failed");
                RenderResult::failure(error, duration_ms)
            }
        }
    }

    async fn run(
        &self,
        url: &str,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<(RenderedDocument, WaitStrategy), RenderError> {
        let timeout_ms = timeout.as_millis() as u64;

        let _lease = match tokio::time::timeout_at(deadline, self.pool.acquire()).await {
            Ok(lease) => lease?,
            Err(_) => {
                debug!("Timed out waiting for a page");
                return Err(RenderError::Timeout { timeout_ms });
            }
        };
        let _in_flight = InFlight::enter(&self.counters.in_flight);

        for strategy in WaitStrategy::CHAIN {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let budget = strategy.budget(timeout, remaining);

            let attempt =
                tokio::time::timeout(budget, self.renderer.navigate(url, strategy, budget)).await;
            match attempt {
                Ok(Ok(doc)) => return Ok((doc, strategy)),
                Ok(Err(RenderError::Timeout { .. })) | Err(_) => {
                    self.record_fallback(strategy);
                    debug!(
                        strategy = strategy.as_str(),
                        budget_ms = budget.as_millis() as u64,
                        "Wait strategy timed out"
                    );
                }
                Ok(Err(error)) => return Err(error),
            }
        }

        Err(RenderError::Timeout { timeout_ms })
    }

    fn record_fallback(&self, strategy: WaitStrategy) {
        let counter = match strategy {
            WaitStrategy::NetworkIdle => &self.counters.network_idle_fallbacks,
            WaitStrategy::NetworkAlmostIdle => &self.counters.network_almost_idle_fallbacks,
            WaitStrategy::DomContentLoaded => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rendergate_render_fallbacks_total", "from" => strategy.as_str())
            .increment(1);
    }

    /// Free page slots; equals `max_concurrency` when idle
    pub fn available_pages(&self) -> usize {
        self.pool.available()
    }

    /// The page pool
    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    /// Current statistics
    pub fn stats(&self) -> RenderStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RenderStats {
            max_concurrency: self.pool.size(),
            available_pages: self.pool.available(),
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
            queued: self.pool.waiting(),
            completed: load(&self.counters.completed),
            failed: load(&self.counters.failed),
            capacity_rejections: load(&self.counters.capacity_rejections),
            network_idle_fallbacks: load(&self.counters.network_idle_fallbacks),
            network_almost_idle_fallbacks: load(&self.counters.network_almost_idle_fallbacks),
        }
    }

    /// Stop accepting renders and release the engine
    pub async fn shutdown(&self) {
        self.pool.close();
        self.renderer.close().await;
        info!("Render manager shut down");
    }
}

/// Validate the document and resolve its status override
///
/// A `prerender-status-code` meta tag wins over the HTTP status of the
/// navigation, so an app shell served as 200 can still declare a 404.
fn finish(
    doc: RenderedDocument,
    strategy: WaitStrategy,
) -> Result<(String, Option<u16>, WaitStrategy), RenderError> {
    if doc.html.trim().is_empty() {
        return Err(RenderError::EmptyDocument);
    }
    let status = parse_status_meta(&doc.html)
        .or_else(|| doc.status_code.filter(|code| is_valid_status(*code)));
    Ok((doc.html, status, strategy))
}
