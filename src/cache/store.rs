//! Stale-while-revalidate HTML store
//!
//! Entries are fresh for the first 80% of their TTL, stale for the remaining
//! 20%, and hard-expired afterwards. Stale entries are still served while the
//! orchestrator refreshes them in the background; hard-expired entries are
//! misses and are removed lazily on read and by the cleanup sweep.
//!
//! ```text
//!   stored_at                 0.8·ttl            ttl
//!       │────────── fresh ───────│──── stale ─────│──── expired ────▶
//!                                 serve + refresh   miss, removed
//! ```
//!
//! Entries are kept in least-recently-used order. Inserting a new key at the
//! entry cap drops from the cold end, so eviction never scans the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::revalidation::{RevalidationGuard, RevalidationTracker};

/// Maximum size of a cached document (10 MB)
pub const DEFAULT_MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;

/// Default entry-count cap
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default TTL for rendered documents (1 hour)
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Fraction of the TTL after which an entry is considered stale
pub const STALE_RATIO: f64 = 0.8;

// ============================================================================
// Configuration
// ============================================================================

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied by the orchestrator on write-through
    pub default_ttl: Duration,
    /// Maximum number of entries before eviction kicks in
    pub max_entries: usize,
    /// Maximum accepted document size in bytes
    pub max_content_bytes: usize,
    /// Interval between expiry sweeps
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Set the default TTL
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the entry-count cap
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the document size cap
    pub fn with_max_content_bytes(mut self, bytes: usize) -> Self {
        self.max_content_bytes = bytes;
        self
    }

    /// Set the cleanup interval
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

// ============================================================================
// Entries
// ============================================================================

/// A stored document
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Rendered HTML
    pub content: String,
    /// HTTP status the document is served with
    pub status_code: u16,
    /// Wall-clock render time
    pub rendered_at: DateTime<Utc>,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(key: String, content: String, status_code: u16, ttl: Duration) -> Self {
        Self {
            key,
            content,
            status_code,
            rendered_at: Utc::now(),
            stored_at: Instant::now(),
            ttl,
        }
    }

    /// Time since the entry was stored
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// TTL the entry was stored with
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Past its TTL
    pub fn is_expired(&self) -> bool {
        self.age() > self.ttl
    }

    /// Past 80% of its TTL
    pub fn is_stale(&self) -> bool {
        self.age() > self.ttl.mul_f64(STALE_RATIO)
    }

    /// Time left before hard expiry
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.age())
    }
}

/// Result of [`SwrCache::get_with_ttl`]
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    /// Cached HTML
    pub value: String,
    /// Status to serve the document with
    pub status_code: u16,
    /// Time left before hard expiry
    pub remaining_ttl: Duration,
    /// Whether the entry should be refreshed in the background
    pub is_stale: bool,
    /// Wall-clock render time
    pub rendered_at: DateTime<Utc>,
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of entries
    pub entries: usize,
    /// Fresh hits
    pub hits: u64,
    /// Stale hits
    pub stale_hits: u64,
    /// Misses (including hard-expired reads)
    pub misses: u64,
    /// Accepted writes
    pub sets: u64,
    /// Refused writes
    pub rejections: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Entries removed for hard expiry
    pub expirations: u64,
    /// Stale hits collapsed onto an in-flight revalidation
    pub collapsed_revalidations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    rejections: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

// ============================================================================
// Store
// ============================================================================

type Entries = LruCache<String, CacheEntry>;

/// In-memory stale-while-revalidate cache
#[derive(Debug)]
pub struct SwrCache {
    entries: Mutex<Entries>,
    config: CacheConfig,
    counters: Counters,
    revalidation: RevalidationTracker,
}

impl Default for SwrCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl SwrCache {
    /// Create a cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            config,
            counters: Counters::default(),
            revalidation: RevalidationTracker::new(),
        }
    }

    /// Configuration (immutable)
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // Never held across an await
    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a document with status 200
    pub async fn set(&self, key: &str, value: impl Into<String>, ttl_secs: u64) -> bool {
        self.set_with_status(key, value, 200, ttl_secs).await
    }

    /// Store a document with an explicit status
    ///
    /// Returns `false` and leaves the store unchanged when the key or value
    /// is empty, the value exceeds the size cap, the TTL is zero, the status
    /// is outside `100..=599`, or the cap is zero.
    pub async fn set_with_status(
        &self,
        key: &str,
        value: impl Into<String>,
        status_code: u16,
        ttl_secs: u64,
    ) -> bool {
        let value = value.into();

        if let Some(reason) = self.rejection_reason(key, &value, status_code, ttl_secs) {
            bump(&self.counters.rejections, 1);
            metrics::counter!("rendergate_cache_rejections_total", "reason" => reason)
                .increment(1);
            debug!(key, reason, bytes = value.len(), "Cache write rejected");
            return false;
        }

        let entry = CacheEntry::new(
            key.to_string(),
            value,
            status_code,
            Duration::from_secs(ttl_secs),
        );

        let mut entries = self.entries();
        if !entries.contains(key) {
            self.make_room(&mut entries);
        }
        entries.put(key.to_string(), entry);
        bump(&self.counters.sets, 1);
        true
    }

    fn rejection_reason(
        &self,
        key: &str,
        value: &str,
        status_code: u16,
        ttl_secs: u64,
    ) -> Option<&'static str> {
        if key.is_empty() {
            Some("empty_key")
        } else if value.is_empty() {
            Some("empty_value")
        } else if value.len() > self.config.max_content_bytes {
            Some("oversized")
        } else if ttl_secs == 0 {
            Some("zero_ttl")
        } else if !(100..=599).contains(&status_code) {
            Some("invalid_status")
        } else if self.config.max_entries == 0 {
            Some("no_capacity")
        } else {
            None
        }
    }

    /// Drop from the cold end until a new key fits
    ///
    /// Expired entries at the cold end count as expirations; anything else
    /// removed is an eviction.
    fn make_room(&self, entries: &mut Entries) {
        while entries.len() >= self.config.max_entries {
            let Some((key, entry)) = entries.pop_lru() else {
                break;
            };
            if entry.is_expired() {
                bump(&self.counters.expirations, 1);
            } else {
                bump(&self.counters.evictions, 1);
                metrics::counter!("rendergate_cache_evictions_total").increment(1);
                debug!(key = %key, "Evicted least recently used cache entry");
            }
        }
    }

    fn purge_expired(entries: &mut Entries) -> usize {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Fetch a live document
    pub async fn get(&self, key: &str) -> Option<String> {
        self.get_with_ttl(key).await.map(|lookup| lookup.value)
    }

    /// Fetch a live document with its freshness metadata
    pub async fn get_with_ttl(&self, key: &str) -> Option<CacheLookup> {
        let mut entries = self.entries();

        let expired = match entries.get(key) {
            None => {
                bump(&self.counters.misses, 1);
                return None;
            }
            Some(entry) if !entry.is_expired() => {
                let is_stale = entry.is_stale();
                if is_stale {
                    bump(&self.counters.stale_hits, 1);
                } else {
                    bump(&self.counters.hits, 1);
                }
                return Some(CacheLookup {
                    value: entry.content.clone(),
                    status_code: entry.status_code,
                    remaining_ttl: entry.remaining_ttl(),
                    is_stale,
                    rendered_at: entry.rendered_at,
                });
            }
            Some(_) => true,
        };

        if expired {
            entries.pop(key);
            bump(&self.counters.expirations, 1);
        }
        bump(&self.counters.misses, 1);
        None
    }

    /// Remove a document
    pub async fn delete(&self, key: &str) -> bool {
        self.entries().pop(key).is_some()
    }

    /// Remove every document
    pub async fn flush(&self) {
        let mut entries = self.entries();
        let count = entries.len();
        entries.clear();
        info!(count, "Cache flushed");
    }

    /// Number of stored entries (expired ones included until swept)
    pub async fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Remove hard-expired entries, returning how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let removed = Self::purge_expired(&mut self.entries());
        if removed > 0 {
            bump(&self.counters.expirations, removed as u64);
            info!(removed, "Cleaned up expired cache entries");
        }
        removed
    }

    /// Start the periodic expiry sweep
    ///
    /// Call once at startup. The returned handle can be aborted on shutdown.
    pub fn start_cleanup_task(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            info!("Starting cache cleanup task (interval: {:?})", interval);

            loop {
                tokio::time::sleep(interval).await;
                self.cleanup_expired().await;
            }
        })
    }

    /// Claim the single background refresh for `key`
    pub fn try_begin_revalidation(&self, key: &str) -> Option<RevalidationGuard> {
        let guard = self.revalidation.try_begin(key);
        if guard.is_none() {
            metrics::counter!("rendergate_cache_collapsed_revalidations_total").increment(1);
        }
        guard
    }

    /// Wait for the in-flight render of `key`, if any, to finish
    pub async fn wait_for_render(&self, key: &str) {
        self.revalidation.wait(key).await;
    }

    /// Revalidation tracker
    pub fn revalidation(&self) -> &RevalidationTracker {
        &self.revalidation
    }

    /// Current statistics
    pub async fn stats(&self) -> CacheStats {
        let entries = self.len().await;
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        CacheStats {
            entries,
            hits: load(&self.counters.hits),
            stale_hits: load(&self.counters.stale_hits),
            misses: load(&self.counters.misses),
            sets: load(&self.counters.sets),
            rejections: load(&self.counters.rejections),
            evictions: load(&self.counters.evictions),
            expirations: load(&self.counters.expirations),
            collapsed_revalidations: self.revalidation.collapsed_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(max_entries: usize) -> SwrCache {
        SwrCache::new(CacheConfig::default().with_max_entries(max_entries))
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = SwrCache::default();
        assert!(cache.set("k", "<html>a</html>", 60).await);
        assert_eq!(cache.get("k").await.as_deref(), Some("<html>a</html>"));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_writes_are_rejected() {
        let cache = SwrCache::new(CacheConfig::default().with_max_content_bytes(8));

        assert!(!cache.set("", "v", 60).await);
        assert!(!cache.set("k", "", 60).await);
        assert!(!cache.set("k", "way too long", 60).await);
        assert!(!cache.set("k", "v", 0).await);
        assert!(!cache.set_with_status("k", "v", 42, 60).await);

        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().await.rejections, 5);
    }

    #[tokio::test]
    async fn test_zero_capacity_rejects_everything() {
        let cache = small_cache(0);
        assert!(!cache.set("k", "v", 60).await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_oversized_write_keeps_previous_value() {
        let cache = SwrCache::new(CacheConfig::default().with_max_content_bytes(4));
        assert!(cache.set("k", "old", 60).await);
        assert!(!cache.set("k", "too big", 60).await);
        assert_eq!(cache.get("k").await.as_deref(), Some("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshness_windows() {
        let cache = SwrCache::default();
        cache.set("k", "v", 10).await;

        let lookup = cache.get_with_ttl("k").await.unwrap();
        assert!(!lookup.is_stale);
        assert_eq!(lookup.status_code, 200);

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!cache.get_with_ttl("k").await.unwrap().is_stale);

        tokio::time::advance(Duration::from_secs(2)).await;
        let lookup = cache.get_with_ttl("k").await.unwrap();
        assert!(lookup.is_stale);
        assert!(lookup.remaining_ttl <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get_with_ttl("k").await.is_none());
        assert_eq!(cache.len().await, 0);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.stale_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_purges_expired_first() {
        let cache = small_cache(2);
        cache.set("short", "v", 1).await;
        cache.set("long", "v", 100).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.set("new", "v", 100).await);

        assert!(cache.get("long").await.is_some());
        assert!(cache.get("new").await.is_some());
        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_drops_oldest() {
        let cache = small_cache(2);
        cache.set("a", "v", 100).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", "v", 100).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("c", "v", 100).await;

        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_reads_protect_entries_from_eviction() {
        let cache = small_cache(2);
        cache.set("a", "v", 100).await;
        cache.set("b", "v", 100).await;
        assert!(cache.get("a").await.is_some());

        cache.set("c", "v", 100).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_overwrite_at_cap_does_not_evict() {
        let cache = small_cache(1);
        cache.set("a", "v1", 100).await;
        assert!(cache.set("a", "v2", 100).await);
        assert_eq!(cache.get("a").await.as_deref(), Some("v2"));
        assert_eq!(cache.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_delete_and_flush() {
        let cache = SwrCache::default();
        cache.set("a", "v", 60).await;
        cache.set("b", "v", 60).await;

        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);

        cache.flush().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_sweeps_expired() {
        let cache = Arc::new(SwrCache::new(
            CacheConfig::default().with_cleanup_interval(Duration::from_secs(5)),
        ));
        cache.set("k", "v", 1).await;

        let handle = Arc::clone(&cache).start_cleanup_task();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(cache.len().await, 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_revalidation_is_single_flight() {
        let cache = SwrCache::default();
        let guard = cache.try_begin_revalidation("k");
        assert!(guard.is_some());
        assert!(cache.try_begin_revalidation("k").is_none());
        assert_eq!(cache.stats().await.collapsed_revalidations, 1);
        drop(guard);
        assert!(cache.try_begin_revalidation("k").is_some());
    }
}
