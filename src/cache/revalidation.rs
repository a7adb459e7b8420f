//! Single-flight render tracking
//!
//! At most one render per key runs at a time, whether it was started by a
//! cache miss or by a background refresh of a stale entry. The first caller
//! gets a [`RevalidationGuard`]; everyone else is collapsed onto the
//! in-flight render until the guard is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

type InflightMap = Arc<DashMap<String, Arc<Notify>>>;

/// Tracks keys with a render in flight
#[derive(Debug, Default)]
pub struct RevalidationTracker {
    inflight: InflightMap,
    collapsed: AtomicU64,
}

impl RevalidationTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the render for `key`
    ///
    /// Returns `None` when another render for the key is already running.
    pub fn try_begin(&self, key: &str) -> Option<RevalidationGuard> {
        match self.inflight.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Notify::new()));
                Some(RevalidationGuard {
                    key: key.to_string(),
                    inflight: Arc::clone(&self.inflight),
                })
            }
            Entry::Occupied(_) => {
                self.collapsed.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Render already in flight, collapsing");
                None
            }
        }
    }

    /// Wait until no render for `key` is in flight
    ///
    /// Returns immediately when the key is free. A new holder that claims
    /// the key after the awaited one released it is not waited for.
    pub async fn wait(&self, key: &str) {
        // The map ref is dropped before awaiting
        let notify = match self.inflight.get(key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return,
        };

        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        // The guard removes its entry before notifying, so if the entry is
        // gone (or replaced) the wakeup has already happened.
        let still_held = self
            .inflight
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), &notify));
        if still_held {
            notified.await;
        }
    }

    /// Whether a render for `key` is running
    pub fn is_revalidating(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Number of renders in flight
    pub fn active(&self) -> usize {
        self.inflight.len()
    }

    /// Number of attempts collapsed onto an in-flight render
    pub fn collapsed_count(&self) -> u64 {
        self.collapsed.load(Ordering::Relaxed)
    }
}

/// Ownership of an in-flight render; releases the key when dropped
#[derive(Debug)]
pub struct RevalidationGuard {
    key: String,
    inflight: InflightMap,
}

impl RevalidationGuard {
    /// The key being rendered
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        if let Some((_, notify)) = self.inflight.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}
