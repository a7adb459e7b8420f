//! SWR cache for rendered documents
//!
//! - [`store`]: the stale-while-revalidate store
//! - [`key`]: cache key derivation from request URLs
//! - [`revalidation`]: single-flight tracking of renders per key

pub mod key;
pub mod revalidation;
pub mod store;

pub use key::derive_key;
pub use revalidation::{RevalidationGuard, RevalidationTracker};
pub use store::{
    CacheConfig, CacheEntry, CacheLookup, CacheStats, SwrCache, DEFAULT_MAX_CONTENT_BYTES,
    DEFAULT_MAX_ENTRIES, DEFAULT_TTL_SECS, STALE_RATIO,
};
