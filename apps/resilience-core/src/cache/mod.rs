//! Hybrid caching for provider responses.
//!
//! A bounded in-memory tier for hot keys in front of a durable key/value
//! tier that survives restarts. Option chains, quotes, and earnings
//! calendars are expensive to re-fetch and cheap to keep.

pub mod hybrid;
pub mod memory;

pub use hybrid::{CacheConfig, CacheError, CacheStats, HybridCache};
pub use memory::MemoryCache;
