//! In-memory caching: a bounded LRU with TTL and memory budget, and a typed
//! response cache built on it

mod lru;
mod response;
pub mod size;

pub use lru::{CacheStats, LruCache, spawn_cleanup};
pub use response::ResponseCache;
pub use size::EstimateSize;
