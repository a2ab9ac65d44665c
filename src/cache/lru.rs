//! Bounded LRU cache with TTL expiry and an approximate memory budget
//!
//! Entries live in a slab of nodes threaded into a doubly-linked recency
//! list (head = most recently used). A hash map points keys at slab slots,
//! so lookup, promotion, and tail eviction are all O(1).
//!
//! Expiry is lazy on access; [`LruCache::cleanup_expired`] sweeps the rest
//! when the caller schedules it. Memory figures come from
//! [`EstimateSize`] and are approximations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::size::EstimateSize;
use crate::config::CacheConfig;
use crate::metrics::Metrics;

struct Node<V> {
    key: String,
    value: V,
    /// `None` when the TTL reaches past the clock's range
    expires_at: Option<Instant>,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<V> Node<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

struct LruInner<V> {
    map: HashMap<String, usize>,
    slots: Vec<Option<Node<V>>>,
    free: Vec<usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    memory: usize,
}

impl<V> LruInner<V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            memory: 0,
        }
    }

    fn node(&self, idx: usize) -> Option<&Node<V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert(&mut self, node: Node<V>) -> usize {
        self.memory = self.memory.saturating_add(node.size);
        let key = node.key.clone();
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        };
        self.push_front(idx);
        self.map.insert(key, idx);
        idx
    }

    fn remove_at(&mut self, idx: usize) -> Option<Node<V>> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.map.remove(&node.key);
        self.memory = self.memory.saturating_sub(node.size);
        Some(node)
    }

    fn pop_lru(&mut self) -> Option<Node<V>> {
        let tail = self.tail?;
        self.remove_at(tail)
    }

    fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.memory = 0;
    }
}

/// Thread-safe LRU cache keyed by caller-chosen strings
pub struct LruCache<V> {
    inner: RwLock<LruInner<V>>,
    capacity: usize,
    max_memory: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    capacity_evictions: AtomicU64,
    memory_evictions: AtomicU64,
    expirations: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl<V> LruCache<V>
where
    V: Clone + EstimateSize,
{
    /// Create a cache
    ///
    /// `capacity` is clamped to at least 1; `max_memory` of 0 disables the
    /// memory budget.
    #[must_use]
    pub fn new(capacity: usize, max_memory: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(LruInner::new()),
            capacity: capacity.max(1),
            max_memory,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            capacity_evictions: AtomicU64::new(0),
            memory_evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Create from config
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.max_memory_bytes, config.ttl)
    }

    /// Report hits and misses to shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Look up `key`, promoting it to most recently used
    ///
    /// Expired entries are removed and reported as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.write();

        let found = inner.map.get(key).copied();
        let Some(idx) = found else {
            drop(inner);
            self.record_miss();
            return None;
        };

        if inner.node(idx).is_some_and(|n| n.is_expired(now)) {
            inner.remove_at(idx);
            drop(inner);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            trace!(key, "Expired entry removed on access");
            self.record_miss();
            return None;
        }

        inner.promote(idx);
        let value = inner.node(idx).map(|n| n.value.clone());
        drop(inner);

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_hit();
            }
        } else {
            self.record_miss();
        }
        value
    }

    /// Look up `key` without promoting it or touching counters
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let inner = self.inner.read();
        let idx = *inner.map.get(key)?;
        inner
            .node(idx)
            .filter(|n| !n.is_expired(now))
            .map(|n| n.value.clone())
    }

    /// Whether a live entry exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .map
            .get(key)
            .and_then(|&idx| inner.node(idx))
            .is_some_and(|n| !n.is_expired(now))
    }

    /// Insert or refresh `key` with the default TTL
    pub fn set(&self, key: &str, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    /// Insert or refresh `key` with an explicit TTL
    ///
    /// After insertion the cache evicts from the LRU end until both the entry
    /// limit and (if set) the memory budget hold. An entry larger than the
    /// whole budget is itself evicted.
    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        let size = key.len().saturating_add(value.estimated_size());
        let expires_at = Instant::now().checked_add(ttl);
        let mut capacity_evicted = 0u64;
        let mut memory_evicted = 0u64;

        {
            let mut inner = self.inner.write();

            let existing = inner.map.get(key).copied();
            if let Some(idx) = existing {
                let old_size = inner.node(idx).map_or(0, |n| n.size);
                if let Some(node) = inner.node_mut(idx) {
                    node.value = value;
                    node.expires_at = expires_at;
                    node.size = size;
                }
                inner.memory = inner.memory.saturating_sub(old_size).saturating_add(size);
                inner.promote(idx);
            } else {
                inner.insert(Node {
                    key: key.to_string(),
                    value,
                    expires_at,
                    size,
                    prev: None,
                    next: None,
                });
            }

            while inner.map.len() > self.capacity {
                match inner.pop_lru() {
                    Some(evicted) => {
                        trace!(key = %evicted.key, "Evicted least recently used entry (capacity)");
                        capacity_evicted += 1;
                    }
                    None => break,
                }
            }

            if self.max_memory > 0 {
                while inner.memory > self.max_memory {
                    match inner.pop_lru() {
                        Some(evicted) => {
                            trace!(key = %evicted.key, size = evicted.size, "Evicted least recently used entry (memory)");
                            memory_evicted += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        self.sets.fetch_add(1, Ordering::Relaxed);
        if capacity_evicted > 0 {
            self.capacity_evictions.fetch_add(capacity_evicted, Ordering::Relaxed);
        }
        if memory_evicted > 0 {
            self.memory_evictions.fetch_add(memory_evicted, Ordering::Relaxed);
            debug!(
                evicted = memory_evicted,
                budget = self.max_memory,
                "Memory budget exceeded, evicted entries"
            );
        }
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.map.get(key).copied() {
            Some(idx) => inner.remove_at(idx).is_some(),
            None => false,
        }
    }

    /// Remove every expired entry; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();

        let expired: Vec<usize> = inner
            .map
            .values()
            .copied()
            .filter(|&idx| inner.node(idx).is_some_and(|n| n.is_expired(now)))
            .collect();
        for &idx in &expired {
            inner.remove_at(idx);
        }
        drop(inner);

        let count = expired.len();
        if count > 0 {
            self.expirations.fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "Expired cache entries swept");
        }
        count
    }

    /// Drop all entries (counters are kept)
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Number of entries, expired-but-unswept ones included
    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut keys = Vec::with_capacity(inner.map.len());
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            let Some(node) = inner.node(idx) else { break };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    /// Statistics snapshot
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let (entries, memory_bytes) = {
            let inner = self.inner.read();
            (inner.map.len(), inner.memory)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            capacity_evictions: self.capacity_evictions.load(Ordering::Relaxed),
            memory_evictions: self.memory_evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries,
            capacity: self.capacity,
            memory_bytes,
            max_memory_bytes: self.max_memory,
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_miss();
        }
    }
}

/// Run [`LruCache::cleanup_expired`] every `interval` until `token` fires
pub fn spawn_cleanup<V>(
    cache: Arc<LruCache<V>>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    cache.cleanup_expired();
                }
            }
        }
        debug!("Cache cleanup task stopped");
    })
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Insertions and refreshes
    pub sets: u64,
    /// Entries evicted to respect the entry limit
    pub capacity_evictions: u64,
    /// Entries evicted to respect the memory budget
    pub memory_evictions: u64,
    /// Entries removed because their TTL passed
    pub expirations: u64,
    /// hits / lookups (0.0-1.0)
    pub hit_ratio: f64,
    /// Current entries
    pub entries: usize,
    /// Maximum entries
    pub capacity: usize,
    /// Current estimated memory
    pub memory_bytes: usize,
    /// Memory budget (0 = unbounded)
    pub max_memory_bytes: usize,
}
