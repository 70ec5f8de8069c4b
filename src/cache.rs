//! Distributed cache in front of the graph store and consensus network
//!
//! Holds no authoritative state: every entry is reconstructible from the
//! stores behind it, so cache failures are never fatal. A failed or
//! corrupt read counts as a miss and the caller falls back to the
//! authoritative store.
//!
//! Values are serialized bytes; values above a size threshold are
//! compressed (lz4) and flagged, and transparently decompressed on read.
//! Invalidations travel over the shared event bus: every cache process
//! subscribes and evicts matching keys locally, giving eventual
//! cross-process coherence bounded by channel propagation.

use crate::config::Config;
use crate::events::{EventBus, SystemEvent};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Cache key namespaces, one per data kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyspace {
    Query,
    Node,
    Embedding,
    Session,
    Consensus,
}

impl Keyspace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Keyspace::Query => "query",
            Keyspace::Node => "node",
            Keyspace::Embedding => "embedding",
            Keyspace::Session => "session",
            Keyspace::Consensus => "consensus",
        }
    }

    /// Build a namespaced key
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix(), suffix)
    }
}

struct CacheEntry {
    payload: Vec<u8>,
    compressed: bool,
    expires_at: Instant,
    /// Monotonic touch sequence driving LRU eviction
    touched: u64,
}

impl CacheEntry {
    fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Point-in-time statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Write-through/read-aside cache process
pub struct CacheCluster {
    entries: DashMap<String, CacheEntry>,
    used_bytes: AtomicU64,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    capacity_bytes: u64,
    compression_threshold: usize,
    default_ttl: Duration,
    high_memory_fraction: f64,
    events: EventBus,
}

impl CacheCluster {
    pub fn new(config: &Config, events: EventBus) -> Self {
        Self {
            entries: DashMap::new(),
            used_bytes: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            capacity_bytes: config.cache_capacity_bytes,
            compression_threshold: config.cache_compression_threshold,
            default_ttl: Duration::from_secs(config.cache_ttl_secs),
            high_memory_fraction: config.cache_high_memory_fraction,
            events,
        }
    }

    /// Store serialized bytes under a key
    pub fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) {
        let compressed = value.len() > self.compression_threshold;
        let payload = if compressed {
            lz4_flex::compress_prepend_size(value)
        } else {
            value.to_vec()
        };

        let entry = CacheEntry {
            payload,
            compressed,
            expires_at: Instant::now() + ttl.unwrap_or(self.default_ttl),
            touched: self.sequence.fetch_add(1, Ordering::Relaxed),
        };

        let added = entry.size();
        if let Some(previous) = self.entries.insert(key.to_string(), entry) {
            self.used_bytes
                .fetch_sub(previous.size(), Ordering::Relaxed);
        }
        let used = self.used_bytes.fetch_add(added, Ordering::Relaxed) + added;

        if used > self.capacity_bytes {
            self.evict_lru(used);
        } else if used as f64 > self.capacity_bytes as f64 * self.high_memory_fraction {
            self.events.publish(SystemEvent::HighMemoryUsage {
                used_bytes: used,
                capacity_bytes: self.capacity_bytes,
            });
        }
    }

    /// Serialize a value as JSON and store it
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, &bytes, ttl),
            // Cache errors are never fatal; skip the write
            Err(e) => warn!(key, error = %e, "Cache serialization failed, skipping"),
        }
    }

    /// Fetch bytes by key. Expired, missing, or undecodable entries all
    /// report a miss.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let result = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.expires_at <= Instant::now() {
                    drop(entry);
                    self.remove_entry(key);
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                    None
                } else {
                    entry.touched = self.sequence.fetch_add(1, Ordering::Relaxed);
                    let payload = entry.payload.clone();
                    let compressed = entry.compressed;
                    drop(entry);
                    if compressed {
                        match lz4_flex::decompress_size_prepended(&payload) {
                            Ok(value) => Some(value),
                            Err(e) => {
                                // Corrupt entry: degrade to a miss
                                warn!(key, error = %e, "Cache decompression failed, evicting");
                                self.remove_entry(key);
                                None
                            }
                        }
                    } else {
                        Some(payload)
                    }
                }
            }
            None => None,
        };

        match &result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Fetch and deserialize a JSON value
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Cache deserialization failed, evicting");
                self.remove_entry(key);
                None
            }
        }
    }

    /// Fetch several keys at once
    pub fn batch_get(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Store several entries at once
    pub fn batch_set(&self, pairs: &[(String, Vec<u8>)], ttl: Option<Duration>) {
        for (key, value) in pairs {
            self.set(key, value, ttl);
        }
    }

    /// Evict a key locally and broadcast the invalidation to every other
    /// cache process on the bus
    pub fn invalidate(&self, key: &str) {
        self.remove_entry(key);
        self.events.publish(SystemEvent::InvalidateKey {
            key: key.to_string(),
        });
    }

    /// Evict all keys matching a pattern (exact, or prefix with a `*`
    /// suffix) and broadcast the invalidation
    pub fn invalidate_by_pattern(&self, pattern: &str) {
        self.evict_pattern(pattern);
        self.events.publish(SystemEvent::InvalidatePattern {
            pattern: pattern.to_string(),
        });
    }

    /// Subscribe to the event bus and evict on invalidation events from
    /// other processes
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let cache = Arc::clone(self);
        let mut events = cache.events.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SystemEvent::InvalidateKey { key }) => cache.remove_entry(&key),
                        Ok(SystemEvent::InvalidatePattern { pattern }) => {
                            cache.evict_pattern(&pattern)
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed invalidations: drop everything rather
                            // than serve stale entries
                            warn!(skipped, "Invalidation listener lagged, clearing cache");
                            cache.clear();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Sample statistics periodically and raise high-memory events
    pub fn spawn_stats_sampler(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = cache.stats();
                        info!(
                            entries = stats.entry_count,
                            used_bytes = stats.used_bytes,
                            hit_rate = format!("{:.2}", stats.hit_rate()),
                            "Cache statistics sample"
                        );
                        if stats.used_bytes as f64
                            > stats.capacity_bytes as f64 * cache.high_memory_fraction
                        {
                            cache.events.publish(SystemEvent::HighMemoryUsage {
                                used_bytes: stats.used_bytes,
                                capacity_bytes: stats.capacity_bytes,
                            });
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.entries.len(),
            used_bytes: self.used_bytes.load(Ordering::Relaxed),
            capacity_bytes: self.capacity_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
        self.used_bytes.store(0, Ordering::Relaxed);
    }

    fn remove_entry(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.used_bytes.fetch_sub(entry.size(), Ordering::Relaxed);
            debug!(key, "Evicted cache entry");
        }
    }

    fn evict_pattern(&self, pattern: &str) {
        let removed_bytes = AtomicU64::new(0);
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.entries.retain(|key, entry| {
                let keep = !key.starts_with(prefix);
                if !keep {
                    removed_bytes.fetch_add(entry.size(), Ordering::Relaxed);
                }
                keep
            });
            self.used_bytes
                .fetch_sub(removed_bytes.load(Ordering::Relaxed), Ordering::Relaxed);
        } else {
            self.remove_entry(pattern);
        }
    }

    /// Evict least-recently-touched entries until usage fits capacity
    fn evict_lru(&self, mut used: u64) {
        while used > self.capacity_bytes {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().touched)
                .map(|entry| entry.key().clone());
            let Some(key) = victim else { break };
            if let Some((_, entry)) = self.entries.remove(&key) {
                used = self
                    .used_bytes
                    .fetch_sub(entry.size(), Ordering::Relaxed)
                    .saturating_sub(entry.size());
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "LRU-evicted cache entry");
            }
        }
    }
}
