//! In-process artwork URL cache.
//!
//! Bounded, TTL'd mapping from `(entity, size)` to a resolved URL or path.
//! Recency is tracked with a monotonically increasing tick per touch, giving
//! O(log n) LRU eviction through an ordered index.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::artwork::{EntityId, SizeVariant};
use crate::clock::SharedClock;

/// Rough per-entry bookkeeping overhead added to the byte estimate.
const ENTRY_OVERHEAD_BYTES: usize = 64;
const TOP_ACCESSED_LIMIT: usize = 10;

/// Capacity and lifetime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheConfig {
    /// Zero disables caching altogether.
    pub max_entries: usize,
    /// Entries older than this are treated as absent.
    pub ttl: Duration,
    /// Minimum spacing between full expiry sweeps triggered by `set`.
    pub sweep_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    value: String,
    inserted_at: DateTime<Utc>,
    metadata: Option<serde_json::Value>,
    tick: u64,
    size_bytes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    total_requests: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, MemoryRecord>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    access_counts: HashMap<String, u64>,
    bytes_cached: usize,
    counters: Counters,
    last_sweep: DateTime<Utc>,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(record) = self.entries.get_mut(key) {
            self.recency.remove(&record.tick);
            record.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    /// Unlinks a record but keeps its access count, for in-place overwrites.
    fn detach(&mut self, key: &str) -> Option<MemoryRecord> {
        let record = self.entries.remove(key)?;
        self.recency.remove(&record.tick);
        self.bytes_cached = self.bytes_cached.saturating_sub(record.size_bytes);
        Some(record)
    }

    fn remove(&mut self, key: &str) -> Option<MemoryRecord> {
        let record = self.detach(key)?;
        self.access_counts.remove(key);
        Some(record)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let key = self.recency.first_key_value()?.1.clone();
        self.remove(&key);
        Some(key)
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, record)| now - record.inserted_at > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.counters.expirations += expired.len() as u64;
        self.last_sweep = now;
        expired.len()
    }
}

/// Lookup counters.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    /// Lookups answered from memory.
    pub hits: u64,
    /// Lookups that found nothing, including expired entries.
    pub misses: u64,
    /// Percentage in `0.0..=100.0`
    pub hit_rate: f64,
    /// All lookups since startup.
    pub total_requests: u64,
    /// Lookups per minute of uptime.
    pub avg_requests_per_minute: f64,
}

/// Occupancy and churn.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityStats {
    /// Live entries.
    pub current_entries: usize,
    /// Configured capacity.
    pub max_entries: usize,
    /// Percentage in `0.0..=100.0`
    pub utilization: f64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped for age.
    pub expirations: u64,
}

/// Approximate size of the cached strings.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryFootprint {
    /// Bytes held by keys and values.
    pub bytes_total: usize,
    /// The same in megabytes.
    pub mb_total: f64,
}

/// Hit count for one key.
#[derive(Debug, Clone, Serialize)]
pub struct AccessCount {
    /// Cache key.
    pub key: String,
    /// Hits recorded while the key stayed cached.
    pub count: u64,
}

/// Settings as exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryCacheConfigView {
    /// Configured capacity.
    pub max_entries: usize,
    /// Entry lifetime in seconds.
    pub ttl_seconds: u64,
    /// Seconds since the cache was built.
    pub uptime_seconds: i64,
}

/// Full statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryCacheStats {
    /// Lookup counters.
    pub performance: PerformanceStats,
    /// Occupancy and churn.
    pub capacity: CapacityStats,
    /// Footprint.
    pub memory: MemoryFootprint,
    /// Most hit live keys, busiest first.
    pub top_accessed: Vec<AccessCount>,
    /// Effective settings.
    pub config: MemoryCacheConfigView,
}

/// Bounded LRU + TTL cache of resolved artwork URLs.
///
/// Disposable: losing its contents only costs speed, never data.
pub struct ArtworkMemoryCache {
    config: MemoryCacheConfig,
    clock: SharedClock,
    started_at: DateTime<Utc>,
    state: Mutex<CacheState>,
}

impl fmt::Debug for ArtworkMemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .state
            .try_lock()
            .map(|guard| guard.entries.len())
            .unwrap_or(0);

        f.debug_struct("ArtworkMemoryCache")
            .field("config", &self.config)
            .field("entries", &entries)
            .finish_non_exhaustive()
    }
}

impl ArtworkMemoryCache {
    /// Builds an empty cache.
    pub fn new(config: MemoryCacheConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            started_at: now,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                access_counts: HashMap::new(),
                bytes_cached: 0,
                counters: Counters::default(),
                last_sweep: now,
            }),
        }
    }

    /// Key under which a variant URL is stored.
    pub fn cache_key(entity_id: EntityId, size: SizeVariant) -> String {
        format!("album_{entity_id}_{size}")
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.ttl)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Returns the cached URL, dropping it first if it has expired.
    pub fn get(&self, entity_id: EntityId, size: SizeVariant) -> Option<String> {
        let key = Self::cache_key(entity_id, size);
        let now = self.clock.now();
        let ttl = self.ttl();

        let mut state = self.state.lock();
        state.counters.total_requests += 1;

        let inserted_at = match state.entries.get(&key) {
            Some(record) => record.inserted_at,
            None => {
                state.counters.misses += 1;
                return None;
            }
        };

        if now - inserted_at > ttl {
            state.remove(&key);
            state.counters.expirations += 1;
            state.counters.misses += 1;
            debug!(key = %key, "memory cache entry expired");
            return None;
        }

        state.touch(&key);
        state.counters.hits += 1;
        *state.access_counts.entry(key.clone()).or_insert(0) += 1;
        state.entries.get(&key).map(|record| record.value.clone())
    }

    /// Stores a URL, evicting the least recently used entry when full.
    pub fn set(
        &self,
        entity_id: EntityId,
        size: SizeVariant,
        value: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) {
        if self.config.max_entries == 0 {
            return;
        }

        let key = Self::cache_key(entity_id, size);
        let value = value.into();
        let now = self.clock.now();
        let metadata_bytes = metadata
            .as_ref()
            .map(|meta| meta.to_string().len())
            .unwrap_or(0);
        let size_bytes =
            key.len() + value.len() + metadata_bytes + ENTRY_OVERHEAD_BYTES;

        let mut state = self.state.lock();
        if state.detach(&key).is_none()
            && state.entries.len() >= self.config.max_entries
            && let Some(evicted) = state.evict_lru()
        {
            state.counters.evictions += 1;
            debug!(key = %evicted, "memory cache evicted least recently used");
        }

        let tick = state.next_tick;
        state.next_tick += 1;
        state.recency.insert(tick, key.clone());
        state.bytes_cached += size_bytes;
        state.entries.insert(
            key,
            MemoryRecord {
                value,
                inserted_at: now,
                metadata,
                tick,
                size_bytes,
            },
        );

        let sweep_due = chrono::Duration::from_std(self.config.sweep_interval)
            .map(|interval| now - state.last_sweep > interval)
            .unwrap_or(false);
        if sweep_due {
            let removed = state.sweep_expired(now, self.ttl());
            if removed > 0 {
                debug!(removed, "memory cache sweep removed expired entries");
            }
        }
    }

    /// Metadata stored alongside a live entry. Does not count as an access.
    pub fn metadata(
        &self,
        entity_id: EntityId,
        size: SizeVariant,
    ) -> Option<serde_json::Value> {
        let key = Self::cache_key(entity_id, size);
        let state = self.state.lock();
        state.entries.get(&key).and_then(|record| record.metadata.clone())
    }

    /// Removes one variant, or every variant when `size` is `None`.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, entity_id: EntityId, size: Option<SizeVariant>) -> usize {
        let mut state = self.state.lock();
        let sizes: Vec<SizeVariant> = match size {
            Some(size) => vec![size],
            None => SizeVariant::ALL.to_vec(),
        };
        sizes
            .into_iter()
            .filter(|size| {
                state.remove(&Self::cache_key(entity_id, *size)).is_some()
            })
            .count()
    }

    /// Drops every entry and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.recency.clear();
        state.access_counts.clear();
        state.bytes_cached = 0;
        drop(state);
        info!(count, "cleared memory cache");
        count
    }

    /// Bulk-primes the cache, returning how many entries were written.
    pub fn warm<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (EntityId, SizeVariant, String)>,
    {
        let mut added = 0;
        for (entity_id, size, value) in entries {
            self.set(entity_id, size, value, None);
            added += 1;
        }
        added
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> MemoryCacheStats {
        let now = self.clock.now();
        let uptime = now - self.started_at;
        let state = self.state.lock();
        let counters = &state.counters;

        let hit_rate = if counters.total_requests > 0 {
            counters.hits as f64 / counters.total_requests as f64 * 100.0
        } else {
            0.0
        };
        let uptime_minutes = uptime.num_milliseconds() as f64 / 60_000.0;
        let avg_requests_per_minute = if uptime_minutes > 0.0 {
            counters.total_requests as f64 / uptime_minutes
        } else {
            0.0
        };
        let utilization = if self.config.max_entries > 0 {
            state.entries.len() as f64 / self.config.max_entries as f64 * 100.0
        } else {
            0.0
        };

        let mut top_accessed: Vec<AccessCount> = state
            .access_counts
            .iter()
            .map(|(key, count)| AccessCount {
                key: key.clone(),
                count: *count,
            })
            .collect();
        top_accessed.sort_by(|a, b| b.count.cmp(&a.count).then(a.key.cmp(&b.key)));
        top_accessed.truncate(TOP_ACCESSED_LIMIT);

        MemoryCacheStats {
            performance: PerformanceStats {
                hits: counters.hits,
                misses: counters.misses,
                hit_rate,
                total_requests: counters.total_requests,
                avg_requests_per_minute,
            },
            capacity: CapacityStats {
                current_entries: state.entries.len(),
                max_entries: self.config.max_entries,
                utilization,
                evictions: counters.evictions,
                expirations: counters.expirations,
            },
            memory: MemoryFootprint {
                bytes_total: state.bytes_cached,
                mb_total: state.bytes_cached as f64 / (1024.0 * 1024.0),
            },
            top_accessed,
            config: MemoryCacheConfigView {
                max_entries: self.config.max_entries,
                ttl_seconds: self.config.ttl.as_secs(),
                uptime_seconds: uptime.num_seconds(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn cache(max_entries: usize) -> (Arc<ManualClock>, ArtworkMemoryCache) {
        let clock = Arc::new(ManualClock::default());
        let cache = ArtworkMemoryCache::new(
            MemoryCacheConfig {
                max_entries,
                ttl: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(30),
            },
            clock.clone(),
        );
        (clock, cache)
    }

    #[test]
    fn evicts_least_recently_touched_entry() {
        let (_clock, cache) = cache(3);
        cache.set(1, SizeVariant::Medium, "/a", None);
        cache.set(2, SizeVariant::Medium, "/b", None);
        cache.set(3, SizeVariant::Medium, "/c", None);

        // Touch 1 so 2 becomes least recent.
        assert_eq!(cache.get(1, SizeVariant::Medium).as_deref(), Some("/a"));
        cache.set(4, SizeVariant::Medium, "/d", None);

        assert_eq!(cache.len(), 3);
        assert!(cache.get(2, SizeVariant::Medium).is_none());
        assert!(cache.get(1, SizeVariant::Medium).is_some());
        assert!(cache.get(3, SizeVariant::Medium).is_some());
        assert_eq!(cache.stats().capacity.evictions, 1);
    }

    #[test]
    fn never_exceeds_capacity() {
        let (_clock, cache) = cache(5);
        for id in 0..50 {
            cache.set(id, SizeVariant::Small, format!("/{id}"), None);
            if id % 3 == 0 {
                cache.get(id / 2, SizeVariant::Small);
            }
            assert!(cache.len() <= 5);
        }
    }

    #[test]
    fn overwriting_key_does_not_evict() {
        let (_clock, cache) = cache(2);
        cache.set(1, SizeVariant::Large, "/a", None);
        cache.set(2, SizeVariant::Large, "/b", None);
        cache.set(1, SizeVariant::Large, "/a2", None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().capacity.evictions, 0);
        assert_eq!(cache.get(1, SizeVariant::Large).as_deref(), Some("/a2"));
    }

    #[test]
    fn expired_entries_miss_even_when_accessed() {
        let (clock, cache) = cache(10);
        cache.set(7, SizeVariant::Thumbnail, "/t", None);
        clock.advance(chrono::Duration::seconds(40));
        assert!(cache.get(7, SizeVariant::Thumbnail).is_some());
        clock.advance(chrono::Duration::seconds(21));
        assert!(cache.get(7, SizeVariant::Thumbnail).is_none());

        let stats = cache.stats();
        assert_eq!(stats.capacity.expirations, 1);
        assert_eq!(stats.performance.hits, 1);
        assert_eq!(stats.performance.misses, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn set_sweeps_expired_entries_after_interval() {
        let (clock, cache) = cache(10);
        cache.set(1, SizeVariant::Medium, "/a", None);
        cache.set(2, SizeVariant::Medium, "/b", None);
        clock.advance(chrono::Duration::seconds(61));
        cache.set(3, SizeVariant::Medium, "/c", None);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().capacity.expirations, 2);
    }

    #[test]
    fn invalidate_without_size_removes_every_variant() {
        let (_clock, cache) = cache(20);
        for size in SizeVariant::ALL {
            cache.set(9, size, format!("/{size}"), None);
        }
        cache.set(10, SizeVariant::Medium, "/other", None);

        assert_eq!(cache.invalidate(9, Some(SizeVariant::Large)), 1);
        assert_eq!(cache.invalidate(9, None), 4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stats_track_hits_and_top_keys() {
        let (_clock, cache) = cache(10);
        cache.warm(vec![
            (1, SizeVariant::Medium, "/a".to_string()),
            (2, SizeVariant::Medium, "/b".to_string()),
        ]);
        cache.get(1, SizeVariant::Medium);
        cache.get(1, SizeVariant::Medium);
        cache.get(2, SizeVariant::Medium);
        cache.get(3, SizeVariant::Medium);

        let stats = cache.stats();
        assert_eq!(stats.performance.total_requests, 4);
        assert!((stats.performance.hit_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(stats.top_accessed[0].key, "album_1_medium");
        assert_eq!(stats.top_accessed[0].count, 2);
        assert!(stats.memory.bytes_total > 0);

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().memory.bytes_total, 0);
    }

    #[test]
    fn removed_entries_drop_out_of_top_accessed() {
        let (clock, cache) = cache(1);
        cache.set(1, SizeVariant::Medium, "/a", None);
        cache.get(1, SizeVariant::Medium);
        cache.set(2, SizeVariant::Medium, "/b", None);
        assert!(cache.get(1, SizeVariant::Medium).is_none());
        assert!(cache.stats().top_accessed.is_empty());

        cache.get(2, SizeVariant::Medium);
        clock.advance(chrono::Duration::seconds(61));
        assert!(cache.get(2, SizeVariant::Medium).is_none());
        assert!(cache.stats().top_accessed.is_empty());

        cache.set(3, SizeVariant::Medium, "/c", None);
        cache.get(3, SizeVariant::Medium);
        cache.set(3, SizeVariant::Medium, "/c2", None);
        assert_eq!(cache.stats().top_accessed[0].count, 1);
        assert_eq!(cache.invalidate(3, None), 1);
        assert!(cache.stats().top_accessed.is_empty());
    }
}
