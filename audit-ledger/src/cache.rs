//! In-process caches in front of storage
//!
//! Three independent caches, each behind its own lock:
//! - [`EntryCache`]: single entries keyed by sequence, bounded by count and
//!   serialized size, with a TTL
//! - [`RangeCache`]: inclusive sequence ranges, bounded by range count
//! - [`QueryCache`]: search results keyed by a hash of the criteria, with a TTL
//!
//! All three evict least-recently-used first.

use crate::{
    config::CacheConfig,
    hashing::{CanonicalHasher, HashAlgorithm, HexDigest},
    types::{Entry, Payload},
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Insertion-ordered map where the front is the least recently used key
#[derive(Debug)]
pub(crate) struct LruMap<K, V> {
    map: IndexMap<K, V>,
}

impl<K: Hash + Eq, V> LruMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            map: IndexMap::new(),
        }
    }

    /// Look up and mark as most recently used
    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.map.get_index_of(key)?;
        let last = self.map.len() - 1;
        self.map.move_index(index, last);
        self.map.get_index_mut(last).map(|(_, v)| v)
    }

    /// Look up without touching recency
    pub(crate) fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Insert as most recently used, replacing any previous value
    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.map.shift_remove(&key);
        self.map.insert(key, value);
        previous
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        self.map.shift_remove(key)
    }

    /// Remove the least recently used pair
    pub(crate) fn pop_lru(&mut self) -> Option<(K, V)> {
        self.map.shift_remove_index(0)
    }

    pub(crate) fn retain(&mut self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.map.retain(keep);
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }
}

/// Cached entry with bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The entry
    pub entry: Entry,
    /// When it was cached
    pub cached_at: Instant,
    /// Hits served
    pub access_count: u64,
    /// Last hit (or insertion)
    pub last_accessed: Instant,
    /// Serialized size
    pub size_bytes: usize,
}

impl CacheEntry {
    fn new(entry: Entry) -> Self {
        let size_bytes = entry
            .encoded_len()
            .map(|n| n as usize)
            .unwrap_or_else(|_| entry.size_bytes());
        let now = Instant::now();
        Self {
            entry,
            cached_at: now,
            access_count: 0,
            last_accessed: now,
            size_bytes,
        }
    }

    fn accessed(&mut self) {
        self.access_count += 1;
        self.last_accessed = Instant::now();
    }

    /// Time since caching
    pub fn age(&self) -> Duration {
        self.cached_at.elapsed()
    }

    /// Older than `ttl`
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

/// Cache performance statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
    /// Items removed to satisfy bounds
    pub evictions: u64,
    /// Items currently cached
    pub entry_count: usize,
    /// Serialized size of cached items (entry cache only)
    pub total_size_bytes: usize,
}

impl CacheStats {
    /// Hits over lookups
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct EntryCacheState {
    entries: LruMap<u64, CacheEntry>,
    stats: CacheStats,
}

/// LRU cache of single entries keyed by sequence
#[derive(Debug)]
pub struct EntryCache {
    max_entries: usize,
    max_size_bytes: usize,
    ttl: Duration,
    state: Mutex<EntryCacheState>,
}

impl EntryCache {
    /// Create with explicit bounds
    pub fn new(max_entries: usize, max_size_bytes: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            max_size_bytes,
            ttl,
            state: Mutex::new(EntryCacheState {
                entries: LruMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Create from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.entry_max_entries,
            config.entry_max_size_bytes(),
            config.entry_ttl(),
        )
    }

    /// Cached entry, or `None` on miss. Stale entries are evicted.
    pub fn get(&self, sequence: u64) -> Option<Entry> {
        let mut state = self.state.lock();
        let state = &mut *state;

        let stale = match state.entries.get_mut(&sequence) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(cached) if cached.is_stale(self.ttl) => true,
            Some(cached) => {
                cached.accessed();
                state.stats.hits += 1;
                return Some(cached.entry.clone());
            }
        };

        if stale {
            if let Some(removed) = state.entries.remove(&sequence) {
                state.stats.total_size_bytes -= removed.size_bytes;
            }
            state.stats.entry_count = state.entries.len();
            state.stats.misses += 1;
        }
        None
    }

    /// Insert, evicting least-recently-used entries until both bounds hold.
    ///
    /// An entry larger than the whole size budget is not cached and evicts
    /// nothing; returns whether the entry was cached.
    pub fn put(&self, entry: Entry) -> bool {
        let cached = CacheEntry::new(entry);
        let mut state = self.state.lock();
        let state = &mut *state;

        if let Some(previous) = state.entries.remove(&cached.entry.sequence) {
            state.stats.total_size_bytes -= previous.size_bytes;
            state.stats.entry_count = state.entries.len();
        }

        if cached.size_bytes > self.max_size_bytes {
            tracing::debug!(
                sequence = cached.entry.sequence,
                size_bytes = cached.size_bytes,
                max_size_bytes = self.max_size_bytes,
                "Entry larger than cache budget, not cached"
            );
            return false;
        }

        while !state.entries.is_empty()
            && (state.entries.len() >= self.max_entries
                || state.stats.total_size_bytes + cached.size_bytes > self.max_size_bytes)
        {
            if let Some((_, evicted)) = state.entries.pop_lru() {
                state.stats.total_size_bytes -= evicted.size_bytes;
                state.stats.evictions += 1;
            }
        }

        state.stats.total_size_bytes += cached.size_bytes;
        state.entries.insert(cached.entry.sequence, cached);
        state.stats.entry_count = state.entries.len();
        true
    }

    /// Drop one entry; true if it was cached
    pub fn invalidate(&self, sequence: u64) -> bool {
        let mut state = self.state.lock();
        match state.entries.remove(&sequence) {
            Some(removed) => {
                state.stats.total_size_bytes -= removed.size_bytes;
                state.stats.entry_count = state.entries.len();
                true
            }
            None => false,
        }
    }

    /// Bookkeeping for a cached entry, without counting as a hit
    pub fn peek(&self, sequence: u64) -> Option<CacheEntry> {
        self.state.lock().entries.peek(&sequence).cloned()
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.stats.total_size_bytes = 0;
        state.stats.entry_count = 0;
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }
}

#[derive(Debug)]
struct RangeCacheState {
    ranges: LruMap<(u64, u64), Vec<Entry>>,
    /// Bumped by every invalidation
    generation: u64,
    stats: CacheStats,
}

/// LRU cache of inclusive sequence ranges
#[derive(Debug)]
pub struct RangeCache {
    max_ranges: usize,
    state: Mutex<RangeCacheState>,
}

impl RangeCache {
    /// Create with a range-count bound
    pub fn new(max_ranges: usize) -> Self {
        Self {
            max_ranges,
            state: Mutex::new(RangeCacheState {
                ranges: LruMap::new(),
                generation: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Cached entries for `start..=end`
    pub fn get_range(&self, start: u64, end: u64) -> Option<Vec<Entry>> {
        let mut state = self.state.lock();
        let state = &mut *state;
        match state.ranges.get_mut(&(start, end)) {
            Some(entries) => {
                state.stats.hits += 1;
                Some(entries.clone())
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Invalidation counter; pass it to
    /// [`put_range_if_current`](Self::put_range_if_current) after reading storage
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Cache the entries for `start..=end`
    pub fn put_range(&self, start: u64, end: u64, entries: Vec<Entry>) {
        let mut state = self.state.lock();
        Self::insert(&mut state, self.max_ranges, (start, end), entries);
    }

    /// Cache the entries for `start..=end` unless an invalidation ran since
    /// `generation` was read; returns whether they were cached
    pub fn put_range_if_current(
        &self,
        generation: u64,
        start: u64,
        end: u64,
        entries: Vec<Entry>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        Self::insert(&mut state, self.max_ranges, (start, end), entries);
        true
    }

    fn insert(state: &mut RangeCacheState, max_ranges: usize, key: (u64, u64), entries: Vec<Entry>) {
        if state.ranges.peek(&key).is_none() {
            while state.ranges.len() >= max_ranges && state.ranges.pop_lru().is_some() {
                state.stats.evictions += 1;
            }
        }
        state.ranges.insert(key, entries);
        state.stats.entry_count = state.ranges.len();
    }

    /// Drop every range containing `sequence`; returns how many were dropped
    pub fn invalidate_overlapping(&self, sequence: u64) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        let before = state.ranges.len();
        state
            .ranges
            .retain(|&(start, end), _| !(start <= sequence && sequence <= end));
        let removed = before - state.ranges.len();
        state.stats.entry_count = state.ranges.len();
        removed
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.ranges.clear();
        state.stats.entry_count = 0;
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }
}

#[derive(Debug)]
struct QueryCacheState {
    queries: LruMap<HexDigest, (Vec<Entry>, Instant)>,
    /// Bumped by every invalidation
    generation: u64,
    stats: CacheStats,
}

/// LRU cache of search results keyed by criteria
#[derive(Debug)]
pub struct QueryCache {
    max_queries: usize,
    ttl: Duration,
    hasher: CanonicalHasher,
    state: Mutex<QueryCacheState>,
}

impl QueryCache {
    /// Create with a query-count bound and TTL
    pub fn new(max_queries: usize, ttl: Duration) -> Self {
        Self {
            max_queries,
            ttl,
            hasher: CanonicalHasher::new(HashAlgorithm::Sha256),
            state: Mutex::new(QueryCacheState {
                queries: LruMap::new(),
                generation: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Stable key for criteria, independent of key order
    pub fn query_key(&self, criteria: &Payload) -> HexDigest {
        self.hasher.hash_value(&Value::Object(criteria.clone()))
    }

    /// Cached results, or `None` on miss or expiry
    pub fn get(&self, criteria: &Payload) -> Option<Vec<Entry>> {
        let key = self.query_key(criteria);
        let mut state = self.state.lock();
        let state = &mut *state;

        let fresh = match state.queries.get_mut(&key) {
            Some((entries, cached_at)) if cached_at.elapsed() <= self.ttl => Some(entries.clone()),
            Some(_) => {
                state.queries.remove(&key);
                state.stats.entry_count = state.queries.len();
                None
            }
            None => None,
        };

        match fresh {
            Some(_) => state.stats.hits += 1,
            None => state.stats.misses += 1,
        }
        fresh
    }

    /// Invalidation counter, see [`RangeCache::generation`]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Cache results for criteria
    pub fn put(&self, criteria: &Payload, entries: Vec<Entry>) {
        let key = self.query_key(criteria);
        let mut state = self.state.lock();
        Self::insert(&mut state, self.max_queries, key, entries);
    }

    /// Cache results unless an invalidation ran since `generation` was read
    pub fn put_if_current(&self, generation: u64, criteria: &Payload, entries: Vec<Entry>) -> bool {
        let key = self.query_key(criteria);
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        Self::insert(&mut state, self.max_queries, key, entries);
        true
    }

    fn insert(state: &mut QueryCacheState, max_queries: usize, key: HexDigest, entries: Vec<Entry>) {
        if state.queries.peek(&key).is_none() {
            while state.queries.len() >= max_queries && state.queries.pop_lru().is_some() {
                state.stats.evictions += 1;
            }
        }
        state.queries.insert(key, (entries, Instant::now()));
        state.stats.entry_count = state.queries.len();
    }

    /// Drop every cached result
    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.queries.clear();
        state.stats.entry_count = 0;
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }
}
