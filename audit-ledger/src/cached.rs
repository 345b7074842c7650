//! Cache-aware ledger decorator
//!
//! [`CachedLedger`] wraps any [`AuditLog`] and serves sequence lookups, ranges
//! and searches from the caches in [`crate::cache`]. Writes go to the wrapped
//! log first; the caches are then updated in a fixed order (entry cache, range
//! invalidation, query invalidation, callbacks) so a reader never sees a cached
//! result that predates a completed write.

use crate::{
    cache::{CacheStats, EntryCache, QueryCache, RangeCache},
    config::CacheConfig,
    hashing::HexDigest,
    ledger::{AppendOptions, AuditLog},
    types::{Entry, EntryFilter, EntryId, LedgerStats, Payload},
    verify::VerificationReport,
    Result,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Called after each write once the caches are updated
pub type InvalidationCallback = Arc<dyn Fn(&Entry) -> anyhow::Result<()> + Send + Sync>;

/// Statistics of every enabled cache
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheLayerStats {
    /// Entry cache
    pub entry: Option<CacheStats>,
    /// Range cache
    pub range: Option<CacheStats>,
    /// Query cache
    pub query: Option<CacheStats>,
}

/// [`AuditLog`] decorator with entry, range and query caches
pub struct CachedLedger<L> {
    inner: L,
    entry_cache: Option<EntryCache>,
    range_cache: Option<RangeCache>,
    query_cache: Option<QueryCache>,
    callbacks: RwLock<Vec<InvalidationCallback>>,
}

impl<L> fmt::Debug for CachedLedger<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedLedger")
            .field("entry_cache", &self.entry_cache.is_some())
            .field("range_cache", &self.range_cache.is_some())
            .field("query_cache", &self.query_cache.is_some())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl<L: AuditLog> CachedLedger<L> {
    /// Wrap `inner` with the caches enabled in `config`
    pub fn new(inner: L, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            entry_cache: config
                .enable_entry_cache
                .then(|| EntryCache::from_config(config)),
            range_cache: config
                .enable_range_cache
                .then(|| RangeCache::new(config.max_ranges)),
            query_cache: config
                .enable_query_cache
                .then(|| QueryCache::new(config.max_queries, config.query_ttl())),
            callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Wrapped log
    pub fn inner(&self) -> &L {
        &self.inner
    }

    /// Register a callback run after every write
    pub fn add_invalidation_callback<F>(&self, callback: F)
    where
        F: Fn(&Entry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Statistics of the enabled caches
    pub fn cache_stats(&self) -> CacheLayerStats {
        CacheLayerStats {
            entry: self.entry_cache.as_ref().map(EntryCache::stats),
            range: self.range_cache.as_ref().map(RangeCache::stats),
            query: self.query_cache.as_ref().map(QueryCache::stats),
        }
    }

    /// Empty every cache
    pub fn clear_caches(&self) {
        if let Some(cache) = &self.entry_cache {
            cache.clear();
        }
        if let Some(cache) = &self.range_cache {
            cache.clear();
        }
        if let Some(cache) = &self.query_cache {
            cache.invalidate_all();
        }
        tracing::debug!("Caches cleared");
    }

    fn cache_entries(&self, entries: &[Entry]) {
        if let Some(cache) = &self.entry_cache {
            for entry in entries {
                cache.put(entry.clone());
            }
        }
    }

    fn on_write(&self, entry: &Entry) {
        if let Some(cache) = &self.entry_cache {
            cache.put(entry.clone());
        }
        if let Some(cache) = &self.range_cache {
            let dropped = cache.invalidate_overlapping(entry.sequence);
            if dropped > 0 {
                tracing::debug!(sequence = entry.sequence, dropped, "Range cache invalidated");
            }
        }
        if let Some(cache) = &self.query_cache {
            cache.invalidate_all();
        }

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            if let Err(e) = callback(entry) {
                tracing::warn!(entry_id = %entry.id, error = %e, "Invalidation callback failed");
            }
        }
    }
}

impl<L: AuditLog> AuditLog for CachedLedger<L> {
    fn append_with(&self, data: Payload, options: AppendOptions) -> Result<Entry> {
        let entry = self.inner.append_with(data, options)?;
        self.on_write(&entry);
        Ok(entry)
    }

    fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        let entry = self.inner.get_entry(id)?;
        if let (Some(entry), Some(cache)) = (&entry, &self.entry_cache) {
            cache.put(entry.clone());
        }
        Ok(entry)
    }

    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Entry>> {
        if let Some(entry) = self.entry_cache.as_ref().and_then(|c| c.get(sequence)) {
            return Ok(Some(entry));
        }

        let entry = self.inner.get_by_sequence(sequence)?;
        if let (Some(entry), Some(cache)) = (&entry, &self.entry_cache) {
            cache.put(entry.clone());
        }
        Ok(entry)
    }

    fn get_range(&self, start: u64, end: u64) -> Result<Vec<Entry>> {
        if let Some(entries) = self.range_cache.as_ref().and_then(|c| c.get_range(start, end)) {
            return Ok(entries);
        }

        let generation = self.range_cache.as_ref().map(RangeCache::generation);
        let entries = self.inner.get_range(start, end)?;
        self.cache_entries(&entries);
        if let (Some(cache), Some(generation)) = (&self.range_cache, generation) {
            if !cache.put_range_if_current(generation, start, end, entries.clone()) {
                tracing::trace!(start, end, "Range changed while reading, not cached");
            }
        }
        Ok(entries)
    }

    fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>> {
        self.inner.get_entries(filter)
    }

    fn query(&self, predicate: &dyn Fn(&Entry) -> bool, limit: Option<usize>) -> Result<Vec<Entry>> {
        // Arbitrary predicates have no stable cache key
        self.inner.query(predicate, limit)
    }

    fn search(&self, criteria: &Payload) -> Result<Vec<Entry>> {
        if let Some(entries) = self.query_cache.as_ref().and_then(|c| c.get(criteria)) {
            return Ok(entries);
        }

        let generation = self.query_cache.as_ref().map(QueryCache::generation);
        let entries = self.inner.search(criteria)?;
        self.cache_entries(&entries);
        if let (Some(cache), Some(generation)) = (&self.query_cache, generation) {
            cache.put_if_current(generation, criteria, entries.clone());
        }
        Ok(entries)
    }

    fn verify_integrity(
        &self,
        start: Option<&EntryId>,
        end: Option<&EntryId>,
    ) -> Result<VerificationReport> {
        self.inner.verify_integrity(start, end)
    }

    fn verify_entry(&self, id: &EntryId) -> Result<bool> {
        self.inner.verify_entry(id)
    }

    fn get_stats(&self) -> Result<LedgerStats> {
        self.inner.get_stats()
    }

    fn head_hash(&self) -> Result<HexDigest> {
        self.inner.head_hash()
    }
}
