//! Hash-chained ledger
//!
//! [`Ledger`] is the single point of mutation for a chain. Appends run under a
//! write lock that covers reading the tail, hashing, signing, persisting and
//! updating the recent-entries cache, so two appends can never link to the
//! same predecessor. Reads go straight to the recent cache or the backend.
//!
//! # Example
//!
//! ```
//! use audit_ledger::{Config, Ledger, Payload};
//! use serde_json::json;
//!
//! # fn main() -> audit_ledger::Result<()> {
//! let config = Config { auto_verify: false, ..Config::default() };
//! let ledger = Ledger::in_memory(config)?;
//!
//! let mut data = Payload::new();
//! data.insert("event".into(), json!("login"));
//! let entry = ledger.append(data)?;
//!
//! assert!(entry.previous_hash.is_none());
//! ledger.verify_integrity(None, None)?;
//! # Ok(())
//! # }
//! ```

use crate::{
    cache::LruMap,
    crypto::Signer,
    hashing::{CanonicalHasher, HexDigest},
    merkle::{tree_for_entries, MerkleTree},
    metrics::Metrics,
    storage::{MemoryBackend, StorageBackend},
    task::PeriodicTask,
    types::{Entry, EntryFilter, EntryId, LedgerStats, Payload, PendingEntry, VerificationStatus},
    verify::{IntegrityVerifier, VerificationReport},
    Config, Error, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Entries fetched per storage call during scans
const SCAN_PAGE_SIZE: usize = 1000;

/// Per-append options
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Auxiliary metadata (hashed with the entry)
    pub metadata: Payload,
    /// Sign this entry even if signatures are not globally enabled
    pub sign: bool,
    /// Signer for this entry, overriding the ledger's default signer
    pub signer: Option<Arc<dyn Signer>>,
}

impl AppendOptions {
    /// Attach metadata
    pub fn metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    /// Request a signature from `signer`
    pub fn signed_by(mut self, signer: Arc<dyn Signer>) -> Self {
        self.sign = true;
        self.signer = Some(signer);
        self
    }
}

/// Operations shared by the ledger and its decorators
pub trait AuditLog: Send + Sync {
    /// Append an entry
    fn append_with(&self, data: Payload, options: AppendOptions) -> Result<Entry>;

    /// Append an entry with default options
    fn append(&self, data: Payload) -> Result<Entry> {
        self.append_with(data, AppendOptions::default())
    }

    /// Entry by id
    fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>>;

    /// Entry by sequence
    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Entry>>;

    /// Entries with `start <= sequence <= end`
    fn get_range(&self, start: u64, end: u64) -> Result<Vec<Entry>>;

    /// Entries in storage order, windowed by `filter`
    fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>>;

    /// Full scan with a caller-supplied predicate
    fn query(&self, predicate: &dyn Fn(&Entry) -> bool, limit: Option<usize>) -> Result<Vec<Entry>>;

    /// Entries whose data contains every key/value pair in `criteria`
    fn search(&self, criteria: &Payload) -> Result<Vec<Entry>> {
        self.query(&|entry| entry.matches(criteria), None)
    }

    /// Walk the chain; fails with [`Error::Integrity`] on tampering
    fn verify_integrity(
        &self,
        start: Option<&EntryId>,
        end: Option<&EntryId>,
    ) -> Result<VerificationReport>;

    /// Re-hash one entry and confirm its predecessor exists
    fn verify_entry(&self, id: &EntryId) -> Result<bool>;

    /// Ledger statistics
    fn get_stats(&self) -> Result<LedgerStats>;

    /// Hash the next entry will link to
    fn head_hash(&self) -> Result<HexDigest>;
}

/// New-entry callback
pub type Subscriber = Arc<dyn Fn(&Entry) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`Ledger::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct LedgerInner {
    backend: Arc<dyn StorageBackend>,
    hasher: CanonicalHasher,
    verifier: IntegrityVerifier,
    config: Config,
    default_signer: Option<Arc<dyn Signer>>,
    write_lock: Mutex<()>,
    recent: Mutex<LruMap<EntryId, Entry>>,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    next_subscription: AtomicU64,
    last_verification: RwLock<Option<VerificationStatus>>,
    metrics: Metrics,
    closed: AtomicBool,
}

/// Hash-chained, append-only ledger
pub struct Ledger {
    inner: Arc<LedgerInner>,
    verify_task: Mutex<Option<PeriodicTask>>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("backend", &self.inner.backend.name())
            .field("hash_algorithm", &self.inner.hasher.algorithm())
            .field("subscribers", &self.inner.subscribers.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Ledger {
    /// Open a ledger over `backend`
    pub fn new(backend: Arc<dyn StorageBackend>, config: Config) -> Result<Self> {
        Self::open(backend, config, None)
    }

    /// Open a ledger that signs with `signer` when signing is requested
    pub fn with_signer(
        backend: Arc<dyn StorageBackend>,
        config: Config,
        signer: Arc<dyn Signer>,
    ) -> Result<Self> {
        Self::open(backend, config, Some(signer))
    }

    /// Open a ledger over a fresh [`MemoryBackend`]
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    fn open(
        backend: Arc<dyn StorageBackend>,
        config: Config,
        default_signer: Option<Arc<dyn Signer>>,
    ) -> Result<Self> {
        config.validate()?;

        let hasher = CanonicalHasher::new(config.hash_algorithm);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let inner = Arc::new(LedgerInner {
            backend,
            hasher,
            verifier: IntegrityVerifier::new(hasher),
            default_signer,
            write_lock: Mutex::new(()),
            recent: Mutex::new(LruMap::new()),
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(0),
            last_verification: RwLock::new(None),
            metrics,
            closed: AtomicBool::new(false),
            config,
        });
        inner.load_recent();

        let ledger = Self {
            inner,
            verify_task: Mutex::new(None),
        };

        if ledger.inner.config.auto_verify {
            ledger.start_auto_verify(ledger.inner.config.verify_interval())?;
        }

        tracing::info!(
            backend = ledger.inner.backend.name(),
            hash_algorithm = %ledger.inner.hasher.algorithm(),
            auto_verify = ledger.inner.config.auto_verify,
            "Ledger opened"
        );

        Ok(ledger)
    }

    /// (Re)start background verification on a fixed interval
    pub fn start_auto_verify(&self, interval: Duration) -> Result<()> {
        let weak: Weak<LedgerInner> = Arc::downgrade(&self.inner);
        let task = PeriodicTask::spawn("audit-ledger-verify", interval, move || {
            if let Some(inner) = weak.upgrade() {
                tracing::info!("Running scheduled integrity verification");
                if let Err(e) = inner.verify_integrity(None, None) {
                    tracing::error!(error = %e, "Scheduled verification failed");
                }
            }
        })?;

        // Replacing the old task stops it
        *self.verify_task.lock() = Some(task);
        Ok(())
    }

    /// Stop background verification
    pub fn stop_auto_verify(&self) {
        self.verify_task.lock().take();
    }

    /// Append an entry
    pub fn append(&self, data: Payload) -> Result<Entry> {
        self.inner.append(data, AppendOptions::default())
    }

    /// Append an entry with metadata and signing options
    pub fn append_with(&self, data: Payload, options: AppendOptions) -> Result<Entry> {
        self.inner.append(data, options)
    }

    /// Entry by id, consulting the recent cache first
    pub fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        self.inner.get_entry(id)
    }

    /// Entries in storage order
    pub fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>> {
        self.inner.backend.get_entries(filter)
    }

    /// Full scan with a predicate
    pub fn query(
        &self,
        predicate: &dyn Fn(&Entry) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        self.inner.query(predicate, limit)
    }

    /// Verify the chain (or part of it)
    pub fn verify_integrity(
        &self,
        start: Option<&EntryId>,
        end: Option<&EntryId>,
    ) -> Result<VerificationReport> {
        self.inner.verify_integrity(start, end)
    }

    /// Verify one entry
    pub fn verify_entry(&self, id: &EntryId) -> Result<bool> {
        match self.inner.get_entry(id)? {
            Some(entry) => self
                .inner
                .verifier
                .verify_entry(self.inner.backend.as_ref(), &entry),
            None => Ok(false),
        }
    }

    /// Check an entry's signature against its hash
    pub fn verify_signature(&self, entry: &Entry, signer: &dyn Signer) -> Result<()> {
        let signature = entry
            .signature
            .as_deref()
            .ok_or_else(|| Error::Signature(format!("Entry {} is not signed", entry.id)))?;

        if signer.verify(&entry.hash.to_bytes(), signature) {
            Ok(())
        } else {
            Err(Error::Signature(format!(
                "Signature verification failed for entry {}",
                entry.id
            )))
        }
    }

    /// Ledger statistics
    pub fn get_stats(&self) -> Result<LedgerStats> {
        self.inner.get_stats()
    }

    /// Hash of the tail entry, or the genesis sentinel for an empty chain
    pub fn head_hash(&self) -> Result<HexDigest> {
        Ok(match self.inner.backend.get_latest_entry()? {
            Some(entry) => entry.hash,
            None => self.inner.hasher.genesis_hash(),
        })
    }

    /// Merkle tree over the entries selected by `filter` (leaf = entry hash)
    pub fn merkle_tree(&self, filter: &EntryFilter) -> Result<MerkleTree> {
        let entries = self.get_entries(filter)?;
        tree_for_entries(&self.inner.hasher, &entries)
    }

    /// Register a new-entry callback
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Entry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.insert(id, Arc::new(callback));
        id
    }

    /// Remove a callback; false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(&id).is_some()
    }

    /// Storage backend
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    /// Chain hasher
    pub fn hasher(&self) -> &CanonicalHasher {
        &self.inner.hasher
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Prometheus metrics
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Stop background work and close the backend. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.stop_auto_verify();
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.backend.close()?;
        tracing::info!(backend = self.inner.backend.name(), "Ledger closed");
        Ok(())
    }

    /// Has `close` been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl LedgerInner {
    /// Warm the recent cache with the newest entries
    fn load_recent(&self) {
        let capacity = self.config.max_entries_memory;
        let loaded = self.backend.count_entries().and_then(|count| {
            let offset = usize::try_from(count)
                .unwrap_or(usize::MAX)
                .saturating_sub(capacity);
            self.backend
                .get_entries(&EntryFilter::all().offset(offset).limit(capacity))
        });

        match loaded {
            Ok(entries) => {
                let mut recent = self.recent.lock();
                for entry in entries {
                    recent.insert(entry.id, entry);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to load recent entries"),
        }
    }

    fn remember(&self, entry: &Entry) {
        let mut recent = self.recent.lock();
        recent.insert(entry.id, entry.clone());
        while recent.len() > self.config.max_entries_memory {
            recent.pop_lru();
        }
    }

    fn append(&self, data: Payload, options: AppendOptions) -> Result<Entry> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::storage("append", self.backend.name(), "ledger is closed"));
        }

        let started = Instant::now();
        let entry = {
            let _guard = self.write_lock.lock();

            let previous = self.backend.get_latest_entry()?;
            let pending = PendingEntry::new(data, options.metadata, previous.as_ref())?;
            let hash = self.hasher.hash_value(&pending.hash_input());

            let signature = if options.sign || self.config.enable_signatures {
                let signer = options
                    .signer
                    .as_ref()
                    .or(self.default_signer.as_ref())
                    .ok_or_else(|| {
                        Error::Validation("Signer required for signing".to_string())
                    })?;
                Some(signer.sign(&hash.to_bytes())?)
            } else {
                None
            };

            let entry = pending.seal(hash, signature);
            self.backend.append_entry(&entry)?;
            self.remember(&entry);
            entry
        };

        self.metrics.record_append(started.elapsed().as_secs_f64());
        tracing::debug!(
            entry_id = %entry.id,
            sequence = entry.sequence,
            signed = entry.signature.is_some(),
            "Entry appended"
        );

        self.notify(&entry);
        Ok(entry)
    }

    fn notify(&self, entry: &Entry) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let subscribers: Vec<(SubscriptionId, Subscriber)> = self
            .subscribers
            .iter()
            .map(|item| (*item.key(), item.value().clone()))
            .collect();

        for (id, callback) in subscribers {
            if let Err(e) = callback(entry) {
                tracing::error!(
                    subscription = id.0,
                    entry_id = %entry.id,
                    error = %e,
                    "Subscriber callback failed"
                );
            }
        }
    }

    fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        if let Some(entry) = self.recent.lock().get_mut(id) {
            return Ok(Some(entry.clone()));
        }
        self.backend.get_entry(id)
    }

    fn query(
        &self,
        predicate: &dyn Fn(&Entry) -> bool,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();
        let mut offset = 0;

        while results.len() < limit {
            let page = self
                .backend
                .get_entries(&EntryFilter::all().offset(offset).limit(SCAN_PAGE_SIZE))?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            results.extend(page.into_iter().filter(|entry| predicate(entry)));
        }

        results.truncate(limit);
        Ok(results)
    }

    fn verify_integrity(
        &self,
        start: Option<&EntryId>,
        end: Option<&EntryId>,
    ) -> Result<VerificationReport> {
        let result = self.verifier.verify(self.backend.as_ref(), start, end);

        let status = match &result {
            Ok(report) => Some((true, report.entries_checked)),
            Err(e) if e.is_integrity() => {
                tracing::error!(error = %e, "Integrity violation detected");
                Some((false, 0))
            }
            Err(_) => None,
        };

        if let Some((verified, entries_checked)) = status {
            self.metrics.record_verification(verified);
            *self.last_verification.write() = Some(VerificationStatus {
                verified,
                checked_at: Utc::now(),
                entries_checked,
            });
        }

        result
    }

    fn get_stats(&self) -> Result<LedgerStats> {
        let total_size_bytes = self.backend.get_size()?;
        self.metrics.update_storage_size(total_size_bytes);

        let last_verification = self.last_verification.read().clone();
        Ok(LedgerStats {
            total_entries: self.backend.count_entries()?,
            first_entry_time: self.backend.get_oldest_entry()?.map(|e| e.timestamp),
            last_entry_time: self.backend.get_latest_entry()?.map(|e| e.timestamp),
            total_size_bytes,
            hash_algorithm: self.hasher.algorithm(),
            integrity_verified: last_verification.as_ref().map_or(true, |s| s.verified),
            last_verification_time: last_verification.map(|s| s.checked_at),
        })
    }
}

impl AuditLog for Ledger {
    fn append_with(&self, data: Payload, options: AppendOptions) -> Result<Entry> {
        Ledger::append_with(self, data, options)
    }

    fn append(&self, data: Payload) -> Result<Entry> {
        Ledger::append(self, data)
    }

    fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        Ledger::get_entry(self, id)
    }

    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Entry>> {
        self.inner.backend.get_by_sequence(sequence)
    }

    fn get_range(&self, start: u64, end: u64) -> Result<Vec<Entry>> {
        self.inner.backend.get_range(start, end)
    }

    fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>> {
        Ledger::get_entries(self, filter)
    }

    fn query(&self, predicate: &dyn Fn(&Entry) -> bool, limit: Option<usize>) -> Result<Vec<Entry>> {
        Ledger::query(self, predicate, limit)
    }

    fn verify_integrity(
        &self,
        start: Option<&EntryId>,
        end: Option<&EntryId>,
    ) -> Result<VerificationReport> {
        Ledger::verify_integrity(self, start, end)
    }

    fn verify_entry(&self, id: &EntryId) -> Result<bool> {
        Ledger::verify_entry(self, id)
    }

    fn get_stats(&self) -> Result<LedgerStats> {
        Ledger::get_stats(self)
    }

    fn head_hash(&self) -> Result<HexDigest> {
        Ledger::head_hash(self)
    }
}
