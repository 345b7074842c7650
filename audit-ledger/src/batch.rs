//! Batch ingestion
//!
//! [`BatchProcessor`] queues append operations in a bounded lock-free queue and
//! commits them when the queue reaches a threshold, when a timer fires, or when
//! [`BatchProcessor::process`] is called. Only one commit runs at a time. Each
//! operation succeeds or fails on its own; failures are collected in the
//! [`BatchResult`] and never abort the rest of the batch. A [`BatchScope`]
//! holds automatic commits back while it lives and commits once it ends.
//! Operations still queued when the processor is dropped are committed.
//!
//! [`TransactionalBatch`] stages operations locally and appends them under one
//! transaction id. The chain is append-only, so a failed transaction is only
//! recorded (see [`TransactionState::Failed`]); entries already appended stay.

use crate::{
    config::BatchConfig,
    ledger::{AppendOptions, AuditLog},
    metrics::Metrics,
    task::PeriodicTask,
    types::{Entry, EntryId, Payload},
    Error, Result,
};
use chrono::{DateTime, Utc};
use crossbeam::{channel, queue::ArrayQueue};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One queued append
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    /// `batch_<uuid>`
    pub operation_id: String,
    /// Entry data
    pub data: Payload,
    /// Entry metadata
    pub metadata: Payload,
    /// When the operation was queued
    pub timestamp: DateTime<Utc>,
}

impl BatchOperation {
    /// New operation with a fresh id
    pub fn new(data: Payload, metadata: Payload) -> Self {
        Self {
            operation_id: format!("batch_{}", Uuid::new_v4()),
            data,
            metadata,
            timestamp: Utc::now(),
        }
    }

    fn append_options(&self, tag: &str, id: &str) -> AppendOptions {
        let mut metadata = self.metadata.clone();
        metadata.insert(tag.to_string(), Value::String(id.to_string()));
        AppendOptions::default().metadata(metadata)
    }
}

/// Outcome of one commit
#[derive(Debug)]
pub struct BatchResult {
    /// Appended entries; completion order in parallel mode
    pub successful_entries: Vec<Entry>,
    /// Operations that failed, with their errors
    pub failed_operations: Vec<(BatchOperation, Error)>,
    /// Operations drained for this commit
    pub total_operations: usize,
    /// Wall time of the commit
    pub execution_time: Duration,
}

impl BatchResult {
    /// Appended operations
    pub fn success_count(&self) -> usize {
        self.successful_entries.len()
    }

    /// Failed operations
    pub fn failure_count(&self) -> usize {
        self.failed_operations.len()
    }

    /// Successes over total (0.0 for an empty result)
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.success_count() as f64 / self.total_operations as f64
        }
    }
}

/// Processor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    /// Operations appended
    pub total_processed: u64,
    /// Operations that failed
    pub total_failed: u64,
    /// Commits completed
    pub batches_committed: u64,
    /// Operations waiting in the queue
    pub queue_size: usize,
    /// A commit is running
    pub commit_in_flight: bool,
}

type Rule = Box<dyn Fn(&BatchOperation) -> bool + Send + Sync>;

/// Named pre-commit checks
#[derive(Default)]
pub struct BatchValidator {
    rules: Vec<(String, Rule)>,
}

impl fmt::Debug for BatchValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchValidator")
            .field("rules", &self.rules.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .finish()
    }
}

impl BatchValidator {
    /// Empty validator; accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule; operations for which `check` returns false are rejected
    pub fn add_rule<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn(&BatchOperation) -> bool + Send + Sync + 'static,
    {
        self.rules.push((name.into(), Box::new(check)));
    }

    /// Builder form of [`add_rule`](Self::add_rule)
    pub fn with_rule<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&BatchOperation) -> bool + Send + Sync + 'static,
    {
        self.add_rule(name, check);
        self
    }

    /// Split into accepted operations and rejected ones with the failed rule
    pub fn validate(
        &self,
        operations: Vec<BatchOperation>,
    ) -> (Vec<BatchOperation>, Vec<(BatchOperation, Error)>) {
        let mut accepted = Vec::with_capacity(operations.len());
        let mut rejected = Vec::new();

        for op in operations {
            match self.rules.iter().find(|(_, check)| !check(&op)) {
                Some((name, _)) => {
                    let error = Error::Validation(format!(
                        "Operation {} rejected by rule '{}'",
                        op.operation_id, name
                    ));
                    rejected.push((op, error));
                }
                None => accepted.push(op),
            }
        }

        (accepted, rejected)
    }
}

struct ProcessorInner {
    ledger: Arc<dyn AuditLog>,
    config: BatchConfig,
    queue: ArrayQueue<BatchOperation>,
    validator: RwLock<BatchValidator>,
    committing: AtomicBool,
    /// Open [`BatchScope`]s; automatic commits wait while non-zero
    scopes: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    metrics: Option<Metrics>,
}

/// Clears the in-flight flag even if a commit panics
struct CommitGuard<'a>(&'a AtomicBool);

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Queue-and-commit front end for an [`AuditLog`]
pub struct BatchProcessor {
    inner: Arc<ProcessorInner>,
    timer: Mutex<Option<PeriodicTask>>,
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.inner.config)
            .field("queue_size", &self.inner.queue.len())
            .finish()
    }
}

impl BatchProcessor {
    /// Start a processor over `ledger`
    pub fn new(ledger: Arc<dyn AuditLog>, config: BatchConfig) -> Result<Self> {
        Self::start(ledger, config, None)
    }

    /// Start a processor that reports batch sizes and failures to `metrics`
    pub fn with_metrics(
        ledger: Arc<dyn AuditLog>,
        config: BatchConfig,
        metrics: Metrics,
    ) -> Result<Self> {
        Self::start(ledger, config, Some(metrics))
    }

    fn start(
        ledger: Arc<dyn AuditLog>,
        config: BatchConfig,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(ProcessorInner {
            ledger,
            queue: ArrayQueue::new(config.max_batch_size),
            validator: RwLock::new(BatchValidator::new()),
            committing: AtomicBool::new(false),
            scopes: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            metrics,
            config,
        });

        let timer = match inner.config.auto_commit_interval() {
            Some(interval) => {
                let weak: Weak<ProcessorInner> = Arc::downgrade(&inner);
                Some(PeriodicTask::spawn("audit-ledger-batch", interval, move || {
                    if let Some(inner) = weak.upgrade() {
                        if inner.suspended() {
                            return;
                        }
                        if let Err(e) = inner.commit_if_idle() {
                            tracing::error!(error = %e, "Timed batch commit failed");
                        }
                    }
                })?)
            }
            None => None,
        };

        tracing::info!(
            max_batch_size = inner.config.max_batch_size,
            auto_commit_threshold = inner.config.auto_commit_threshold,
            parallel = inner.config.parallel,
            "Batch processor started"
        );

        Ok(Self {
            inner,
            timer: Mutex::new(timer),
        })
    }

    /// Queue an operation.
    ///
    /// Returns the commit result when this push reached the auto-commit
    /// threshold, no other commit was running and no [`BatchScope`] is open.
    pub fn add_operation(&self, operation: BatchOperation) -> Result<Option<BatchResult>> {
        if let Err(op) = self.inner.queue.push(operation) {
            return Err(Error::Validation(format!(
                "Batch queue full ({} operations), rejected {}",
                self.inner.config.max_batch_size, op.operation_id
            )));
        }

        if !self.inner.suspended()
            && self.inner.queue.len() >= self.inner.config.auto_commit_threshold
        {
            return self.inner.commit_if_idle();
        }
        Ok(None)
    }

    /// Queue `data` with no metadata
    pub fn add_data(&self, data: Payload) -> Result<Option<BatchResult>> {
        self.add_operation(BatchOperation::new(data, Payload::new()))
    }

    /// Commit everything queued.
    ///
    /// Fails with a validation error when the queue is empty or another commit
    /// is running.
    pub fn process(&self) -> Result<BatchResult> {
        self.inner.commit()
    }

    /// Hold back threshold and timer commits until the returned scope ends.
    ///
    /// The queue stays bounded by `max_batch_size` while suspended. When the
    /// last open scope ends, everything queued is committed.
    pub fn scope(&self) -> BatchScope<'_> {
        self.inner.scopes.fetch_add(1, Ordering::AcqRel);
        BatchScope {
            processor: self,
            open: true,
        }
    }

    /// Add a pre-commit rule
    pub fn add_validation_rule<F>(&self, name: impl Into<String>, check: F)
    where
        F: Fn(&BatchOperation) -> bool + Send + Sync + 'static,
    {
        self.inner.validator.write().add_rule(name, check);
    }

    /// Counters
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            total_processed: self.inner.processed.load(Ordering::Relaxed),
            total_failed: self.inner.failed.load(Ordering::Relaxed),
            batches_committed: self.inner.batches.load(Ordering::Relaxed),
            queue_size: self.inner.queue.len(),
            commit_in_flight: self.inner.committing.load(Ordering::Acquire),
        }
    }

    /// Operations waiting in the queue
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Stop the timer and commit whatever is queued
    pub fn stop(&self) -> Result<Option<BatchResult>> {
        self.timer.lock().take();
        let flushed = self.inner.commit_if_idle()?;
        tracing::info!("Batch processor stopped");
        Ok(flushed)
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        self.timer.lock().take();
        match self.inner.commit_if_idle() {
            Ok(Some(result)) => {
                tracing::info!(flushed = result.total_operations, "Batch processor dropped")
            }
            Ok(None) => {}
            Err(e) => tracing::error!(
                error = %e,
                pending = self.inner.queue.len(),
                "Batch flush on drop failed"
            ),
        }
    }
}

/// Suspends automatic commits of a [`BatchProcessor`]; see
/// [`BatchProcessor::scope`]
#[must_use = "auto-commit resumes as soon as the scope is dropped"]
pub struct BatchScope<'a> {
    processor: &'a BatchProcessor,
    open: bool,
}

impl fmt::Debug for BatchScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchScope")
            .field("pending", &self.processor.pending())
            .field("open", &self.open)
            .finish()
    }
}

impl BatchScope<'_> {
    /// End the scope and return the commit it triggered, if any
    pub fn finish(mut self) -> Result<Option<BatchResult>> {
        self.close()
    }

    fn close(&mut self) -> Result<Option<BatchResult>> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(None);
        }
        let inner = &self.processor.inner;
        if inner.scopes.fetch_sub(1, Ordering::AcqRel) > 1 {
            // An outer scope still holds commits back
            return Ok(None);
        }
        inner.commit_if_idle()
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "Batch commit at end of scope failed");
        }
    }
}

impl ProcessorInner {
    fn suspended(&self) -> bool {
        self.scopes.load(Ordering::Acquire) > 0
    }

    fn commit(&self) -> Result<BatchResult> {
        if self
            .committing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Validation("Batch commit already in progress".to_string()));
        }
        let _guard = CommitGuard(&self.committing);

        let operations = self.drain();
        if operations.is_empty() {
            return Err(Error::Validation("No operations to commit".to_string()));
        }
        Ok(self.run(operations))
    }

    /// Commit unless the queue is empty or a commit is already running
    fn commit_if_idle(&self) -> Result<Option<BatchResult>> {
        if self.queue.is_empty() || self.committing.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.commit() {
            Ok(result) => Ok(Some(result)),
            // Lost the race to another committer, or it drained the queue first
            Err(Error::Validation(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn drain(&self) -> Vec<BatchOperation> {
        let mut operations = Vec::with_capacity(self.queue.len());
        while let Some(op) = self.queue.pop() {
            operations.push(op);
        }
        operations
    }

    fn run(&self, operations: Vec<BatchOperation>) -> BatchResult {
        let started = Instant::now();
        let total_operations = operations.len();

        let (accepted, mut failed_operations) = self.validator.read().validate(operations);
        let (successful_entries, failed) = if self.config.parallel {
            self.apply_parallel(accepted)
        } else {
            self.apply_sequential(accepted)
        };
        failed_operations.extend(failed);

        let result = BatchResult {
            successful_entries,
            failed_operations,
            total_operations,
            execution_time: started.elapsed(),
        };

        self.processed
            .fetch_add(result.success_count() as u64, Ordering::Relaxed);
        self.failed
            .fetch_add(result.failure_count() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_batch(total_operations, result.failure_count());
        }

        for (op, error) in &result.failed_operations {
            tracing::debug!(operation_id = %op.operation_id, error = %error, "Batch operation failed");
        }
        tracing::info!(
            total = total_operations,
            succeeded = result.success_count(),
            failed = result.failure_count(),
            elapsed_ms = result.execution_time.as_millis() as u64,
            "Batch committed"
        );

        result
    }

    fn apply(&self, op: &BatchOperation) -> Result<Entry> {
        self.ledger.append_with(
            op.data.clone(),
            op.append_options("batch_operation_id", &op.operation_id),
        )
    }

    fn apply_sequential(
        &self,
        operations: Vec<BatchOperation>,
    ) -> (Vec<Entry>, Vec<(BatchOperation, Error)>) {
        let mut entries = Vec::with_capacity(operations.len());
        let mut failures = Vec::new();

        for op in operations {
            match self.apply(&op) {
                Ok(entry) => entries.push(entry),
                Err(e) => failures.push((op, e)),
            }
        }

        (entries, failures)
    }

    fn apply_parallel(
        &self,
        operations: Vec<BatchOperation>,
    ) -> (Vec<Entry>, Vec<(BatchOperation, Error)>) {
        let workers = self.config.num_workers.min(operations.len()).max(1);
        let mut entries = Vec::with_capacity(operations.len());
        let mut failures = Vec::new();

        let (job_tx, job_rx) = channel::unbounded::<BatchOperation>();
        let (done_tx, done_rx) = channel::unbounded::<(BatchOperation, Result<Entry>)>();
        for op in operations {
            // Receiver is alive until the scope below ends
            let _ = job_tx.send(op);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for op in job_rx.iter() {
                        let outcome = self.apply(&op);
                        let _ = done_tx.send((op, outcome));
                    }
                });
            }
            drop(done_tx);

            for (op, outcome) in done_rx.iter() {
                match outcome {
                    Ok(entry) => entries.push(entry),
                    Err(e) => failures.push((op, e)),
                }
            }
        });

        (entries, failures)
    }
}

/// Lifecycle of a [`TransactionalBatch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations
    Open,
    /// Every staged operation was appended
    Committed {
        /// Entries appended
        entries: usize,
    },
    /// Discarded before commit
    Aborted,
    /// An append failed part way; `applied` entries remain in the chain
    Failed {
        /// Entries appended before the failure
        applied: Vec<EntryId>,
        /// The failing append's error
        error: String,
    },
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Open => write!(f, "open"),
            TransactionState::Committed { .. } => write!(f, "committed"),
            TransactionState::Aborted => write!(f, "aborted"),
            TransactionState::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// Operations appended together under one transaction id
pub struct TransactionalBatch {
    transaction_id: String,
    ledger: Arc<dyn AuditLog>,
    staged: Vec<BatchOperation>,
    state: TransactionState,
}

impl fmt::Debug for TransactionalBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalBatch")
            .field("transaction_id", &self.transaction_id)
            .field("staged", &self.staged.len())
            .field("state", &self.state)
            .finish()
    }
}

impl TransactionalBatch {
    /// Open a transaction
    pub fn new(ledger: Arc<dyn AuditLog>) -> Self {
        Self {
            transaction_id: format!("txn_{}", Uuid::new_v4()),
            ledger,
            staged: Vec::new(),
            state: TransactionState::Open,
        }
    }

    /// Transaction id written to every entry's metadata
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Current state
    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    /// Staged operations
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Nothing staged
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TransactionState::Open => Ok(()),
            ref state => Err(Error::Validation(format!(
                "Transaction {} is {}",
                self.transaction_id, state
            ))),
        }
    }

    /// Stage an operation; nothing is appended until [`commit`](Self::commit)
    pub fn stage(&mut self, data: Payload, metadata: Payload) -> Result<&BatchOperation> {
        self.ensure_open()?;
        self.staged.push(BatchOperation::new(data, metadata));
        Ok(&self.staged[self.staged.len() - 1])
    }

    /// Append every staged operation in order.
    ///
    /// Stops at the first failure, records the entries already appended in
    /// [`TransactionState::Failed`] and returns a storage error.
    pub fn commit(&mut self) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        if self.staged.is_empty() {
            return Err(Error::Validation(format!(
                "Transaction {} has no staged operations",
                self.transaction_id
            )));
        }

        let staged = std::mem::take(&mut self.staged);
        let total = staged.len();
        let mut entries = Vec::with_capacity(total);

        for op in &staged {
            let appended = self.ledger.append_with(
                op.data.clone(),
                op.append_options("transaction_id", &self.transaction_id),
            );

            match appended {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    let applied: Vec<EntryId> = entries.iter().map(|entry| entry.id).collect();
                    tracing::warn!(
                        transaction_id = %self.transaction_id,
                        operation_id = %op.operation_id,
                        applied = applied.len(),
                        total,
                        error = %e,
                        "Transaction failed; appended entries remain in the chain"
                    );

                    let message = format!(
                        "Transaction {} failed after {} of {} operations: {}",
                        self.transaction_id,
                        applied.len(),
                        total,
                        e
                    );
                    self.state = TransactionState::Failed {
                        applied,
                        error: e.to_string(),
                    };
                    return Err(Error::storage("transaction_commit", "ledger", message));
                }
            }
        }

        self.state = TransactionState::Committed {
            entries: entries.len(),
        };
        tracing::info!(
            transaction_id = %self.transaction_id,
            entries = entries.len(),
            "Transaction committed"
        );
        Ok(entries)
    }

    /// Discard staged operations
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.staged.clear();
        self.state = TransactionState::Aborted;
        tracing::debug!(transaction_id = %self.transaction_id, "Transaction aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{types::EntryFilter, Config, Ledger};
    use serde_json::json;

    fn payload(i: usize) -> Payload {
        let mut data = Payload::new();
        data.insert("i".to_string(), json!(i));
        data
    }

    fn test_ledger() -> Arc<Ledger> {
        Arc::new(
            Ledger::in_memory(Config {
                auto_verify: false,
                ..Config::default()
            })
            .unwrap(),
        )
    }

    fn manual_config() -> BatchConfig {
        BatchConfig {
            max_batch_size: 100,
            auto_commit_threshold: 100,
            auto_commit_interval_ms: 0,
            ..BatchConfig::default()
        }
    }

    #[test]
    fn test_sequential_commit_isolates_failures() {
        let ledger = test_ledger();
        let processor = BatchProcessor::new(ledger.clone(), manual_config()).unwrap();

        processor.add_data(payload(0)).unwrap();
        processor.add_data(Payload::new()).unwrap();
        processor.add_data(payload(2)).unwrap();

        let result = processor.process().unwrap();
        assert_eq!(result.total_operations, 3);
        assert_eq!(result.success_count(), 2);
        assert_eq!(result.failure_count(), 1);
        assert!(matches!(result.failed_operations[0].1, Error::Validation(_)));
        assert!((result.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        // Submission order is kept sequentially
        assert_eq!(result.successful_entries[0].data["i"], json!(0));
        assert_eq!(result.successful_entries[1].data["i"], json!(2));
        assert!(result.successful_entries[0].metadata.contains_key("batch_operation_id"));

        let stats = processor.stats();
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.queue_size, 0);
    }

    #[test]
    fn test_parallel_commit_keeps_chain_valid() {
        let ledger = test_ledger();
        let config = BatchConfig {
            parallel: true,
            num_workers: 4,
            ..manual_config()
        };
        let processor = BatchProcessor::new(ledger.clone(), config).unwrap();

        for i in 0..50 {
            processor.add_data(payload(i)).unwrap();
        }
        let result = processor.process().unwrap();
        assert_eq!(result.success_count(), 50);

        let mut seen: Vec<u64> = result
            .successful_entries
            .iter()
            .map(|e| e.data["i"].as_u64().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());

        assert_eq!(ledger.verify_integrity(None, None).unwrap().entries_checked, 50);
    }

    #[test]
    fn test_queue_full() {
        let config = BatchConfig {
            max_batch_size: 2,
            auto_commit_threshold: 2,
            ..manual_config()
        };
        let ledger = test_ledger();
        let processor = BatchProcessor::new(ledger, config).unwrap();

        // Hold the commit flag so the threshold cannot drain the queue
        processor.inner.committing.store(true, Ordering::Release);
        assert!(processor.add_data(payload(0)).unwrap().is_none());
        assert!(processor.add_data(payload(1)).unwrap().is_none());
        assert!(matches!(processor.add_data(payload(2)), Err(Error::Validation(_))));

        assert!(matches!(processor.process(), Err(Error::Validation(_))));
        assert!(processor.stats().commit_in_flight);
    }

    #[test]
    fn test_empty_commit_rejected() {
        let processor = BatchProcessor::new(test_ledger(), manual_config()).unwrap();
        assert!(matches!(processor.process(), Err(Error::Validation(_))));
        assert!(!processor.stats().commit_in_flight);
    }

    #[test]
    fn test_auto_commit_at_threshold() {
        let config = BatchConfig {
            auto_commit_threshold: 3,
            ..manual_config()
        };
        let processor = BatchProcessor::new(test_ledger(), config).unwrap();

        assert!(processor.add_data(payload(0)).unwrap().is_none());
        assert!(processor.add_data(payload(1)).unwrap().is_none());
        let result = processor.add_data(payload(2)).unwrap().unwrap();
        assert_eq!(result.total_operations, 3);
        assert_eq!(processor.pending(), 0);
    }

    #[test]
    fn test_timer_commits_pending() {
        let ledger = test_ledger();
        let config = BatchConfig {
            auto_commit_interval_ms: 20,
            ..manual_config()
        };
        let processor = BatchProcessor::new(ledger.clone(), config).unwrap();

        processor.add_data(payload(0)).unwrap();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(processor.pending(), 0);
        assert_eq!(ledger.get_entries(&EntryFilter::all()).unwrap().len(), 1);
    }

    #[test]
    fn test_stop_flushes() {
        let ledger = test_ledger();
        let processor = BatchProcessor::new(ledger.clone(), manual_config()).unwrap();
        processor.add_data(payload(0)).unwrap();

        let flushed = processor.stop().unwrap().unwrap();
        assert_eq!(flushed.success_count(), 1);
        assert!(processor.stop().unwrap().is_none());
    }

    #[test]
    fn test_drop_flushes_queued_operations() {
        let ledger = test_ledger();
        let processor = BatchProcessor::new(ledger.clone(), manual_config()).unwrap();
        for i in 0..5 {
            processor.add_data(payload(i)).unwrap();
        }
        assert_eq!(ledger.get_stats().unwrap().total_entries, 0);

        drop(processor);

        assert_eq!(ledger.get_stats().unwrap().total_entries, 5);
        assert!(ledger.verify_integrity(None, None).is_ok());
    }

    #[test]
    fn test_scope_holds_threshold_commit() {
        let ledger = test_ledger();
        let config = BatchConfig {
            max_batch_size: 10,
            auto_commit_threshold: 2,
            ..manual_config()
        };
        let processor = BatchProcessor::new(ledger.clone(), config).unwrap();

        let scope = processor.scope();
        for i in 0..5 {
            assert!(processor.add_data(payload(i)).unwrap().is_none());
        }
        assert_eq!(processor.pending(), 5);
        assert_eq!(ledger.get_stats().unwrap().total_entries, 0);

        let result = scope.finish().unwrap().unwrap();
        assert_eq!(result.success_count(), 5);
        assert_eq!(processor.pending(), 0);

        // Threshold commits are back once the scope has ended
        assert!(processor.add_data(payload(5)).unwrap().is_none());
        assert!(processor.add_data(payload(6)).unwrap().is_some());
    }

    #[test]
    fn test_nested_scopes_commit_once() {
        let ledger = test_ledger();
        let config = BatchConfig {
            auto_commit_threshold: 1,
            ..manual_config()
        };
        let processor = BatchProcessor::new(ledger.clone(), config).unwrap();

        {
            let _outer = processor.scope();
            processor.add_data(payload(0)).unwrap();
            {
                let _inner = processor.scope();
                processor.add_data(payload(1)).unwrap();
            }
            // Inner scope ended but the outer one still holds the commit
            assert_eq!(processor.pending(), 2);
        }

        assert_eq!(processor.pending(), 0);
        assert_eq!(processor.stats().batches_committed, 1);
        assert_eq!(ledger.get_stats().unwrap().total_entries, 2);
    }

    #[test]
    fn test_scope_holds_timer_commit() {
        let ledger = test_ledger();
        let config = BatchConfig {
            auto_commit_interval_ms: 10,
            ..manual_config()
        };
        let processor = BatchProcessor::new(ledger.clone(), config).unwrap();

        let scope = processor.scope();
        processor.add_data(payload(0)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(processor.pending(), 1);

        // Either the scope's own commit or the next tick picks it up
        drop(scope);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(processor.pending(), 0);
        assert_eq!(ledger.get_stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_validation_rules() {
        let processor = BatchProcessor::new(test_ledger(), manual_config()).unwrap();
        processor.add_validation_rule("even_only", |op| {
            op.data["i"].as_u64().map_or(false, |i| i % 2 == 0)
        });

        for i in 0..4 {
            processor.add_data(payload(i)).unwrap();
        }
        let result = processor.process().unwrap();
        assert_eq!(result.success_count(), 2);
        assert_eq!(result.failure_count(), 2);
        assert!(result.failed_operations[0].1.to_string().contains("even_only"));
    }

    #[test]
    fn test_batch_metrics() {
        let ledger = test_ledger();
        let metrics = ledger.metrics().clone();
        let processor =
            BatchProcessor::with_metrics(ledger.clone(), manual_config(), metrics.clone()).unwrap();

        processor.add_data(payload(0)).unwrap();
        processor.add_data(Payload::new()).unwrap();
        processor.process().unwrap();

        assert_eq!(metrics.batch_failures.get(), 1);
        assert_eq!(metrics.batch_size.get_sample_count(), 1);
    }

    #[test]
    fn test_transaction_commit() {
        let ledger = test_ledger();
        let mut txn = TransactionalBatch::new(ledger.clone());
        txn.stage(payload(0), Payload::new()).unwrap();
        txn.stage(payload(1), Payload::new()).unwrap();
        assert_eq!(txn.len(), 2);

        // Nothing is appended while staging
        assert_eq!(ledger.get_stats().unwrap().total_entries, 0);

        let entries = txn.commit().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(*txn.state(), TransactionState::Committed { entries: 2 });
        assert_eq!(
            entries[0].metadata["transaction_id"],
            json!(txn.transaction_id())
        );

        assert!(matches!(txn.commit(), Err(Error::Validation(_))));
        assert!(matches!(
            txn.stage(payload(2), Payload::new()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_transaction_failure_records_applied() {
        let ledger = test_ledger();
        let mut txn = TransactionalBatch::new(ledger.clone());
        txn.stage(payload(0), Payload::new()).unwrap();
        txn.stage(Payload::new(), Payload::new()).unwrap();
        txn.stage(payload(2), Payload::new()).unwrap();

        let err = txn.commit().unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));

        match txn.state() {
            TransactionState::Failed { applied, .. } => {
                assert_eq!(applied.len(), 1);
                assert!(ledger.get_entry(&applied[0]).unwrap().is_some());
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(ledger.get_stats().unwrap().total_entries, 1);
    }

    #[test]
    fn test_transaction_abort() {
        let ledger = test_ledger();
        let mut txn = TransactionalBatch::new(ledger.clone());
        assert!(matches!(txn.commit(), Err(Error::Validation(_))));

        txn.stage(payload(0), Payload::new()).unwrap();
        txn.abort().unwrap();
        assert_eq!(*txn.state(), TransactionState::Aborted);
        assert!(txn.is_empty());
        assert!(txn.abort().is_err());
        assert_eq!(ledger.get_stats().unwrap().total_entries, 0);
    }
}
