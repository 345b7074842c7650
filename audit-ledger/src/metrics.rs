//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring a ledger.
//! Each ledger owns its own [`Registry`], so several ledgers can live in one
//! process without name clashes.
//!
//! # Metrics
//!
//! - `audit_ledger_entries_total` - Total number of entries appended
//! - `audit_ledger_append_duration_seconds` - Histogram of append latencies
//! - `audit_ledger_verifications_total` - Integrity verification runs
//! - `audit_ledger_integrity_failures_total` - Runs that detected tampering
//! - `audit_ledger_batch_size` - Histogram of committed batch sizes
//! - `audit_ledger_batch_failures_total` - Failed batch operations
//! - `audit_ledger_storage_size_bytes` - Storage size estimate

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Total entries appended
    pub entries_total: IntCounter,

    /// Append duration histogram
    pub append_duration: Histogram,

    /// Integrity verification runs
    pub verifications_total: IntCounter,

    /// Verification runs that failed with an integrity violation
    pub integrity_failures: IntCounter,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Failed batch operations
    pub batch_failures: IntCounter,

    /// Storage size estimate
    pub storage_size: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total = IntCounter::new(
            "audit_ledger_entries_total",
            "Total number of entries appended",
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new(
                "audit_ledger_append_duration_seconds",
                "Histogram of append latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0]),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let verifications_total = IntCounter::new(
            "audit_ledger_verifications_total",
            "Integrity verification runs",
        )?;
        registry.register(Box::new(verifications_total.clone()))?;

        let integrity_failures = IntCounter::new(
            "audit_ledger_integrity_failures_total",
            "Verification runs that detected tampering",
        )?;
        registry.register(Box::new(integrity_failures.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("audit_ledger_batch_size", "Histogram of committed batch sizes")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let batch_failures = IntCounter::new(
            "audit_ledger_batch_failures_total",
            "Failed batch operations",
        )?;
        registry.register(Box::new(batch_failures.clone()))?;

        let storage_size = IntGauge::new(
            "audit_ledger_storage_size_bytes",
            "Storage size estimate",
        )?;
        registry.register(Box::new(storage_size.clone()))?;

        Ok(Self {
            entries_total,
            append_duration,
            verifications_total,
            integrity_failures,
            batch_size,
            batch_failures,
            storage_size,
            registry,
        })
    }

    /// Record entry append
    pub fn record_append(&self, duration_seconds: f64) {
        self.entries_total.inc();
        self.append_duration.observe(duration_seconds);
    }

    /// Record a verification run
    pub fn record_verification(&self, integrity_ok: bool) {
        self.verifications_total.inc();
        if !integrity_ok {
            self.integrity_failures.inc();
        }
    }

    /// Record a batch commit
    pub fn record_batch(&self, batch_size: usize, failures: usize) {
        self.batch_size.observe(batch_size as f64);
        self.batch_failures.inc_by(failures as u64);
    }

    /// Update storage size estimate
    pub fn update_storage_size(&self, size_bytes: u64) {
        self.storage_size
            .set(i64::try_from(size_bytes).unwrap_or(i64::MAX));
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.entries_total.get(), 0);
        assert_eq!(metrics.verifications_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_append(0.001);
        assert_eq!(a.entries_total.get(), 1);
        assert_eq!(b.entries_total.get(), 0);
    }

    #[test]
    fn test_record_verification() {
        let metrics = Metrics::new().unwrap();
        metrics.record_verification(true);
        metrics.record_verification(false);
        assert_eq!(metrics.verifications_total.get(), 2);
        assert_eq!(metrics.integrity_failures.get(), 1);
    }

    #[test]
    fn test_record_batch() {
        let metrics = Metrics::new().unwrap();
        metrics.record_batch(10, 2);
        metrics.record_batch(5, 0);
        assert_eq!(metrics.batch_failures.get(), 2);
        assert_eq!(metrics.batch_size.get_sample_count(), 2);
    }

    #[test]
    fn test_update_storage_size() {
        let metrics = Metrics::new().unwrap();
        metrics.update_storage_size(1024 * 1024 * 100);
        assert_eq!(metrics.storage_size.get(), 1024 * 1024 * 100);
        assert!(!metrics.registry().gather().is_empty());
    }
}
