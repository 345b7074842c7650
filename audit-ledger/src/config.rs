//! Configuration for the ledger

use crate::hashing::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Digest algorithm, fixed for the lifetime of a chain
    pub hash_algorithm: HashAlgorithm,

    /// Sign every entry, not only those that request it
    pub enable_signatures: bool,

    /// Run integrity verification periodically in the background
    pub auto_verify: bool,

    /// Background verification interval (seconds)
    pub verify_interval_secs: u64,

    /// Capacity of the ledger's recent-entries cache
    pub max_entries_memory: usize,

    /// Cache layer configuration
    pub cache: CacheConfig,

    /// Batch ingestion configuration
    pub batch: BatchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Sha256,
            enable_signatures: false,
            auto_verify: true,
            verify_interval_secs: 3600, // hourly
            max_entries_memory: 1000,
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Cache layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the single-entry cache
    pub enable_entry_cache: bool,

    /// Enable the range cache
    pub enable_range_cache: bool,

    /// Enable the query-result cache
    pub enable_query_cache: bool,

    /// Entry cache capacity (entries)
    pub entry_max_entries: usize,

    /// Entry cache capacity (MB of serialized entries)
    pub entry_max_size_mb: usize,

    /// Entry cache time-to-live (seconds)
    pub entry_ttl_secs: u64,

    /// Range cache capacity (ranges)
    pub max_ranges: usize,

    /// Query cache capacity (queries)
    pub max_queries: usize,

    /// Query cache time-to-live (seconds)
    pub query_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_entry_cache: true,
            enable_range_cache: true,
            enable_query_cache: true,
            entry_max_entries: 10_000,
            entry_max_size_mb: 100,
            entry_ttl_secs: 3600,
            max_ranges: 100,
            max_queries: 500,
            query_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    /// Entry cache TTL
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    /// Query cache TTL
    pub fn query_ttl(&self) -> Duration {
        Duration::from_secs(self.query_ttl_secs)
    }

    /// Entry cache size budget in bytes, saturating at `usize::MAX`
    pub fn entry_max_size_bytes(&self) -> usize {
        self.entry_max_size_mb.saturating_mul(BYTES_PER_MB)
    }

    /// Check the bounds of every enabled cache
    pub fn validate(&self) -> crate::Result<()> {
        if self.enable_entry_cache {
            if self.entry_max_entries == 0 || self.entry_max_size_mb == 0 {
                return Err(crate::Error::Validation(
                    "entry cache bounds must be positive".to_string(),
                ));
            }
            if self.entry_max_size_mb.checked_mul(BYTES_PER_MB).is_none() {
                return Err(crate::Error::Config(format!(
                    "cache.entry_max_size_mb too large: {}",
                    self.entry_max_size_mb
                )));
            }
        }
        if self.enable_range_cache && self.max_ranges == 0 {
            return Err(crate::Error::Validation(
                "cache.max_ranges must be positive".to_string(),
            ));
        }
        if self.enable_query_cache && self.max_queries == 0 {
            return Err(crate::Error::Validation(
                "cache.max_queries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batch ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum queued operations
    pub max_batch_size: usize,

    /// Queue length that triggers an automatic commit
    pub auto_commit_threshold: usize,

    /// Timer-driven commit interval (milliseconds, 0 disables the timer)
    pub auto_commit_interval_ms: u64,

    /// Process commits on a worker pool
    pub parallel: bool,

    /// Worker pool size
    pub num_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            auto_commit_threshold: 100,
            auto_commit_interval_ms: 5000,
            parallel: false,
            num_workers: 4,
        }
    }
}

impl BatchConfig {
    /// Auto-commit interval, if the timer is enabled
    pub fn auto_commit_interval(&self) -> Option<Duration> {
        (self.auto_commit_interval_ms > 0).then(|| Duration::from_millis(self.auto_commit_interval_ms))
    }

    /// Check internal consistency
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_batch_size == 0 {
            return Err(crate::Error::Validation(
                "batch.max_batch_size must be positive".to_string(),
            ));
        }
        if self.auto_commit_threshold == 0 || self.auto_commit_threshold > self.max_batch_size {
            return Err(crate::Error::Validation(format!(
                "batch.auto_commit_threshold must be in 1..={}",
                self.max_batch_size
            )));
        }
        if self.num_workers == 0 {
            return Err(crate::Error::Validation(
                "batch.num_workers must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(algorithm) = std::env::var("AUDIT_LEDGER_HASH_ALGORITHM") {
            config.hash_algorithm = algorithm.parse()?;
        }

        if let Ok(flag) = std::env::var("AUDIT_LEDGER_ENABLE_SIGNATURES") {
            config.enable_signatures = parse_flag("AUDIT_LEDGER_ENABLE_SIGNATURES", &flag)?;
        }

        if let Ok(flag) = std::env::var("AUDIT_LEDGER_AUTO_VERIFY") {
            config.auto_verify = parse_flag("AUDIT_LEDGER_AUTO_VERIFY", &flag)?;
        }

        if let Ok(secs) = std::env::var("AUDIT_LEDGER_VERIFY_INTERVAL_SECS") {
            config.verify_interval_secs = secs.parse().map_err(|_| {
                crate::Error::Validation(format!(
                    "AUDIT_LEDGER_VERIFY_INTERVAL_SECS is not a number: {}",
                    secs
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration before a ledger is built from it
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_entries_memory == 0 {
            return Err(crate::Error::Validation(
                "max_entries_memory must be positive".to_string(),
            ));
        }
        if self.auto_verify && self.verify_interval_secs == 0 {
            return Err(crate::Error::Validation(
                "verify_interval_secs must be positive when auto_verify is on".to_string(),
            ));
        }
        self.cache.validate()?;
        self.batch.validate()
    }

    /// Background verification interval
    pub fn verify_interval(&self) -> Duration {
        Duration::from_secs(self.verify_interval_secs)
    }
}

fn parse_flag(name: &str, value: &str) -> crate::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(crate::Error::Validation(format!(
            "{} is not a boolean: {}",
            name, value
        ))),
    }
}
