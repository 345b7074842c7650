//! Audit Ledger
//!
//! Append-only audit log with hash chaining, optional signatures and Merkle
//! inclusion proofs.
//!
//! # Architecture
//!
//! - **Hash chain**: every entry stores the hash of its predecessor
//! - **Single writer**: appends are serialized under one write lock
//! - **Merkle tree**: inclusion proofs without walking the chain
//! - **Cache layer**: entry, range and query caches behind [`CachedLedger`]
//! - **Batching**: queued appends committed sequentially or on a worker pool
//!
//! # Invariants
//!
//! - Exactly one genesis entry, first in storage order
//! - Each `previous_hash` equals the predecessor's `hash`
//! - `hash` recomputes bit-for-bit from the other fields
//! - Entries are never modified or deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod batch;
pub mod cache;
pub mod cached;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hashing;
pub mod ledger;
pub mod merkle;
pub mod metrics;
pub mod storage;
pub mod task;
pub mod types;
pub mod verify;

// Re-exports
pub use batch::{
    BatchOperation, BatchProcessor, BatchResult, BatchScope, TransactionState, TransactionalBatch,
};
pub use cached::CachedLedger;
pub use config::{BatchConfig, CacheConfig, Config};
pub use crypto::{Ed25519Signer, MultiSigner, Signer};
pub use error::{Error, IntegrityViolation, Result, ViolationKind};
pub use hashing::{CanonicalHasher, HashAlgorithm, HexDigest};
pub use ledger::{AppendOptions, AuditLog, Ledger, SubscriptionId};
pub use merkle::{IncrementalMerkleTree, MerkleProof, MerkleTree};
pub use storage::{MemoryBackend, StorageBackend};
pub use types::{Entry, EntryFilter, EntryId, LedgerStats, Payload};
pub use verify::{IntegrityVerifier, VerificationReport};
