//! Integrity verification
//!
//! Walks the chain in storage order and checks, for every entry:
//! 1. `previous_hash` equals the running hash of its predecessor
//! 2. the stored hash equals the freshly computed one
//! 3. `sequence` follows its predecessor's
//!
//! The first failed check stops the walk with [`Error::Integrity`].

use crate::{
    error::{Error, Result, ViolationKind},
    hashing::{CanonicalHasher, HexDigest},
    storage::StorageBackend,
    types::{Entry, EntryFilter, EntryId},
};
use chrono::{DateTime, Utc};
use std::time::Instant;

/// Entries fetched per storage call
const PAGE_SIZE: usize = 1000;

/// Successful verification summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    /// Entries whose link and hash were checked
    pub entries_checked: u64,
    /// First checked entry
    pub first_entry: Option<EntryId>,
    /// Last checked entry
    pub last_entry: Option<EntryId>,
    /// Hash of the last checked entry
    pub head_hash: Option<HexDigest>,
    /// When the run finished
    pub completed_at: DateTime<Utc>,
}

/// Chain walker
#[derive(Debug, Clone, Copy)]
pub struct IntegrityVerifier {
    hasher: CanonicalHasher,
}

struct Cursor {
    previous_hash: Option<HexDigest>,
    next_sequence: u64,
}

impl Cursor {
    fn advance(&mut self, entry: &Entry) {
        self.previous_hash = Some(entry.hash.clone());
        self.next_sequence = entry.sequence + 1;
    }
}

impl IntegrityVerifier {
    /// Create a verifier using the chain's hasher
    pub fn new(hasher: CanonicalHasher) -> Self {
        Self { hasher }
    }

    /// Verify the whole chain, or the part between two entries (inclusive).
    ///
    /// When `start` is given, links before it are replayed (not checked) so
    /// the first checked entry is still compared with its true predecessor.
    ///
    /// The walk only stops at `end` if it reaches `end` after `start`. An
    /// `end` that comes before `start` in the chain is never met, so the walk
    /// continues to the head.
    pub fn verify(
        &self,
        backend: &dyn StorageBackend,
        start: Option<&EntryId>,
        end: Option<&EntryId>,
    ) -> Result<VerificationReport> {
        for id in [start, end].into_iter().flatten() {
            if backend.get_entry(id)?.is_none() {
                return Err(Error::NotFound(id.to_string()));
            }
        }

        let started_at = Instant::now();
        tracing::info!(backend = backend.name(), "Starting integrity verification");

        let mut cursor = Cursor {
            previous_hash: None,
            next_sequence: 0,
        };
        let mut checking = start.is_none();
        let mut report = VerificationReport {
            entries_checked: 0,
            first_entry: None,
            last_entry: None,
            head_hash: None,
            completed_at: Utc::now(),
        };
        let mut offset = 0;

        'walk: loop {
            let page = backend.get_entries(&EntryFilter::all().offset(offset).limit(PAGE_SIZE))?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            for entry in &page {
                if !checking {
                    if Some(&entry.id) != start {
                        cursor.advance(entry);
                        continue;
                    }
                    checking = true;
                }

                self.check_entry(entry, &cursor)?;
                cursor.advance(entry);

                report.entries_checked += 1;
                report.first_entry.get_or_insert(entry.id);
                report.last_entry = Some(entry.id);
                report.head_hash = Some(entry.hash.clone());

                if Some(&entry.id) == end {
                    break 'walk;
                }
            }
        }

        if let (Some(id), false) = (start, checking) {
            // Present by id but never reached in storage order
            return Err(Error::NotFound(id.to_string()));
        }

        report.completed_at = Utc::now();
        tracing::info!(
            entries = report.entries_checked,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Integrity verification complete"
        );
        Ok(report)
    }

    fn check_entry(&self, entry: &Entry, cursor: &Cursor) -> Result<()> {
        if entry.previous_hash != cursor.previous_hash {
            return Err(Error::integrity(
                ViolationKind::BrokenLink,
                entry.id.to_string(),
                cursor.previous_hash.as_ref().map(ToString::to_string),
                entry.previous_hash.as_ref().map(ToString::to_string),
            ));
        }

        let calculated = self.hasher.calculate_hash(entry);
        if calculated != entry.hash {
            return Err(Error::integrity(
                ViolationKind::HashMismatch,
                entry.id.to_string(),
                Some(calculated.to_string()),
                Some(entry.hash.to_string()),
            ));
        }

        if entry.sequence != cursor.next_sequence {
            return Err(Error::integrity(
                ViolationKind::SequenceGap,
                entry.id.to_string(),
                Some(cursor.next_sequence.to_string()),
                Some(entry.sequence.to_string()),
            ));
        }

        Ok(())
    }

    /// Check one entry in isolation.
    ///
    /// True when its hash recomputes and, unless it is genesis, some earlier
    /// entry carries the hash it links to.
    pub fn verify_entry(&self, backend: &dyn StorageBackend, entry: &Entry) -> Result<bool> {
        if !self.hasher.verify_hash(entry, &entry.hash) {
            return Ok(false);
        }

        let Some(previous_hash) = &entry.previous_hash else {
            return Ok(true);
        };

        let earlier = backend.get_entries(&EntryFilter::all().until(entry.timestamp))?;
        Ok(earlier
            .iter()
            .any(|e| e.id != entry.id && e.hash == *previous_hash))
    }
}
