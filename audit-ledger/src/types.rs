//! Core types for the ledger
//!
//! An [`Entry`] is immutable once sealed: the ledger hands out clones, and a
//! modified clone no longer matches its own `hash`.

use crate::hashing::{HashAlgorithm, HexDigest};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Entry identifier (UUIDv7 for time-ordering)
pub type EntryId = Uuid;

/// String-keyed domain payload. Keys iterate in sorted order.
pub type Payload = Map<String, Value>;

/// Render a timestamp the way it is hashed
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique entry ID, never reused
    pub id: EntryId,

    /// Position in the chain (genesis = 0)
    pub sequence: u64,

    /// Creation time, recorded at the moment of hashing
    pub timestamp: DateTime<Utc>,

    /// Domain payload (never empty)
    pub data: Payload,

    /// Digest over every other field except `signature`
    pub hash: HexDigest,

    /// Hash of the preceding entry (`None` only for genesis)
    pub previous_hash: Option<HexDigest>,

    /// Signature over the raw hash bytes
    #[serde(default)]
    pub signature: Option<String>,

    /// Auxiliary metadata (hashed, otherwise opaque)
    #[serde(default)]
    pub metadata: Payload,

    /// Reserved for proof-of-work style extensions
    #[serde(default)]
    pub nonce: u64,
}

impl Entry {
    /// Fields covered by the hash, as a JSON object
    pub fn hash_input(&self) -> Value {
        hash_input(
            &self.id,
            self.sequence,
            &self.timestamp,
            &self.data,
            self.previous_hash.as_ref(),
            &self.metadata,
            self.nonce,
        )
    }

    /// Is this the genesis entry
    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_none()
    }

    /// Approximate serialized size (bytes)
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Compact binary size (bincode encoding)
    pub fn encoded_len(&self) -> Result<u64> {
        Ok(bincode::serialized_size(self)?)
    }

    /// Does `data` contain every key/value pair in `criteria`
    pub fn matches(&self, criteria: &Payload) -> bool {
        criteria
            .iter()
            .all(|(key, expected)| self.data.get(key) == Some(expected))
    }
}

fn hash_input(
    id: &EntryId,
    sequence: u64,
    timestamp: &DateTime<Utc>,
    data: &Payload,
    previous_hash: Option<&HexDigest>,
    metadata: &Payload,
    nonce: u64,
) -> Value {
    json!({
        "id": id.to_string(),
        "sequence": sequence,
        "timestamp": format_timestamp(timestamp),
        "data": Value::Object(data.clone()),
        "previous_hash": previous_hash.map(HexDigest::as_str),
        "metadata": Value::Object(metadata.clone()),
        "nonce": nonce,
    })
}

/// Entry that has been linked but not yet hashed or signed
#[derive(Debug, Clone)]
pub struct PendingEntry {
    id: EntryId,
    sequence: u64,
    timestamp: DateTime<Utc>,
    data: Payload,
    previous_hash: Option<HexDigest>,
    metadata: Payload,
    nonce: u64,
}

impl PendingEntry {
    /// Link new content after `previous` (or as genesis)
    pub fn new(data: Payload, metadata: Payload, previous: Option<&Entry>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Validation("Entry data cannot be empty".to_string()));
        }

        Ok(Self {
            id: Uuid::now_v7(),
            sequence: previous.map(|p| p.sequence + 1).unwrap_or(0),
            // Hashing renders microseconds; store exactly what is hashed
            timestamp: Utc::now().trunc_subsecs(6),
            data,
            previous_hash: previous.map(|p| p.hash.clone()),
            metadata,
            nonce: 0,
        })
    }

    /// Entry ID assigned at creation
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Sequence assigned at creation
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Link to the predecessor
    pub fn previous_hash(&self) -> Option<&HexDigest> {
        self.previous_hash.as_ref()
    }

    /// Fields covered by the hash
    pub fn hash_input(&self) -> Value {
        hash_input(
            &self.id,
            self.sequence,
            &self.timestamp,
            &self.data,
            self.previous_hash.as_ref(),
            &self.metadata,
            self.nonce,
        )
    }

    /// Attach hash and signature, producing the immutable entry
    pub fn seal(self, hash: HexDigest, signature: Option<String>) -> Entry {
        Entry {
            id: self.id,
            sequence: self.sequence,
            timestamp: self.timestamp,
            data: self.data,
            hash,
            previous_hash: self.previous_hash,
            signature,
            metadata: self.metadata,
            nonce: self.nonce,
        }
    }
}

/// Time/offset window for range reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    /// Inclusive lower bound on timestamp
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on timestamp
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum entries returned
    pub limit: Option<usize>,
    /// Entries skipped (in storage order) before filtering
    pub offset: usize,
}

impl EntryFilter {
    /// Every entry
    pub fn all() -> Self {
        Self::default()
    }

    /// Entries at or after `start`
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Entries at or before `end`
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` stored entries
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Does the entry fall inside the time window
    pub fn contains(&self, entry: &Entry) -> bool {
        if let Some(start) = self.start_time {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if entry.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// Outcome of the most recent integrity verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStatus {
    /// Whether the chain verified
    pub verified: bool,
    /// When the run finished
    pub checked_at: DateTime<Utc>,
    /// Entries checked before stopping
    pub entries_checked: u64,
}

/// Ledger statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Total entries
    pub total_entries: u64,
    /// Timestamp of the genesis entry
    pub first_entry_time: Option<DateTime<Utc>>,
    /// Timestamp of the latest entry
    pub last_entry_time: Option<DateTime<Utc>>,
    /// Approximate storage size
    pub total_size_bytes: u64,
    /// Chain digest algorithm
    pub hash_algorithm: HashAlgorithm,
    /// Result of the last verification run (true when never run)
    pub integrity_verified: bool,
    /// When the last verification run finished
    pub last_verification_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, Value)]) -> Payload {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_empty_data_rejected() {
        let err = PendingEntry::new(Payload::new(), Payload::new(), None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_genesis_linking() {
        let pending =
            PendingEntry::new(payload(&[("event", json!("login"))]), Payload::new(), None)
                .unwrap();
        assert_eq!(pending.sequence(), 0);
        assert!(pending.previous_hash().is_none());

        let genesis = pending.seal(HashAlgorithm::Sha256.hex_digest(b"g"), None);
        assert!(genesis.is_genesis());

        let next = PendingEntry::new(
            payload(&[("event", json!("logout"))]),
            Payload::new(),
            Some(&genesis),
        )
        .unwrap();
        assert_eq!(next.sequence(), 1);
        assert_eq!(next.previous_hash(), Some(&genesis.hash));
    }

    #[test]
    fn test_hash_input_excludes_hash_and_signature() {
        let pending =
            PendingEntry::new(payload(&[("k", json!(1))]), Payload::new(), None).unwrap();
        let input = pending.hash_input();
        let entry = pending.seal(
            HashAlgorithm::Sha256.hex_digest(b"x"),
            Some("sig".to_string()),
        );
        assert_eq!(entry.hash_input(), input);
        let obj = input.as_object().unwrap();
        assert!(!obj.contains_key("hash"));
        assert!(!obj.contains_key("signature"));
        assert_eq!(obj["nonce"], json!(0));
    }

    #[test]
    fn test_matches_criteria() {
        let entry = PendingEntry::new(
            payload(&[("event", json!("transfer")), ("amount", json!(100))]),
            Payload::new(),
            None,
        )
        .unwrap()
        .seal(HashAlgorithm::Sha256.hex_digest(b"x"), None);

        assert!(entry.matches(&payload(&[("event", json!("transfer"))])));
        assert!(entry.matches(&Payload::new()));
        assert!(!entry.matches(&payload(&[("amount", json!(101))])));
    }

    #[test]
    fn test_filter_time_window() {
        let entry = PendingEntry::new(payload(&[("k", json!(1))]), Payload::new(), None)
            .unwrap()
            .seal(HashAlgorithm::Sha256.hex_digest(b"x"), None);

        let before = entry.timestamp - chrono::Duration::seconds(1);
        let after = entry.timestamp + chrono::Duration::seconds(1);

        assert!(EntryFilter::all().since(before).until(after).contains(&entry));
        assert!(!EntryFilter::all().since(after).contains(&entry));
        assert!(!EntryFilter::all().until(before).contains(&entry));
    }
}
