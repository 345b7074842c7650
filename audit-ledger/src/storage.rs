//! Storage backends
//!
//! The ledger only talks to storage through [`StorageBackend`]. Entries are
//! stored in append order, which is also ascending timestamp and sequence
//! order. Backends never rewrite or delete entries.
//!
//! [`MemoryBackend`] is the in-process reference backend. Durable backends
//! implement the same trait outside this crate.

use crate::{
    error::{Error, Result},
    types::{Entry, EntryFilter, EntryId},
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage backend contract
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Backend identifier used in errors and logs
    fn name(&self) -> &str;

    /// Persist an entry at the tail. Fails on duplicate id.
    fn append_entry(&self, entry: &Entry) -> Result<()>;

    /// Entry by id
    fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>>;

    /// Entries in storage order, windowed by `filter`
    fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>>;

    /// Tail of the chain
    fn get_latest_entry(&self) -> Result<Option<Entry>>;

    /// Head of the chain (genesis)
    fn get_oldest_entry(&self) -> Result<Option<Entry>>;

    /// Total number of entries
    fn count_entries(&self) -> Result<u64>;

    /// Approximate storage size in bytes
    fn get_size(&self) -> Result<u64>;

    /// Release resources; later calls may fail
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Entry at a sequence position
    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Entry>> {
        let offset = usize::try_from(sequence)
            .map_err(|_| Error::Validation(format!("Sequence {} out of range", sequence)))?;
        Ok(self
            .get_entries(&EntryFilter::all().offset(offset).limit(1))?
            .into_iter()
            .next())
    }

    /// Entries with `start <= sequence <= end`
    fn get_range(&self, start: u64, end: u64) -> Result<Vec<Entry>> {
        if end < start {
            return Ok(Vec::new());
        }
        let offset = usize::try_from(start)
            .map_err(|_| Error::Validation(format!("Sequence {} out of range", start)))?;
        let len = usize::try_from((end - start).saturating_add(1)).unwrap_or(usize::MAX);
        self.get_entries(&EntryFilter::all().offset(offset).limit(len))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: Vec<Entry>,
    by_id: HashMap<EntryId, usize>,
    size_bytes: u64,
}

/// Thread-safe in-memory backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
    closed: AtomicBool,
}

impl MemoryBackend {
    /// Create empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a previously exported chain as-is.
    ///
    /// Entries are not re-validated; run the integrity verifier over the
    /// resulting ledger to audit them.
    pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Result<Self> {
        let backend = Self::new();
        for entry in entries {
            backend.append_entry(&entry)?;
        }
        Ok(backend)
    }

    /// Every stored entry, in order
    pub fn entries(&self) -> Result<Vec<Entry>> {
        self.ensure_open("entries")?;
        Ok(self.state.read().entries.clone())
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::storage(
                operation,
                self.name(),
                "backend unavailable (closed)",
            ));
        }
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "MemoryBackend"
    }

    fn append_entry(&self, entry: &Entry) -> Result<()> {
        self.ensure_open("append")?;

        let mut state = self.state.write();
        if state.by_id.contains_key(&entry.id) {
            return Err(Error::storage(
                "append",
                self.name(),
                format!("Entry {} already exists", entry.id),
            ));
        }

        let position = state.entries.len();
        state.by_id.insert(entry.id, position);
        state.size_bytes += entry.size_bytes() as u64;
        state.entries.push(entry.clone());

        tracing::trace!(entry_id = %entry.id, sequence = entry.sequence, "Entry stored");
        Ok(())
    }

    fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        self.ensure_open("get_entry")?;
        let state = self.state.read();
        Ok(state.by_id.get(id).map(|&i| state.entries[i].clone()))
    }

    fn get_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>> {
        self.ensure_open("get_entries")?;
        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .skip(filter.offset)
            .filter(|entry| filter.contains(entry))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn get_latest_entry(&self) -> Result<Option<Entry>> {
        self.ensure_open("get_latest_entry")?;
        Ok(self.state.read().entries.last().cloned())
    }

    fn get_oldest_entry(&self) -> Result<Option<Entry>> {
        self.ensure_open("get_oldest_entry")?;
        Ok(self.state.read().entries.first().cloned())
    }

    fn count_entries(&self) -> Result<u64> {
        self.ensure_open("count_entries")?;
        Ok(self.state.read().entries.len() as u64)
    }

    fn get_size(&self) -> Result<u64> {
        self.ensure_open("get_size")?;
        Ok(self.state.read().size_bytes)
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(backend = self.name(), "Storage closed");
        }
        Ok(())
    }

    fn get_by_sequence(&self, sequence: u64) -> Result<Option<Entry>> {
        self.ensure_open("get_by_sequence")?;
        let state = self.state.read();
        Ok(usize::try_from(sequence)
            .ok()
            .and_then(|i| state.entries.get(i))
            .cloned())
    }
}

/// Page size used when streaming a backend
pub const EXPORT_PAGE_SIZE: usize = 1000;

/// Write every entry as one JSON object per line. Returns entries written.
pub fn export_entries<W: Write>(backend: &dyn StorageBackend, mut writer: W) -> Result<usize> {
    let mut written = 0;
    loop {
        let page = backend.get_entries(
            &EntryFilter::all()
                .offset(written)
                .limit(EXPORT_PAGE_SIZE),
        )?;
        if page.is_empty() {
            break;
        }
        for entry in &page {
            serde_json::to_writer(&mut writer, entry)?;
            writer.write_all(b"\n")?;
        }
        written += page.len();
    }
    writer.flush()?;

    tracing::info!(entries = written, backend = backend.name(), "Exported entries");
    Ok(written)
}

/// Read entries written by [`export_entries`]. Blank lines are skipped.
pub fn import_entries<R: BufRead>(reader: R) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(&line).map_err(|e| {
            Error::Validation(format!("Invalid entry on line {}: {}", line_no + 1, e))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::HashAlgorithm;
    use crate::types::{Payload, PendingEntry};
    use serde_json::json;

    fn chain(n: usize) -> Vec<Entry> {
        let mut entries: Vec<Entry> = Vec::new();
        for i in 0..n {
            let mut data = Payload::new();
            data.insert("i".to_string(), json!(i));
            let pending = PendingEntry::new(data, Payload::new(), entries.last()).unwrap();
            let hash = HashAlgorithm::Sha256.hex_digest(pending.id().as_bytes());
            entries.push(pending.seal(hash, None));
        }
        entries
    }

    #[test]
    fn test_append_and_get() {
        let backend = MemoryBackend::new();
        let entries = chain(3);
        for entry in &entries {
            backend.append_entry(entry).unwrap();
        }

        assert_eq!(backend.count_entries().unwrap(), 3);
        assert_eq!(backend.get_entry(&entries[1].id).unwrap(), Some(entries[1].clone()));
        assert_eq!(backend.get_oldest_entry().unwrap(), Some(entries[0].clone()));
        assert_eq!(backend.get_latest_entry().unwrap(), Some(entries[2].clone()));
        assert!(backend.get_size().unwrap() > 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let backend = MemoryBackend::new();
        let entries = chain(1);
        backend.append_entry(&entries[0]).unwrap();

        let err = backend.append_entry(&entries[0]).unwrap_err();
        assert!(matches!(err, Error::Storage { ref operation, .. } if operation == "append"));
        assert_eq!(backend.count_entries().unwrap(), 1);
    }

    #[test]
    fn test_offset_and_limit() {
        let backend = MemoryBackend::from_entries(chain(5)).unwrap();

        let page = backend
            .get_entries(&EntryFilter::all().offset(1).limit(2))
            .unwrap();
        assert_eq!(
            page.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_sequence_lookups() {
        let backend = MemoryBackend::from_entries(chain(5)).unwrap();

        assert_eq!(backend.get_by_sequence(3).unwrap().unwrap().sequence, 3);
        assert!(backend.get_by_sequence(5).unwrap().is_none());

        let range = backend.get_range(1, 3).unwrap();
        assert_eq!(
            range.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(backend.get_range(3, 1).unwrap().is_empty());
        assert_eq!(backend.get_range(0, u64::MAX).unwrap().len(), 5);
    }

    #[test]
    fn test_closed_backend_unavailable() {
        let backend = MemoryBackend::from_entries(chain(1)).unwrap();
        backend.close().unwrap();

        assert!(matches!(
            backend.count_entries(),
            Err(Error::Storage { .. })
        ));
        assert!(backend.append_entry(&chain(1)[0]).is_err());
    }

    #[test]
    fn test_export_import() {
        let backend = MemoryBackend::from_entries(chain(4)).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        let written = export_entries(&backend, &mut file).unwrap();
        assert_eq!(written, 4);

        let reader = std::io::BufReader::new(std::fs::File::open(file.path()).unwrap());
        let imported = import_entries(reader).unwrap();
        assert_eq!(imported, backend.entries().unwrap());
    }

    #[test]
    fn test_import_reports_bad_line() {
        let input = "\n{not json}\n";
        let err = import_entries(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
