//! Dedup ledger: which (owner, item) pairs have already been materialized.
//!
//! Keyed by owner id and item id, never by media URL, because media URLs
//! are re-signed between fetches.

use std::path::{Path, PathBuf};

use dashmap::DashSet;
use serde::{Deserialize, Serialize};

use crate::error::RelayResult;
use crate::records::{read_records, RecordLog};

/// File the persistent ledger appends to.
pub const LEDGER_FILE: &str = "ledger.jsonl";

/// One materialized item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Owner id.
    pub username: String,
    /// Item id.
    pub id: String,
}

impl LedgerEntry {
    pub fn new(username: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            id: id.into(),
        }
    }
}

/// Append-only set of materialized items.
pub trait DedupLedger: Send + Sync {
    fn has(&self, username: &str, id: &str) -> bool;

    /// Record an item. Idempotent; returns `true` only if it was new.
    fn record(&self, username: &str, id: &str) -> RelayResult<bool>;

    /// All recorded entries, sorted.
    fn entries(&self) -> Vec<LedgerEntry>;
}

/// Ledger that lives only for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: DashSet<LedgerEntry>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupLedger for MemoryLedger {
    fn has(&self, username: &str, id: &str) -> bool {
        self.entries.contains(&LedgerEntry::new(username, id))
    }

    fn record(&self, username: &str, id: &str) -> RelayResult<bool> {
        Ok(self.entries.insert(LedgerEntry::new(username, id)))
    }

    fn entries(&self) -> Vec<LedgerEntry> {
        sorted(&self.entries)
    }
}

/// Ledger backed by a JSONL file, reloaded on open.
#[derive(Debug)]
pub struct FileLedger {
    entries: DashSet<LedgerEntry>,
    log: RecordLog,
}

impl FileLedger {
    /// Open `<dir>/ledger.jsonl`, loading every well-formed entry.
    pub fn open_in(dir: impl AsRef<Path>) -> RelayResult<Self> {
        Self::open(dir.as_ref().join(LEDGER_FILE))
    }

    pub fn open(path: impl Into<PathBuf>) -> RelayResult<Self> {
        let path = path.into();
        let loaded: Vec<LedgerEntry> = read_records(&path)?;
        let entries = DashSet::new();
        for entry in loaded {
            entries.insert(entry);
        }
        tracing::debug!("Loaded {} ledger entries from {}", entries.len(), path.display());
        Ok(Self {
            entries,
            log: RecordLog::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }
}

impl DedupLedger for FileLedger {
    fn has(&self, username: &str, id: &str) -> bool {
        self.entries.contains(&LedgerEntry::new(username, id))
    }

    fn record(&self, username: &str, id: &str) -> RelayResult<bool> {
        let entry = LedgerEntry::new(username, id);
        // Only the thread that wins the insert writes the line.
        if !self.entries.insert(entry.clone()) {
            return Ok(false);
        }
        if let Err(e) = self.log.append(&entry) {
            self.entries.remove(&entry);
            return Err(e);
        }
        Ok(true)
    }

    fn entries(&self) -> Vec<LedgerEntry> {
        sorted(&self.entries)
    }
}

fn sorted(set: &DashSet<LedgerEntry>) -> Vec<LedgerEntry> {
    let mut entries: Vec<LedgerEntry> = set.iter().map(|e| e.key().clone()).collect();
    entries.sort();
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_memory_record_idempotent() {
        let ledger = MemoryLedger::new();
        assert!(!ledger.has("jane", "p1"));
        assert!(ledger.record("jane", "p1").unwrap());
        assert!(!ledger.record("jane", "p1").unwrap());
        assert!(ledger.has("jane", "p1"));
        assert!(!ledger.has("john", "p1"));
        assert_eq!(ledger.entries(), vec![LedgerEntry::new("jane", "p1")]);
    }

    #[test]
    fn test_file_ledger_persists_once() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = FileLedger::open_in(dir.path()).unwrap();
            assert!(ledger.record("jane", "p1").unwrap());
            assert!(!ledger.record("jane", "p1").unwrap());
            assert!(ledger.record("jane", "p2").unwrap());
        }
        let raw = std::fs::read_to_string(dir.path().join(LEDGER_FILE)).unwrap();
        assert_eq!(raw.lines().count(), 2);

        let reopened = FileLedger::open_in(dir.path()).unwrap();
        assert!(reopened.has("jane", "p1"));
        assert!(reopened.has("jane", "p2"));
        assert!(!reopened.record("jane", "p2").unwrap());
    }

    #[test]
    fn test_file_ledger_skips_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE);
        std::fs::write(
            &path,
            "{\"username\":\"a\",\"id\":\"1\"}\ngarbage\n{\"username\":\"b\"}\n",
        )
        .unwrap();
        let ledger = FileLedger::open(&path).unwrap();
        assert_eq!(ledger.entries(), vec![LedgerEntry::new("a", "1")]);
    }

    #[test]
    fn test_concurrent_record_single_winner() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(FileLedger::open_in(dir.path()).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.record("jane", "p1").unwrap())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|new| *new)
            .count();
        assert_eq!(wins, 1);
        let raw = std::fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }
}
