//! Per-process runtime state shared with tools.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// When a file was last read and what it contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReadRecord {
    pub read_at: DateTime<Utc>,
    /// Hex SHA-256 of the content seen.
    pub digest: String,
}

/// Shared store for read-tracking and id generation.
#[derive(Debug, Default)]
pub struct RuntimeStore {
    reads: Mutex<HashMap<(String, PathBuf), FileReadRecord>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl RuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, session_id: &str, path: &Path, content: &[u8]) -> FileReadRecord {
        let record = FileReadRecord {
            read_at: Utc::now(),
            digest: digest_hex(content),
        };
        if let Ok(mut reads) = self.reads.lock() {
            reads.insert((session_id.to_string(), path.to_path_buf()), record.clone());
        }
        record
    }

    pub fn last_read(&self, session_id: &str, path: &Path) -> Option<FileReadRecord> {
        self.reads
            .lock()
            .ok()?
            .get(&(session_id.to_string(), path.to_path_buf()))
            .cloned()
    }

    /// Whether `content` differs from what the session last read at `path`.
    /// A path never read counts as changed.
    pub fn changed_since_read(&self, session_id: &str, path: &Path, content: &[u8]) -> bool {
        self.last_read(session_id, path)
            .map_or(true, |record| record.digest != digest_hex(content))
    }

    pub fn forget_session(&self, session_id: &str) {
        if let Ok(mut reads) = self.reads.lock() {
            reads.retain(|(owner, _), _| owner != session_id);
        }
    }

    /// Next id for `prefix`, e.g. `perm_3`.
    pub fn next_id(&self, prefix: &str) -> String {
        let n = match self.counters.lock() {
            Ok(mut counters) => {
                let counter = counters.entry(prefix.to_string()).or_insert(0);
                *counter += 1;
                *counter
            }
            Err(_) => 0,
        };
        format!("{prefix}_{n}")
    }
}

fn digest_hex(content: &[u8]) -> String {
    Sha256::digest(content)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_tracked_per_session() {
        let store = RuntimeStore::new();
        let path = Path::new("/work/src/main.rs");
        store.record_read("s1", path, b"fn main() {}");

        assert!(!store.changed_since_read("s1", path, b"fn main() {}"));
        assert!(store.changed_since_read("s1", path, b"fn main() { todo!() }"));
        assert!(store.changed_since_read("s2", path, b"fn main() {}"));

        store.forget_session("s1");
        assert!(store.last_read("s1", path).is_none());
    }

    #[test]
    fn ids_count_per_prefix() {
        let store = RuntimeStore::new();
        assert_eq!(store.next_id("perm"), "perm_1");
        assert_eq!(store.next_id("perm"), "perm_2");
        assert_eq!(store.next_id("question"), "question_1");
    }
}
