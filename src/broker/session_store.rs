//! Durable record of upstream session IDs.
//!
//! A crashed process leaves its upstream sessions registered at the broker,
//! which then refuses new sessions with 409. The store keeps
//! `{targetId: {instanceNum: sessionId}}` in `broker-sessions.json` under
//! the runner directory so the next start can delete the leftovers.
//!
//! Cleanup is best-effort by design: every failure here is logged and
//! swallowed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// On-disk file name under the runner directory.
pub const SESSIONS_FILE: &str = "broker-sessions.json";

/// `targetId -> instanceNum -> sessionId`.
///
/// `instanceNum` is carried as an opaque key; this proxy always writes
/// instance `"0"` but round-trips whatever it finds.
pub type SessionDocument = HashMap<String, HashMap<String, String>>;

/// Whole-file JSON persistence for upstream session IDs.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(runner_dir: &Path) -> Self {
        Self {
            path: runner_dir.join(SESSIONS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; missing or unreadable files yield an empty map.
    pub fn load(&self) -> SessionDocument {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SessionDocument::new(),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", self.path.display(), e);
                return SessionDocument::new();
            }
        };

        match serde_json::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!("Corrupt session record {}: {}", self.path.display(), e);
                SessionDocument::new()
            }
        }
    }

    /// Record a session ID for `(target, instance)`.
    pub fn save(&self, target_id: &str, instance: &str, session_id: &str) {
        let mut doc = self.load();
        doc.entry(target_id.to_string())
            .or_default()
            .insert(instance.to_string(), session_id.to_string());
        self.write(&doc);
    }

    /// Remove a `(target, instance)` entry; deletes the file when the
    /// document empties.
    pub fn remove(&self, target_id: &str, instance: &str) {
        let mut doc = self.load();
        if let Some(instances) = doc.get_mut(target_id) {
            instances.remove(instance);
            if instances.is_empty() {
                doc.remove(target_id);
            }
        }
        self.write(&doc);
    }

    /// Delete the whole record.
    pub fn clear(&self) {
        self.delete_file();
    }

    fn write(&self, doc: &SessionDocument) {
        if doc.is_empty() {
            self.delete_file();
            return;
        }

        let text = match serde_json::to_string_pretty(doc) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to serialize session record: {}", e);
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Failed to create {}: {}", parent.display(), e);
                return;
            }
        }
        if let Err(e) = std::fs::write(&self.path, text) {
            tracing::warn!("Failed to write {}: {}", self.path.display(), e);
        }
    }

    fn delete_file(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save("t1", "0", "sess-a");
        store.save("t2", "0", "sess-b");

        let doc = store.load();
        assert_eq!(doc["t1"]["0"], "sess-a");
        assert_eq!(doc["t2"]["0"], "sess-b");
    }

    #[test]
    fn test_remove_last_entry_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save("t1", "0", "sess-a");
        assert!(store.path().exists());

        store.remove("t1", "0");
        assert!(!store.path().exists());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_remove_keeps_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.save("t1", "0", "sess-a");
        store.save("t1", "1", "sess-b");
        store.remove("t1", "0");

        let doc = store.load();
        assert_eq!(doc["t1"].len(), 1);
        assert_eq!(doc["t1"]["1"], "sess-b");
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save("t1", "0", "sess-a");
        store.clear();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(store.path(), "not json").unwrap();
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load().is_empty());
    }
}
