//! Replication signatures
//!
//! A signature is the SHA-256 of a document as last pushed to the remote
//! side. Replication works on an in-memory [`Signatures`] set; the
//! [`SignatureStore`] loads it from SQLite and saves the staged changes in
//! one transaction once the caller knows the push itself was committed.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use crate::models::Document;
use crate::storage::StorageResult;

/// Signature of a document
pub fn signature(doc: &Document) -> StorageResult<String> {
    let json = serde_json::to_string(doc)?;
    Ok(format!("{:x}", Sha256::digest(json.as_bytes())))
}

/// Signature set with staged changes
#[derive(Debug, Default, Clone)]
pub struct Signatures {
    entries: BTreeMap<String, String>,
    cleared: bool,
    changes: BTreeMap<String, Option<String>>,
}

impl Signatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn put(&mut self, id: &str, hash: String) {
        self.entries.insert(id.to_string(), hash.clone());
        self.changes.insert(id.to_string(), Some(hash));
    }

    pub fn remove(&mut self, id: &str) {
        self.entries.remove(id);
        self.changes.insert(id.to_string(), None);
    }

    /// Ids with a signature, in ascending order
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Forget every signature
    pub fn clear(&mut self) {
        self.entries.clear();
        self.changes.clear();
        self.cleared = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether anything changed since loading
    pub fn is_dirty(&self) -> bool {
        self.cleared || !self.changes.is_empty()
    }
}

/// SQLite-backed signature persistence
pub struct SignatureStore {
    conn: Connection,
}

impl SignatureStore {
    /// Open (or create) the signature database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory signature store (for tests)
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signatures (
                id TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    /// Load every stored signature
    pub fn load(&self) -> StorageResult<Signatures> {
        let entries = self
            .conn
            .prepare("SELECT id, hash FROM signatures")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()?;

        Ok(Signatures {
            entries,
            cleared: false,
            changes: BTreeMap::new(),
        })
    }

    /// Persist the staged changes of `signatures` atomically
    pub fn save(&mut self, signatures: &Signatures) -> StorageResult<()> {
        if !signatures.is_dirty() {
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        let tx = self.conn.transaction()?;
        if signatures.cleared {
            tx.execute("DELETE FROM signatures", [])?;
        }
        for (id, change) in &signatures.changes {
            match change {
                Some(hash) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO signatures (id, hash, updated_at) VALUES (?1, ?2, ?3)",
                        params![id, hash, now],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM signatures WHERE id = ?1", [id])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_signature_is_stable_and_content_sensitive() {
        let a = signature(&doc(json!({"title": "a"}))).unwrap();
        assert_eq!(a, signature(&doc(json!({"title": "a"}))).unwrap());
        assert_ne!(a, signature(&doc(json!({"title": "b"}))).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_staged_changes() {
        let mut signatures = Signatures::new();
        assert!(!signatures.is_dirty());

        signatures.put("a", "1".to_string());
        signatures.put("b", "2".to_string());
        signatures.remove("a");

        assert_eq!(signatures.ids(), vec!["b"]);
        assert_eq!(signatures.get("b"), Some("2"));
        assert!(signatures.is_dirty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sigs.sqlite");

        let mut store = SignatureStore::open(&path).unwrap();
        let mut signatures = store.load().unwrap();
        assert!(signatures.is_empty());

        signatures.put("a", "1".to_string());
        signatures.put("b", "2".to_string());
        store.save(&signatures).unwrap();

        let mut store = SignatureStore::open(&path).unwrap();
        let mut reloaded = store.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(!reloaded.is_dirty());

        reloaded.remove("a");
        store.save(&reloaded).unwrap();
        assert_eq!(store.load().unwrap().ids(), vec!["b"]);
    }

    #[test]
    fn test_clear_then_put() {
        let mut store = SignatureStore::open_in_memory().unwrap();
        let mut signatures = Signatures::new();
        signatures.put("old", "1".to_string());
        store.save(&signatures).unwrap();

        let mut signatures = store.load().unwrap();
        signatures.clear();
        signatures.put("new", "2".to_string());
        store.save(&signatures).unwrap();

        assert_eq!(store.load().unwrap().ids(), vec!["new"]);
    }
}
