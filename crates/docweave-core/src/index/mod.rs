//! Secondary indices over a storage
//!
//! [`IndexStorage`] keeps a projection of every document, reduced to the
//! configured index keys, in an SQLite store with one sub-index per key.
//! Single-term queries on an index key are answered from the sub-index;
//! everything else goes to the sub-storage.
//!
//! Each operation runs one open cycle (see [`lifecycle`]). Opening compares
//! the stored layout with the configuration and, when they disagree,
//! rebuilds the index inside the version-change transaction: the sub-storage
//! is replicated into a [`virtual_queue::VirtualOperationQueue`] whose
//! operations are replayed against the still-open transaction.

pub mod keepalive;
pub mod lifecycle;
pub mod schema;
pub mod txstore;
pub mod virtual_queue;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, STORE_PREFIX};
use crate::models::{Attachment, AttachmentInfo, Document, QueryOptions, QueryRow, RepairOptions};
use crate::query::Query;
use crate::replicate::{Replication, ReplicationMode, SignatureStore, Signatures};
use crate::storage::{SharedStorage, Storage, StorageError, StorageResult};
use keepalive::filter_doc;
use lifecycle::{IndexState, Lifecycle};
use txstore::{IndexRecord, KeyStore, StoreLayout, Transaction, TxMode};
use virtual_queue::VirtualOperationQueue;

/// Capacities answered by the index itself
const INDEX_CAPACITIES: &[&str] = &["query", "limit", "list"];

/// Parsed `index` storage description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOptions {
    pub database: String,
    pub index_keys: Vec<String>,
    pub version: Option<u32>,
}

impl IndexOptions {
    /// Read `database`, `index_keys` and `version` from a description
    pub fn from_description(description: &Value) -> StorageResult<Self> {
        let database = match description.get("database") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => {
                return Err(StorageError::BadConfiguration(
                    "index storage requires a non-empty 'database' string".to_string(),
                ))
            }
        };

        let mut index_keys: Vec<String> = Vec::new();
        match description.get("index_keys") {
            None | Some(Value::Null) => {}
            Some(Value::Array(keys)) => {
                for key in keys {
                    let key = match key {
                        Value::String(key) if !key.is_empty() && !key.contains('"') => key,
                        other => {
                            return Err(StorageError::BadConfiguration(format!(
                                "invalid index key {}",
                                other
                            )))
                        }
                    };
                    if !index_keys.contains(key) {
                        index_keys.push(key.clone());
                    }
                }
            }
            Some(_) => {
                return Err(StorageError::BadConfiguration(
                    "'index_keys' must be an array of strings".to_string(),
                ))
            }
        }

        let version = match description.get("version") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(v) if v > 0 && v <= u64::from(u32::MAX) => Some(v as u32),
                _ => {
                    return Err(StorageError::BadConfiguration(format!(
                        "'version' must be a positive integer, got {}",
                        value
                    )))
                }
            },
        };

        Ok(Self {
            database,
            index_keys,
            version,
        })
    }
}

/// Counts of one repair run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Operations replayed against the index
    pub replayed: usize,
    pub pushed: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// What opening must do to bring the stored layout in line
#[derive(Debug, Clone, PartialEq, Eq)]
enum UpgradePlan {
    Keep,
    DropIndexes { extra: Vec<String>, version: u32 },
    Rebuild { version: u32 },
}

impl UpgradePlan {
    fn new(layout: &StoreLayout, index_keys: &[String], requested: Option<u32>) -> Self {
        let version = requested.unwrap_or(1).max(layout.version.unwrap_or(0));
        let bumped = layout.version.map_or(true, |stored| version > stored);
        let configured: BTreeSet<&str> = index_keys.iter().map(String::as_str).collect();
        let stored: BTreeSet<&str> = layout.indexes.iter().map(String::as_str).collect();

        if !layout.object_store || bumped || !configured.is_subset(&stored) {
            return UpgradePlan::Rebuild { version };
        }
        let extra: Vec<String> = stored
            .difference(&configured)
            .map(|field| field.to_string())
            .collect();
        if extra.is_empty() {
            UpgradePlan::Keep
        } else {
            UpgradePlan::DropIndexes { extra, version }
        }
    }
}

pub struct IndexStorage {
    sub: SharedStorage,
    name: String,
    index_keys: Vec<String>,
    version: Option<u32>,
    index_path: PathBuf,
    signature_path: PathBuf,
    busy_timeout: Duration,
    failure_reason: Mutex<Option<String>>,
    last_state: Mutex<IndexState>,
}

impl IndexStorage {
    pub fn new(options: IndexOptions, sub: SharedStorage, config: &Config) -> Self {
        Self {
            sub,
            name: format!("{}:{}", STORE_PREFIX, options.database),
            index_keys: options.index_keys,
            version: options.version,
            index_path: config.index_path(&options.database),
            signature_path: config.signature_path(&options.database),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            failure_reason: Mutex::new(None),
            last_state: Mutex::new(IndexState::Closed),
        }
    }

    /// State the most recent open cycle ended in
    pub fn last_state(&self) -> IndexState {
        *self.last_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, lifecycle: &mut Lifecycle, next: IndexState) -> StorageResult<()> {
        let previous = lifecycle.state();
        lifecycle.advance(next)?;
        *self.last_state.lock().unwrap_or_else(|e| e.into_inner()) = next;
        debug!(index = %self.name, from = %previous, to = %next, "Index state changed");
        Ok(())
    }

    fn record_failure(&self, reason: String) {
        *self.failure_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
    }

    /// Turn an open-cycle error into a connection failure naming this index
    ///
    /// The reason of an earlier aborted rebuild is appended once.
    fn connection_failure(&self, error: StorageError) -> StorageError {
        let mut reason = match error {
            StorageError::Transaction { reason, .. } => reason,
            other => other.to_string(),
        };
        let previous = self
            .failure_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(previous) = previous {
            reason = format!("{} {}", reason, previous);
        }
        StorageError::Transaction {
            store: self.name.clone(),
            reason,
        }
    }

    /// End an open cycle with `result`
    fn finish<T>(&self, lifecycle: &mut Lifecycle, result: StorageResult<T>) -> StorageResult<T> {
        match result {
            Ok(value) => {
                self.enter(lifecycle, IndexState::Closed)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.enter(lifecycle, IndexState::Aborted);
                Err(self.connection_failure(e))
            }
        }
    }

    /// Open the index store, upgrading it when the layout is out of date
    async fn open(&self) -> StorageResult<(KeyStore, Lifecycle)> {
        let mut lifecycle = Lifecycle::new();
        self.enter(&mut lifecycle, IndexState::Opening)?;

        match self.open_and_upgrade(&mut lifecycle).await {
            Ok(store) => Ok((store, lifecycle)),
            Err(e) => {
                let _ = self.enter(&mut lifecycle, IndexState::Aborted);
                Err(self.connection_failure(e))
            }
        }
    }

    async fn open_and_upgrade(&self, lifecycle: &mut Lifecycle) -> StorageResult<KeyStore> {
        if let Some(parent) = self.index_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (store, tx, layout) =
            KeyStore::open(&self.index_path, &self.name, self.version, self.busy_timeout).await?;

        match UpgradePlan::new(&layout, &self.index_keys, self.version) {
            UpgradePlan::Keep => {
                tx.commit().await?;
                self.enter(lifecycle, IndexState::Ready)?;
            }
            UpgradePlan::DropIndexes { extra, version } => {
                self.enter(lifecycle, IndexState::Upgrading)?;
                info!(index = %self.name, ?extra, "Dropping unused sub-indices");
                tx.run(async {
                    for field in &extra {
                        tx.delete_index(field).await?;
                    }
                    tx.set_version(version).await
                })
                .await?;
                self.enter(lifecycle, IndexState::Ready)?;
            }
            UpgradePlan::Rebuild { version } => {
                self.enter(lifecycle, IndexState::Upgrading)?;
                info!(
                    index = %self.name,
                    version,
                    keys = ?self.index_keys,
                    "Rebuilding index"
                );
                let (report, signatures) = tx
                    .run(async {
                        if layout.object_store {
                            tx.delete_object_store().await?;
                        }
                        tx.create_object_store().await?;
                        for key in &self.index_keys {
                            tx.create_index(key).await?;
                        }
                        self.enter(lifecycle, IndexState::Repairing)?;
                        let rebuilt = self
                            .replay(&tx, Signatures::new(), ReplicationMode::Full)
                            .await?;
                        tx.set_version(version).await?;
                        Ok(rebuilt)
                    })
                    .await?;
                self.save_signatures(signatures).await?;
                info!(index = %self.name, replayed = report.replayed, "Index rebuilt");
                self.enter(lifecycle, IndexState::Ready)?;
            }
        }

        Ok(store)
    }

    /// Replicate the sub-storage into `tx`
    ///
    /// Must be awaited inside `tx.run`. Signatures are returned rather than
    /// saved so they only persist once the transaction committed.
    async fn replay(
        &self,
        tx: &Transaction,
        signatures: Signatures,
        mode: ReplicationMode,
    ) -> StorageResult<(RepairReport, Signatures)> {
        let (queue, operations) = VirtualOperationQueue::channel();
        let remote: SharedStorage = Arc::new(queue);
        let engine = Replication::new(self.sub.clone(), remote, signatures, mode).run();

        let cleared = mode == ReplicationMode::Full;
        match keepalive::replay_in_transaction(tx, engine, operations, &self.index_keys, cleared)
            .await
        {
            Ok(((replication, signatures), replayed)) => Ok((
                RepairReport {
                    replayed,
                    pushed: replication.pushed,
                    removed: replication.removed,
                    skipped: replication.skipped,
                },
                signatures,
            )),
            Err(e) => {
                warn!(index = %self.name, error = %e, "Index replay failed");
                self.record_failure(e.to_string());
                Err(StorageError::Transaction {
                    store: self.name.clone(),
                    reason: "transaction aborted".to_string(),
                })
            }
        }
    }

    /// Signature I/O is blocking, so it runs off the executor and never
    /// inside a transaction body, where waiting on it would let the
    /// transaction commit.
    async fn load_signatures(&self) -> StorageResult<Signatures> {
        let path = self.signature_path.clone();
        tokio::task::spawn_blocking(move || SignatureStore::open(&path)?.load())
            .await
            .map_err(signature_task_failed)?
    }

    async fn save_signatures(&self, signatures: Signatures) -> StorageResult<()> {
        let path = self.signature_path.clone();
        tokio::task::spawn_blocking(move || SignatureStore::open(&path)?.save(&signatures))
            .await
            .map_err(signature_task_failed)?
    }

    /// Bring the index in line with the sub-storage
    ///
    /// Index records the sub-storage no longer holds are removed. Only
    /// documents whose signature changed since the last run are pushed.
    pub async fn repair_index(&self) -> StorageResult<RepairReport> {
        if self.index_keys.is_empty() {
            return Ok(RepairReport::default());
        }

        let (store, mut lifecycle) = self.open().await?;
        let result = async {
            self.enter(&mut lifecycle, IndexState::Repairing)?;
            let signatures = self.load_signatures().await?;
            let tx = store.transaction(TxMode::ReadWrite).await?;
            let (report, signatures) = tx
                .run(self.replay(&tx, signatures, ReplicationMode::Incremental))
                .await?;
            self.save_signatures(signatures).await?;
            self.enter(&mut lifecycle, IndexState::Ready)?;
            Ok::<_, StorageError>(report)
        }
        .await;

        let report = self.finish(&mut lifecycle, result)?;
        info!(
            index = %self.name,
            replayed = report.replayed,
            pushed = report.pushed,
            removed = report.removed,
            "Index repaired"
        );
        Ok(report)
    }

    async fn index_put(&self, id: &str, doc: &Document) -> StorageResult<()> {
        if self.index_keys.is_empty() {
            return Ok(());
        }
        let record = IndexRecord {
            id: id.to_string(),
            doc: filter_doc(doc, &self.index_keys),
        };

        let (store, mut lifecycle) = self.open().await?;
        let result = async {
            let tx = store.transaction(TxMode::ReadWrite).await?;
            tx.run(tx.put(record)).await
        }
        .await;
        self.finish(&mut lifecycle, result)
    }

    /// The (key, value) pair of a query the sub-indices can answer
    fn indexed_term(&self, options: &QueryOptions) -> Option<(String, String)> {
        if options.include_docs || options.sort_on.is_some() || options.select_list.is_some() {
            return None;
        }
        let query = Query::parse(options.query.as_deref()?).ok()?;
        let (key, value) = query.as_simple()?;
        if !self.index_keys.iter().any(|k| k == key) {
            return None;
        }
        Some((key.to_string(), value.to_string()))
    }
}

fn signature_task_failed(error: tokio::task::JoinError) -> StorageError {
    StorageError::Backend(format!("signature store task failed: {}", error))
}

#[async_trait]
impl Storage for IndexStorage {
    fn storage_type(&self) -> &'static str {
        "index"
    }

    async fn get(&self, id: &str) -> StorageResult<Document> {
        self.sub.get(id).await
    }

    async fn post(&self, doc: Document) -> StorageResult<String> {
        let id = self.sub.post(doc.clone()).await?;
        self.index_put(&id, &doc).await?;
        Ok(id)
    }

    async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
        let id = self.sub.put(id, doc.clone()).await?;
        self.index_put(&id, &doc).await?;
        Ok(id)
    }

    async fn remove(&self, id: &str) -> StorageResult<String> {
        let id = self.sub.remove(id).await?;
        if self.index_keys.is_empty() {
            return Ok(id);
        }

        let (store, mut lifecycle) = self.open().await?;
        let result = async {
            let tx = store.transaction(TxMode::ReadWrite).await?;
            tx.run(tx.delete(&id)).await
        }
        .await;
        self.finish(&mut lifecycle, result)?;
        Ok(id)
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StorageResult<Attachment> {
        self.sub.get_attachment(id, name).await
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        attachment: Attachment,
    ) -> StorageResult<()> {
        self.sub.put_attachment(id, name, attachment).await
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StorageResult<()> {
        self.sub.remove_attachment(id, name).await
    }

    async fn all_attachments(&self, id: &str) -> StorageResult<BTreeMap<String, AttachmentInfo>> {
        self.sub.all_attachments(id).await
    }

    async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
        let (field, value) = match self.indexed_term(options) {
            Some(term) => term,
            None => return self.sub.build_query(options).await,
        };
        debug!(index = %self.name, field = %field, "Answering query from sub-index");

        let (store, mut lifecycle) = self.open().await?;
        let result = async {
            let tx = store.transaction(TxMode::ReadOnly).await?;
            let ids = match options.limit {
                Some([start, end]) => tx.run(tx.index_window(&field, &value, start, end)).await?,
                None => tx.run(tx.index_keys_eq(&field, &value)).await?,
            };
            Ok::<_, StorageError>(ids.into_iter().map(QueryRow::bare).collect())
        }
        .await;
        self.finish(&mut lifecycle, result)
    }

    async fn has_capacity(&self, name: &str) -> StorageResult<bool> {
        if INDEX_CAPACITIES.contains(&name) {
            return Ok(true);
        }
        self.sub.has_capacity(name).await
    }

    async fn repair(&self, _options: &RepairOptions) -> StorageResult<()> {
        self.repair_index().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    /// Route index logs to the test output (ignore error if already initialized)
    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("docweave_core=debug")),
            )
            .with_target(false)
            .with_test_writer()
            .try_init();
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn options(database: &str, keys: &[&str], version: Option<u32>) -> IndexOptions {
        IndexOptions {
            database: database.to_string(),
            index_keys: keys.iter().map(|k| k.to_string()).collect(),
            version,
        }
    }

    fn ids(rows: &[QueryRow]) -> Vec<&str> {
        rows.iter().map(|row| row.id.as_str()).collect()
    }

    /// Sub-storage that only lists, and answers reads slowly
    struct ListOnly {
        inner: MemoryStorage,
        delay: Duration,
    }

    impl ListOnly {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStorage::new(),
                delay,
            }
        }
    }

    #[async_trait]
    impl Storage for ListOnly {
        fn storage_type(&self) -> &'static str {
            "list-only"
        }

        async fn get(&self, id: &str) -> StorageResult<Document> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(id).await
        }

        async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
            self.inner.put(id, doc).await
        }

        async fn remove(&self, id: &str) -> StorageResult<String> {
            self.inner.remove(id).await
        }

        async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
            if !options.is_plain_listing() {
                return Err(StorageError::operation_not_implemented(
                    "buildQuery",
                    self.storage_type(),
                ));
            }
            tokio::time::sleep(self.delay).await;
            self.inner.build_query(options).await
        }
    }

    struct Unlistable;

    #[async_trait]
    impl Storage for Unlistable {
        fn storage_type(&self) -> &'static str {
            "unlistable"
        }
    }

    #[test]
    fn test_options_from_description() {
        let parsed = IndexOptions::from_description(&json!({
            "database": "db",
            "index_keys": ["a", "b", "a"],
            "version": 2
        }))
        .unwrap();
        assert_eq!(parsed, options("db", &["a", "b"], Some(2)));

        let bad = [
            json!({}),
            json!({"database": ""}),
            json!({"database": "db", "index_keys": "a"}),
            json!({"database": "db", "index_keys": ["a\"b"]}),
            json!({"database": "db", "index_keys": [1]}),
            json!({"database": "db", "version": 0}),
            json!({"database": "db", "version": "2"}),
        ];
        for description in bad {
            let err = IndexOptions::from_description(&description).unwrap_err();
            assert_eq!(err.status(), 400, "{}", description);
        }
    }

    #[test]
    fn test_upgrade_plan() {
        let keys = vec!["a".to_string()];
        let layout = |version: Option<u32>, object_store: bool, indexes: &[&str]| StoreLayout {
            version,
            object_store,
            indexes: indexes.iter().map(|s| s.to_string()).collect(),
        };

        assert_eq!(
            UpgradePlan::new(&layout(None, false, &[]), &keys, None),
            UpgradePlan::Rebuild { version: 1 }
        );
        assert_eq!(
            UpgradePlan::new(&layout(Some(1), true, &["a"]), &keys, None),
            UpgradePlan::Keep
        );
        assert_eq!(
            UpgradePlan::new(&layout(Some(1), true, &["a"]), &keys, Some(2)),
            UpgradePlan::Rebuild { version: 2 }
        );
        assert_eq!(
            UpgradePlan::new(&layout(Some(3), true, &["b"]), &keys, None),
            UpgradePlan::Rebuild { version: 3 }
        );
        assert_eq!(
            UpgradePlan::new(&layout(Some(1), true, &["a", "b"]), &keys, Some(1)),
            UpgradePlan::DropIndexes {
                extra: vec!["b".to_string()],
                version: 1
            }
        );
    }

    #[tokio::test]
    async fn test_indexed_query_agrees_with_scan() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(ListOnly::new(Duration::ZERO));
        let scan = MemoryStorage::new();
        let index = IndexStorage::new(options("agree", &["a"], None), sub.clone(), &config);

        let docs = [
            ("1", json!({"a": "X"})),
            ("2", json!({"a": "Y"})),
            ("3", json!({"a": "X", "b": "other"})),
            ("4", json!({"a": ["X"]})),
            ("5", json!({"b": "X"})),
            ("6", json!({"a": 1})),
        ];
        for (id, value) in &docs {
            index.put(id, doc(value.clone())).await.unwrap();
            scan.put(id, doc(value.clone())).await.unwrap();
        }

        for query in ["a:X", "a:1", "a:Z"] {
            let indexed = index
                .build_query(&QueryOptions::new().query(query))
                .await
                .unwrap();
            let scanned = scan
                .build_query(&QueryOptions::new().query(query))
                .await
                .unwrap();
            assert_eq!(ids(&indexed), ids(&scanned), "{}", query);
        }

        let window = index
            .build_query(&QueryOptions::new().query("a:X").limit(1, 3))
            .await
            .unwrap();
        assert_eq!(ids(&window), vec!["3"]);
        assert_eq!(index.last_state(), IndexState::Closed);
    }

    #[tokio::test]
    async fn test_remove_updates_index() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(ListOnly::new(Duration::ZERO));
        let index = IndexStorage::new(options("remove", &["a"], None), sub, &config);

        index.put("1", doc(json!({"a": "X"}))).await.unwrap();
        index.put("2", doc(json!({"a": "X"}))).await.unwrap();
        assert_eq!(index.remove("1").await.unwrap(), "1");

        let rows = index
            .build_query(&QueryOptions::new().query("a:X"))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["2"]);
        assert!(index.get("1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_changed_index_keys_rebuild() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(ListOnly::new(Duration::ZERO));

        let first = IndexStorage::new(options("rekey", &["a"], None), sub.clone(), &config);
        first.put("1", doc(json!({"a": "x", "b": "y"}))).await.unwrap();
        first.put("2", doc(json!({"a": "z", "b": "y"}))).await.unwrap();

        let second = IndexStorage::new(options("rekey", &["b"], None), sub.clone(), &config);
        let rows = second
            .build_query(&QueryOptions::new().query("b:y"))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["1", "2"]);

        // Back to the original key: the stored set no longer covers it
        let rows = first
            .build_query(&QueryOptions::new().query("a:z"))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["2"]);
    }

    #[tokio::test]
    async fn test_complex_query_goes_to_sub_storage() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(MemoryStorage::new());
        let index = IndexStorage::new(options("complex", &["name", "user"], None), sub, &config);

        for i in 0..13 {
            let value = match i {
                3 | 9 => json!({"name": "repeat", "user": "someone"}),
                5 => json!({"name": "unique", "user": "Hesse"}),
                _ => json!({"name": format!("doc{}", i), "user": "someone"}),
            };
            index.put(&format!("{:02}", i), doc(value)).await.unwrap();
        }

        let rows = index
            .build_query(&QueryOptions::new().query("name:repeat OR user:Hesse"))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["03", "05", "09"]);
    }

    #[tokio::test]
    async fn test_select_list_goes_to_sub_storage() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(MemoryStorage::new());
        let index = IndexStorage::new(options("select", &["title"], None), sub, &config);

        index
            .put("id1", doc(json!({"title": "1 ID", "int_index": 1})))
            .await
            .unwrap();
        index
            .put("id2", doc(json!({"title": "2 ID", "int_index": 2})))
            .await
            .unwrap();

        let rows = index
            .build_query(
                &QueryOptions::new()
                    .query("title: \"2 ID\"")
                    .select(["int_index"]),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "id2");
        assert_eq!(Value::Object(rows[0].value.clone()), json!({"int_index": 2}));
    }

    #[tokio::test]
    async fn test_rebuild_survives_slow_sub_storage() {
        init_logging();
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(ListOnly::new(Duration::from_millis(5)));
        for i in 0..10 {
            sub.inner
                .put(&format!("doc{}", i), doc(json!({"kind": "note", "n": i})))
                .await
                .unwrap();
        }

        let index = IndexStorage::new(options("slow", &["kind"], None), sub.clone(), &config);
        let rows = index
            .build_query(&QueryOptions::new().query("kind:note"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 10);
    }

    #[tokio::test]
    async fn test_repair_replays_only_changes() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(ListOnly::new(Duration::ZERO));
        let index = IndexStorage::new(options("repair", &["a"], None), sub.clone(), &config);

        index.put("1", doc(json!({"a": "x"}))).await.unwrap();
        let report = index.repair_index().await.unwrap();
        assert_eq!((report.pushed, report.removed, report.skipped), (0, 0, 1));
        // Only the listing of the index
        assert_eq!(report.replayed, 1);

        // Written behind the index's back
        sub.inner.put("2", doc(json!({"a": "x"}))).await.unwrap();
        let report = index.repair_index().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.replayed, 2);

        let report = index.repair_index().await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.skipped, 2);

        let rows = index
            .build_query(&QueryOptions::new().query("a:x"))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["1", "2"]);
        assert!(index.repair(&RepairOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_repair_removes_records_missing_from_sub_storage() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(ListOnly::new(Duration::ZERO));
        let index = IndexStorage::new(options("heal", &["a"], None), sub.clone(), &config);

        // "2" is indexed after the rebuild, so it has no signature yet
        index.put("1", doc(json!({"a": "x"}))).await.unwrap();
        index.put("2", doc(json!({"a": "x"}))).await.unwrap();
        sub.inner.remove("2").await.unwrap();

        let report = index.repair_index().await.unwrap();
        assert_eq!(
            (report.pushed, report.removed, report.skipped),
            (0, 1, 1)
        );

        let rows = index
            .build_query(&QueryOptions::new().query("a:x"))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec!["1"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_signatures_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub: SharedStorage = Arc::new(MemoryStorage::new());

        let first = IndexStorage::new(options("persist", &["a"], None), sub.clone(), &config);
        first.put("1", doc(json!({"a": "x"}))).await.unwrap();
        assert!(config.signature_path("persist").exists());
        drop(first);

        let second = IndexStorage::new(options("persist", &["a"], None), sub, &config);
        let report = second.repair_index().await.unwrap();
        assert_eq!((report.pushed, report.skipped), (0, 1));
    }

    #[tokio::test]
    async fn test_lower_version_fails() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub: SharedStorage = Arc::new(MemoryStorage::new());

        let newer = IndexStorage::new(options("versions", &["a"], Some(2)), sub.clone(), &config);
        newer.repair_index().await.unwrap();

        let older = IndexStorage::new(options("versions", &["a"], Some(1)), sub, &config);
        let err = older.repair_index().await.unwrap_err();
        assert_eq!(err.status(), 500);
        assert!(err.to_string().contains("Connection to: docweave:versions failed"));
        assert!(err.to_string().contains("less than the existing version"));
        assert_eq!(older.last_state(), IndexState::Aborted);
    }

    #[tokio::test]
    async fn test_failed_rebuild_surfaces_reason() {
        init_logging();
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let index = IndexStorage::new(options("broken", &["a"], None), Arc::new(Unlistable), &config);

        let err = index.repair_index().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("transaction aborted"), "{}", message);
        assert!(message.contains("listing local documents"), "{}", message);
        assert_eq!(index.last_state(), IndexState::Aborted);

        // The rebuild was rolled back, so the store was never created
        let path = config.index_path("broken");
        let (_store, tx, layout) = KeyStore::open(&path, "check", None, Duration::from_secs(2))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(!layout.object_store);
    }

    #[tokio::test]
    async fn test_zero_keys_is_passthrough() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let sub = Arc::new(MemoryStorage::new());
        let index = IndexStorage::new(options("plain", &[], None), sub.clone(), &config);

        let id = index.post(doc(json!({"a": "X"}))).await.unwrap();
        index.put("2", doc(json!({"a": "X"}))).await.unwrap();
        assert_eq!(sub.len(), 2);

        let rows = index
            .build_query(&QueryOptions::new().query("a:X"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|row| row.id == id));

        index.remove("2").await.unwrap();
        assert_eq!(index.repair_index().await.unwrap(), RepairReport::default());
        assert!(!config.index_path("plain").exists());
    }

    #[tokio::test]
    async fn test_capacities() {
        let dir = TempDir::new().unwrap();
        let config = Config::with_data_dir(dir.path());
        let index = IndexStorage::new(options("caps", &[], None), Arc::new(MemoryStorage::new()), &config);
        for name in ["query", "limit", "list", "sort"] {
            assert!(index.has_capacity(name).await.unwrap(), "{}", name);
        }

        let index = IndexStorage::new(options("caps", &[], None), Arc::new(Unlistable), &config);
        assert!(index.has_capacity("query").await.unwrap());
        assert!(index.has_capacity("sort").await.unwrap_err().is_not_implemented());
    }
}
