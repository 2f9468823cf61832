//! Keeping an index transaction open across a rebuild
//!
//! The rebuild engine awaits the backend between steps, and a transaction
//! that idles with nothing in flight commits on its own. [`KeepAlive`]
//! keeps exactly one cheap placeholder request outstanding at every yield.
//! Each time the placeholder resolves, the operations the engine queued in
//! the meantime are replayed against the transaction in order, then a fresh
//! placeholder is issued.

use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::txstore::{IndexRecord, Request, Transaction};
use super::virtual_queue::VirtualOperation;
use crate::models::{Document, QueryRow};
use crate::storage::{StorageError, StorageResult};

/// Key that is never written to an index store
pub const PLACEHOLDER_KEY: &str = "\u{0}docweave:keepalive";

/// Holder of the single outstanding placeholder request
pub struct KeepAlive {
    tx: Transaction,
    slot: Option<Request<Option<Document>>>,
}

impl KeepAlive {
    pub fn new(tx: Transaction) -> Self {
        Self { tx, slot: None }
    }

    /// Issue a placeholder request
    ///
    /// # Panics
    ///
    /// Panics if a placeholder is already in flight.
    pub fn arm(&mut self) {
        assert!(
            self.slot.is_none(),
            "keep-alive placeholder already in flight"
        );
        self.slot = Some(self.tx.get(PLACEHOLDER_KEY));
    }

    pub fn is_armed(&self) -> bool {
        self.slot.is_some()
    }

    /// Drop the placeholder without waiting for it
    pub fn disarm(&mut self) {
        self.slot = None;
    }

    /// Wait for the placeholder to resolve; never resolves when disarmed
    ///
    /// The request is polled in place, so cancelling this future keeps the
    /// placeholder in flight.
    pub async fn wait(&mut self) -> StorageResult<()> {
        let result = match self.slot.as_mut() {
            Some(request) => request.await,
            None => std::future::pending().await,
        };
        self.slot = None;
        result.map(|_| ())
    }
}

/// Drive `engine` to completion while replaying its operations inside `tx`
///
/// Returns the engine's output and the number of operations replayed. When
/// the engine or the transaction fails, the transaction is aborted.
pub async fn replay_in_transaction<E, R>(
    tx: &Transaction,
    engine: E,
    mut operations: mpsc::Receiver<VirtualOperation>,
    index_keys: &[String],
    cleared: bool,
) -> StorageResult<(R, usize)>
where
    E: Future<Output = StorageResult<R>>,
{
    let mut engine = Box::pin(engine);
    let mut keepalive = KeepAlive::new(tx.clone());
    let mut replayed = 0;

    keepalive.arm();
    let outcome = loop {
        tokio::select! {
            biased;
            outcome = &mut engine => break outcome,
            placeholder = keepalive.wait() => {
                if let Err(e) = placeholder {
                    warn!(error = %e, "Keep-alive request failed");
                    tx.abort();
                    return Err(e);
                }
                replayed += drain(&mut operations, tx, index_keys, cleared).await;
                keepalive.arm();
            }
        }
    };

    match outcome {
        Ok(value) => {
            replayed += drain(&mut operations, tx, index_keys, cleared).await;
            keepalive.disarm();
            debug!(replayed, "Replay finished");
            Ok((value, replayed))
        }
        Err(e) => {
            keepalive.disarm();
            tx.abort();
            Err(e)
        }
    }
}

/// Replay every queued operation in FIFO order
async fn drain(
    operations: &mut mpsc::Receiver<VirtualOperation>,
    tx: &Transaction,
    index_keys: &[String],
    cleared: bool,
) -> usize {
    let mut count = 0;
    while let Ok(operation) = operations.try_recv() {
        replay(operation, tx, index_keys, cleared).await;
        count += 1;
    }
    count
}

async fn replay(
    operation: VirtualOperation,
    tx: &Transaction,
    index_keys: &[String],
    cleared: bool,
) {
    match operation {
        VirtualOperation::Put { id, doc, reply } => {
            let record = IndexRecord {
                id: id.clone(),
                doc: filter_doc(&doc, index_keys),
            };
            let _ = reply.send(tx.put(record).await.map(|_| id));
        }
        VirtualOperation::Get { id, reply } => {
            // A cleared store holds nothing to look up
            let result = if cleared {
                Err(StorageError::document_not_found(&id))
            } else {
                match tx.get(&id).await {
                    Ok(Some(doc)) => Ok(doc),
                    Ok(None) => Err(StorageError::document_not_found(&id)),
                    Err(e) => Err(e),
                }
            };
            let _ = reply.send(result);
        }
        VirtualOperation::Remove { id, reply } => {
            let _ = reply.send(tx.delete(&id).await.map(|_| id));
        }
        VirtualOperation::BuildQuery { reply, .. } => {
            let result = tx
                .get_all_keys()
                .await
                .map(|ids| ids.into_iter().map(QueryRow::bare).collect());
            let _ = reply.send(result);
        }
    }
}

/// Keep only the index keys present in `doc`
pub fn filter_doc(doc: &Document, index_keys: &[String]) -> Document {
    index_keys
        .iter()
        .filter_map(|key| doc.get(key).map(|value| (key.clone(), value.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::txstore::{KeyStore, TxMode};
    use crate::index::virtual_queue::VirtualOperationQueue;
    use crate::storage::Storage;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> KeyStore {
        let path = dir.path().join("keepalive.sqlite");
        let (store, tx, _) = KeyStore::open(&path, "keepalive", Some(1), Duration::from_secs(2))
            .await
            .unwrap();
        tx.run(async {
            tx.create_object_store().await?;
            tx.set_version(1).await
        })
        .await
        .unwrap();
        store
    }

    #[test]
    fn test_filter_doc() {
        let doc = json!({"a": 1, "b": 2, "c": 3}).as_object().cloned().unwrap();
        let keys = vec!["c".to_string(), "a".to_string(), "missing".to_string()];
        let filtered = filter_doc(&doc, &keys);
        assert_eq!(serde_json::Value::Object(filtered), json!({"c": 3, "a": 1}));
    }

    #[tokio::test]
    #[should_panic(expected = "already in flight")]
    async fn test_double_arm_panics() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let tx = store.transaction(TxMode::ReadWrite).await.unwrap();

        let mut keepalive = KeepAlive::new(tx);
        keepalive.arm();
        keepalive.arm();
    }

    #[tokio::test]
    async fn test_disarm_drops_placeholder() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let tx = store.transaction(TxMode::ReadWrite).await.unwrap();

        let mut keepalive = KeepAlive::new(tx);
        assert!(!keepalive.is_armed());
        keepalive.arm();
        assert!(keepalive.is_armed());
        keepalive.disarm();
        assert!(!keepalive.is_armed());
        // Re-arming after a disarm is allowed
        keepalive.arm();
        assert!(keepalive.is_armed());
    }

    #[tokio::test]
    async fn test_replay_survives_slow_engine() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let keys = vec!["title".to_string()];

        let tx = store.transaction(TxMode::ReadWrite).await.unwrap();
        let (queue, operations) = VirtualOperationQueue::channel();
        let engine = async move {
            for i in 0..3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let doc = json!({"title": format!("t{}", i), "body": "x"})
                    .as_object()
                    .cloned()
                    .unwrap();
                queue.put(&format!("doc{}", i), doc).await?;
            }
            queue.remove("doc1").await?;
            let rows = queue.build_query(&Default::default()).await?;
            Ok::<_, StorageError>(rows.len())
        };

        let (listed, replayed) = tx
            .run(replay_in_transaction(&tx, engine, operations, &keys, true))
            .await
            .unwrap();
        assert_eq!(listed, 2);
        assert_eq!(replayed, 5);

        let tx = store.transaction(TxMode::ReadOnly).await.unwrap();
        let doc = tx
            .run(async { tx.get("doc2").await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(serde_json::Value::Object(doc), json!({"title": "t2"}));
    }

    #[tokio::test]
    async fn test_engine_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let keys = vec!["title".to_string()];

        let tx = store.transaction(TxMode::ReadWrite).await.unwrap();
        let (queue, operations) = VirtualOperationQueue::channel();
        let engine = async move {
            queue
                .put("doc", json!({"title": "t"}).as_object().cloned().unwrap())
                .await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(StorageError::Replication("boom".to_string()))
        };

        let err = tx
            .run(replay_in_transaction(&tx, engine, operations, &keys, true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(!tx.is_active());

        let tx = store.transaction(TxMode::ReadOnly).await.unwrap();
        let keys = tx.run(async { tx.get_all_keys().await }).await.unwrap();
        assert!(keys.is_empty());
    }
}
