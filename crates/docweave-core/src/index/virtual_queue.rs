//! Storage that records operations instead of executing them
//!
//! Used as the remote side of the replication that rebuilds an index. Each
//! call becomes a [`VirtualOperation`] on a bounded channel; the caller
//! waits until the consumer replays it against the index transaction and
//! answers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::models::{AttachmentInfo, Document, QueryOptions, QueryRow};
use crate::storage::{Storage, StorageError, StorageResult};

const CHANNEL_CAPACITY: usize = 16;

/// A recorded storage call with its responder
#[derive(Debug)]
pub enum VirtualOperation {
    Put {
        id: String,
        doc: Document,
        reply: oneshot::Sender<StorageResult<String>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<StorageResult<Document>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<StorageResult<String>>,
    },
    BuildQuery {
        options: QueryOptions,
        reply: oneshot::Sender<StorageResult<Vec<QueryRow>>>,
    },
}

pub struct VirtualOperationQueue {
    sender: mpsc::Sender<VirtualOperation>,
}

impl VirtualOperationQueue {
    /// Create a queue and the receiving end its operations arrive on
    pub fn channel() -> (Self, mpsc::Receiver<VirtualOperation>) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    async fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StorageResult<T>>) -> VirtualOperation,
    ) -> StorageResult<T> {
        let (reply, answer) = oneshot::channel();
        self.sender.send(make(reply)).await.map_err(|_| closed())?;
        answer.await.map_err(|_| closed())?
    }
}

fn closed() -> StorageError {
    StorageError::Backend("virtual operation queue closed".to_string())
}

#[async_trait]
impl Storage for VirtualOperationQueue {
    fn storage_type(&self) -> &'static str {
        "virtual"
    }

    async fn get(&self, id: &str) -> StorageResult<Document> {
        let id = id.to_string();
        self.submit(|reply| VirtualOperation::Get { id, reply }).await
    }

    async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
        let id = id.to_string();
        self.submit(|reply| VirtualOperation::Put { id, doc, reply })
            .await
    }

    async fn remove(&self, id: &str) -> StorageResult<String> {
        let id = id.to_string();
        self.submit(|reply| VirtualOperation::Remove { id, reply })
            .await
    }

    async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
        let options = options.clone();
        self.submit(|reply| VirtualOperation::BuildQuery { options, reply })
            .await
    }

    async fn all_attachments(&self, _id: &str) -> StorageResult<BTreeMap<String, AttachmentInfo>> {
        Ok(BTreeMap::new())
    }

    async fn has_capacity(&self, name: &str) -> StorageResult<bool> {
        Ok(name == "list")
    }
}
