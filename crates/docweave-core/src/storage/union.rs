//! Union of several storages
//!
//! Presents an ordered list of sub-storages as one document space. Reads
//! try the list left to right, new documents always land in the first
//! sub-storage and queries fan out to every sub-storage.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::debug;

use super::{SharedStorage, Storage, StorageError, StorageResult};
use crate::models::{Attachment, AttachmentInfo, Document, QueryOptions, QueryRow, RepairOptions};

/// Capacities a union provides only when every sub-storage does
const SHARED_CAPACITIES: &[&str] = &["list", "query", "select"];

pub struct UnionStorage {
    storages: Vec<SharedStorage>,
}

impl UnionStorage {
    /// Build a union over a non-empty ordered list
    pub fn new(storages: Vec<SharedStorage>) -> StorageResult<Self> {
        if storages.is_empty() {
            return Err(StorageError::BadConfiguration(
                "union storage_list must not be empty".to_string(),
            ));
        }
        Ok(Self { storages })
    }

    /// Find the sub-storage holding `id`
    ///
    /// A 404 from any but the last sub-storage moves on to the next one;
    /// every other failure propagates.
    async fn locate(&self, id: &str) -> StorageResult<(usize, Document)> {
        let last = self.storages.len() - 1;
        for (index, storage) in self.storages.iter().enumerate() {
            match storage.get(id).await {
                Ok(doc) => return Ok((index, doc)),
                Err(e) if e.is_not_found() && index < last => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::document_not_found(id))
    }

    async fn owner(&self, id: &str) -> StorageResult<&SharedStorage> {
        let (index, _) = self.locate(id).await?;
        Ok(&self.storages[index])
    }
}

#[async_trait]
impl Storage for UnionStorage {
    fn storage_type(&self) -> &'static str {
        "union"
    }

    async fn get(&self, id: &str) -> StorageResult<Document> {
        let (_, doc) = self.locate(id).await?;
        Ok(doc)
    }

    async fn post(&self, doc: Document) -> StorageResult<String> {
        self.storages[0].post(doc).await
    }

    async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
        let index = match self.locate(id).await {
            Ok((index, _)) => index,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        debug!(id = %id, sub_storage = index, "Union put");
        self.storages[index].put(id, doc).await
    }

    async fn remove(&self, id: &str) -> StorageResult<String> {
        self.owner(id).await?.remove(id).await
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StorageResult<Attachment> {
        self.owner(id).await?.get_attachment(id, name).await
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        attachment: Attachment,
    ) -> StorageResult<()> {
        self.owner(id)
            .await?
            .put_attachment(id, name, attachment)
            .await
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StorageResult<()> {
        self.owner(id).await?.remove_attachment(id, name).await
    }

    async fn all_attachments(&self, id: &str) -> StorageResult<BTreeMap<String, AttachmentInfo>> {
        self.owner(id).await?.all_attachments(id).await
    }

    async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
        let results = join_all(self.storages.iter().map(|s| s.build_query(options))).await;

        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for result in results {
            for row in result? {
                if seen.insert(row.id.clone()) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    async fn has_capacity(&self, name: &str) -> StorageResult<bool> {
        if !SHARED_CAPACITIES.contains(&name) {
            return Ok(false);
        }
        for storage in &self.storages {
            if !storage.has_capacity(name).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn repair(&self, options: &RepairOptions) -> StorageResult<()> {
        for storage in &self.storages {
            storage.repair(options).await?;
        }
        Ok(())
    }
}
