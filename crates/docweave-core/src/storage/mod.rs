//! Storage contract and the composable adapters built on it
//!
//! Every adapter and every leaf backend implements [`Storage`]. Adapters
//! wrap other adapters to form a tree:
//!
//! - `memory`: in-memory leaf backend
//! - `union`: one logical document space over an ordered list of backends
//! - `crypt`: transparent encryption of attachment payloads
//! - `index`: secondary indices over a backend (see [`crate::index`])
//!
//! Operations a storage does not provide fall through to the default
//! methods, which fail with a 501 [`StorageError::NotImplemented`].

mod crypt;
mod error;
mod memory;
mod union;

pub use crypt::{CryptKey, CryptStorage, ENCRYPTED_CONTENT_TYPE};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;
pub use union::UnionStorage;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{Attachment, AttachmentInfo, Document, QueryOptions, QueryRow, RepairOptions};

/// Shared handle to a storage node
pub type SharedStorage = Arc<dyn Storage>;

/// The operation set every storage implements
#[async_trait]
pub trait Storage: Send + Sync {
    /// Registry name of this storage type
    fn storage_type(&self) -> &'static str;

    async fn get(&self, id: &str) -> StorageResult<Document> {
        let _ = id;
        Err(self.missing("get"))
    }

    /// Store a new document and return its generated id
    async fn post(&self, doc: Document) -> StorageResult<String> {
        let _ = doc;
        Err(self.missing("post"))
    }

    async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
        let _ = (id, doc);
        Err(self.missing("put"))
    }

    async fn remove(&self, id: &str) -> StorageResult<String> {
        let _ = id;
        Err(self.missing("remove"))
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StorageResult<Attachment> {
        let _ = (id, name);
        Err(self.missing("getAttachment"))
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        attachment: Attachment,
    ) -> StorageResult<()> {
        let _ = (id, name, attachment);
        Err(self.missing("putAttachment"))
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StorageResult<()> {
        let _ = (id, name);
        Err(self.missing("removeAttachment"))
    }

    async fn all_attachments(&self, id: &str) -> StorageResult<BTreeMap<String, AttachmentInfo>> {
        let _ = id;
        Err(self.missing("allAttachments"))
    }

    async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
        let _ = options;
        Err(self.missing("buildQuery"))
    }

    /// Report whether a capability is provided
    ///
    /// `Ok(false)` means "no"; a 501 error means the storage does not know.
    async fn has_capacity(&self, name: &str) -> StorageResult<bool> {
        Err(StorageError::capacity_not_implemented(
            name,
            self.storage_type(),
        ))
    }

    async fn repair(&self, options: &RepairOptions) -> StorageResult<()> {
        let _ = options;
        Err(self.missing("repair"))
    }

    #[doc(hidden)]
    fn missing(&self, operation: &str) -> StorageError {
        StorageError::operation_not_implemented(operation, self.storage_type())
    }
}
