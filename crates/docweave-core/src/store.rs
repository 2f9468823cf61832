//! Unified storage interface
//!
//! The `Store` owns the root of a storage tree built from configuration
//! and forwards every operation to it.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open()?;  // Builds the configured tree
//!
//! // Write through every adapter
//! store.put("note", doc).await?;
//!
//! // Query, checking capacities first
//! let all = store.all_docs(&QueryOptions::new().query("title:hello")).await?;
//! ```

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::config::Config;
use crate::models::{
    AllDocs, Attachment, AttachmentInfo, Document, QueryOptions, QueryRow, RepairOptions,
};
use crate::registry::StorageRegistry;
use crate::storage::{SharedStorage, StorageError, StorageResult};

/// Unified storage interface for docweave
pub struct Store {
    /// Root of the storage tree
    root: SharedStorage,
}

impl Store {
    /// Open the store described by the configuration on disk
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open the store with a specific configuration
    ///
    /// Without a `storage` description the tree is a single memory leaf.
    pub fn open_with_config(config: Config) -> Result<Self> {
        let registry = StorageRegistry::with_defaults(&config);
        Self::open_with_registry(&config, &registry)
    }

    /// Open the store, building the tree through a custom registry
    pub fn open_with_registry(config: &Config, registry: &StorageRegistry) -> Result<Self> {
        let description = config
            .storage
            .clone()
            .unwrap_or_else(|| json!({ "type": "memory" }));

        let root = registry
            .create(&description)
            .context("Failed to build storage tree")?;
        info!(root = %root.storage_type(), "Opened store");
        Ok(Self { root })
    }

    /// Wrap an already built storage tree
    pub fn from_storage(root: SharedStorage) -> Self {
        Self { root }
    }

    /// Get the root storage
    pub fn root(&self) -> &SharedStorage {
        &self.root
    }

    // ==================== Document Operations ====================

    pub async fn get(&self, id: &str) -> StorageResult<Document> {
        self.root.get(id).await
    }

    /// Store a new document, returning the id chosen by the leaf
    pub async fn post(&self, doc: Document) -> StorageResult<String> {
        self.root.post(doc).await
    }

    pub async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
        self.root.put(id, doc).await
    }

    pub async fn remove(&self, id: &str) -> StorageResult<String> {
        self.root.remove(id).await
    }

    // ==================== Attachment Operations ====================

    pub async fn get_attachment(&self, id: &str, name: &str) -> StorageResult<Attachment> {
        self.root.get_attachment(id, name).await
    }

    pub async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        attachment: Attachment,
    ) -> StorageResult<()> {
        self.root.put_attachment(id, name, attachment).await
    }

    pub async fn remove_attachment(&self, id: &str, name: &str) -> StorageResult<()> {
        self.root.remove_attachment(id, name).await
    }

    pub async fn all_attachments(
        &self,
        id: &str,
    ) -> StorageResult<BTreeMap<String, AttachmentInfo>> {
        self.root.all_attachments(id).await
    }

    // ==================== Queries ====================

    pub async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
        self.root.build_query(options).await
    }

    pub async fn has_capacity(&self, name: &str) -> StorageResult<bool> {
        self.root.has_capacity(name).await
    }

    /// List documents after checking the root provides what `options` asks for
    pub async fn all_docs(&self, options: &QueryOptions) -> StorageResult<AllDocs> {
        for capacity in required_capacities(options) {
            self.require(capacity).await?;
        }
        let rows = self.root.build_query(options).await?;
        Ok(AllDocs::from(rows))
    }

    async fn require(&self, capacity: &str) -> StorageResult<()> {
        let provided = match self.root.has_capacity(capacity).await {
            Ok(provided) => provided,
            Err(e) if e.is_not_implemented() => false,
            Err(e) => return Err(e),
        };
        if provided {
            Ok(())
        } else {
            Err(StorageError::capacity_not_implemented(
                capacity,
                self.root.storage_type(),
            ))
        }
    }

    // ==================== Maintenance ====================

    pub async fn repair(&self, options: &RepairOptions) -> StorageResult<()> {
        self.root.repair(options).await
    }
}

/// Capacities `all_docs` needs for `options`
fn required_capacities(options: &QueryOptions) -> Vec<&'static str> {
    let mut capacities = vec!["list"];
    if options.query.is_some() {
        capacities.push("query");
    }
    if options.select_list.is_some() {
        capacities.push("select");
    }
    if options.sort_on.is_some() {
        capacities.push("sort");
    }
    if options.limit.is_some() {
        capacities.push("limit");
    }
    if options.include_docs {
        capacities.push("include");
    }
    capacities
}
