//! Building storage trees from descriptions
//!
//! A description is a JSON object whose `type` names a registered
//! constructor. Adapters describe their children under `sub_storage`
//! (one child) or `storage_list` (several), which are built recursively
//! through the same registry:
//!
//! ```json
//! {
//!   "type": "index",
//!   "database": "notes",
//!   "index_keys": ["title"],
//!   "sub_storage": { "type": "crypt", "key": "secret",
//!                    "sub_storage": { "type": "memory" } }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::index::{IndexOptions, IndexStorage};
use crate::storage::{
    CryptKey, CryptStorage, MemoryStorage, SharedStorage, StorageError, StorageResult,
    UnionStorage,
};

/// Constructor of one storage type
pub type StorageConstructor =
    Arc<dyn Fn(&Value, &StorageRegistry) -> StorageResult<SharedStorage> + Send + Sync>;

/// Map from storage type name to constructor
#[derive(Default, Clone)]
pub struct StorageRegistry {
    constructors: HashMap<String, StorageConstructor>,
}

impl StorageRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `memory`, `union`, `crypt` and `index` types
    pub fn with_defaults(config: &Config) -> Self {
        let mut registry = Self::new();

        registry.register("memory", |_, _| Ok(Arc::new(MemoryStorage::new())));

        registry.register("union", |description, registry| {
            let storages = registry.storage_list(description)?;
            Ok(Arc::new(UnionStorage::new(storages)?))
        });

        registry.register("crypt", |description, registry| {
            let key = CryptKey::from_value(description.get("key").unwrap_or(&Value::Null))?;
            let sub = registry.sub_storage(description)?;
            Ok(Arc::new(CryptStorage::new(sub, key)))
        });

        let config = config.clone();
        registry.register("index", move |description, registry| {
            let options = IndexOptions::from_description(description)?;
            let sub = registry.sub_storage(description)?;
            Ok(Arc::new(IndexStorage::new(options, sub, &config)))
        });

        registry
    }

    /// Register (or replace) the constructor of `type_name`
    pub fn register<F>(&mut self, type_name: &str, constructor: F)
    where
        F: Fn(&Value, &StorageRegistry) -> StorageResult<SharedStorage> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// Build the storage tree rooted at `description`
    pub fn create(&self, description: &Value) -> StorageResult<SharedStorage> {
        let type_name = description
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StorageError::BadConfiguration(
                    "storage description needs a 'type' string".to_string(),
                )
            })?;

        let constructor = self.constructors.get(type_name).ok_or_else(|| {
            StorageError::BadConfiguration(format!("Unknown storage '{}'", type_name))
        })?;

        debug!(storage = %type_name, "Creating storage");
        constructor(description, self)
    }

    /// Build the `sub_storage` child of `description`
    pub fn sub_storage(&self, description: &Value) -> StorageResult<SharedStorage> {
        let sub = description.get("sub_storage").ok_or_else(|| {
            StorageError::BadConfiguration("missing 'sub_storage'".to_string())
        })?;
        self.create(sub)
    }

    /// Build the `storage_list` children of `description`, in order
    pub fn storage_list(&self, description: &Value) -> StorageResult<Vec<SharedStorage>> {
        match description.get("storage_list") {
            Some(Value::Array(list)) => list.iter().map(|child| self.create(child)).collect(),
            _ => Err(StorageError::BadConfiguration(
                "'storage_list' must be an array".to_string(),
            )),
        }
    }
}
