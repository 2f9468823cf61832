//! docweave core library
//!
//! Composable document storage. Every backend and every adapter implements
//! the same asynchronous [`Storage`] contract, so adapters stack into a tree
//! that callers use as if it were a single store.
//!
//! # Architecture
//!
//! - **Union**: several storages presented as one document space
//! - **Crypt**: attachment payloads encrypted with AES-256-GCM
//! - **Index**: secondary indices in SQLite, rebuilt by replicating the
//!   sub-storage inside one transaction
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open_with_config(Config::load()?)?;
//!
//! store.put("note", doc).await?;
//! let rows = store.build_query(&QueryOptions::new().query("title:hello")).await?;
//! ```
//!
//! # Modules
//!
//! - `store`: Unified storage interface (main entry point)
//! - `registry`: Building storage trees from descriptions
//! - `storage`: The contract plus the memory, union and crypt storages
//! - `index`: Index storage and its transactional key store
//! - `replicate`: One-way replication with signatures
//! - `query`: Query language
//! - `models`: Documents, attachments and query options
//! - `config`: Application configuration

pub mod config;
pub mod index;
pub mod models;
pub mod query;
pub mod registry;
pub mod replicate;
pub mod storage;
pub mod store;

pub use config::Config;
pub use index::lifecycle::IndexState;
pub use index::{IndexOptions, IndexStorage, RepairReport};
pub use models::{AllDocs, Attachment, AttachmentInfo, Document, QueryOptions, QueryRow, SortOrder};
pub use query::Query;
pub use registry::StorageRegistry;
pub use replicate::{Replication, ReplicationMode, ReplicationReport};
pub use storage::{
    CryptKey, CryptStorage, MemoryStorage, SharedStorage, Storage, StorageError, StorageResult,
    UnionStorage,
};
pub use store::Store;
