//! In-memory leaf backend
//!
//! Keeps documents and attachments in process memory. Used as the default
//! leaf of a storage tree and as the backend of most tests.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::{Storage, StorageError, StorageResult};
use crate::models::{
    Attachment, AttachmentInfo, Document, QueryOptions, QueryRow, RepairOptions, SortOrder,
};
use crate::query::Query;

const CAPACITIES: &[&str] = &["list", "query", "select", "limit", "sort", "include"];

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Document>,
    attachments: HashMap<String, BTreeMap<String, Attachment>>,
}

/// Leaf backend holding everything in memory
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps half-written
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn storage_type(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, id: &str) -> StorageResult<Document> {
        self.lock()
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::document_not_found(id))
    }

    async fn post(&self, doc: Document) -> StorageResult<String> {
        let id = Uuid::new_v4().to_string();
        self.lock().docs.insert(id.clone(), doc);
        debug!(id = %id, "Posted document");
        Ok(id)
    }

    async fn put(&self, id: &str, doc: Document) -> StorageResult<String> {
        self.lock().docs.insert(id.to_string(), doc);
        Ok(id.to_string())
    }

    async fn remove(&self, id: &str) -> StorageResult<String> {
        let mut inner = self.lock();
        if inner.docs.remove(id).is_none() {
            return Err(StorageError::document_not_found(id));
        }
        inner.attachments.remove(id);
        Ok(id.to_string())
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StorageResult<Attachment> {
        self.lock()
            .attachments
            .get(id)
            .and_then(|by_name| by_name.get(name))
            .cloned()
            .ok_or_else(|| StorageError::attachment_not_found(id, name))
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        attachment: Attachment,
    ) -> StorageResult<()> {
        let mut inner = self.lock();
        if !inner.docs.contains_key(id) {
            return Err(StorageError::document_not_found(id));
        }
        inner
            .attachments
            .entry(id.to_string())
            .or_default()
            .insert(name.to_string(), attachment);
        Ok(())
    }

    async fn remove_attachment(&self, id: &str, name: &str) -> StorageResult<()> {
        let mut inner = self.lock();
        let removed = inner
            .attachments
            .get_mut(id)
            .and_then(|by_name| by_name.remove(name));
        match removed {
            Some(_) => Ok(()),
            None => Err(StorageError::attachment_not_found(id, name)),
        }
    }

    async fn all_attachments(&self, id: &str) -> StorageResult<BTreeMap<String, AttachmentInfo>> {
        let inner = self.lock();
        if !inner.docs.contains_key(id) {
            return Err(StorageError::document_not_found(id));
        }
        Ok(inner
            .attachments
            .get(id)
            .map(|by_name| {
                by_name
                    .iter()
                    .map(|(name, attachment)| (name.clone(), attachment.info()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn build_query(&self, options: &QueryOptions) -> StorageResult<Vec<QueryRow>> {
        let query = options.query.as_deref().map(Query::parse).transpose()?;

        let mut matching: Vec<(String, Document)> = {
            let inner = self.lock();
            inner
                .docs
                .iter()
                .filter(|(_, doc)| query.as_ref().map_or(true, |q| q.matches(doc)))
                .map(|(id, doc)| (id.clone(), doc.clone()))
                .collect()
        };

        if let Some(sort_on) = &options.sort_on {
            matching.sort_by(|(_, a), (_, b)| {
                for criterion in sort_on {
                    let ordering = compare_values(a.get(&criterion.key), b.get(&criterion.key));
                    let ordering = match criterion.order {
                        SortOrder::Ascending => ordering,
                        SortOrder::Descending => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        if let Some([start, end]) = options.limit {
            matching = matching
                .into_iter()
                .skip(start)
                .take(end.saturating_sub(start))
                .collect();
        }

        Ok(matching
            .into_iter()
            .map(|(id, doc)| {
                let value = match &options.select_list {
                    Some(keys) => keys
                        .iter()
                        .filter_map(|key| doc.get(key).map(|v| (key.clone(), v.clone())))
                        .collect(),
                    None => Document::new(),
                };
                QueryRow {
                    id,
                    value,
                    doc: options.include_docs.then_some(doc),
                }
            })
            .collect())
    }

    async fn has_capacity(&self, name: &str) -> StorageResult<bool> {
        Ok(CAPACITIES.contains(&name))
    }

    async fn repair(&self, _options: &RepairOptions) -> StorageResult<()> {
        Ok(())
    }
}

/// Total order over optional JSON values: missing < null < bool < number < string
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
