//! Data models for docweave
//!
//! Documents are ordered JSON objects addressed by an opaque string id.
//! Attachments are opaque byte payloads with a MIME type, addressed by
//! (document id, name).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Document metadata: an ordered mapping of string keys to JSON values
pub type Document = serde_json::Map<String, Value>;

/// A named binary payload attached to a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// MIME type label
    pub content_type: String,
    /// Raw payload
    pub data: Vec<u8>,
}

impl Attachment {
    /// Create an attachment from a MIME type and payload
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Metadata describing this attachment
    pub fn info(&self) -> AttachmentInfo {
        AttachmentInfo {
            content_type: self.content_type.clone(),
            length: self.data.len(),
        }
    }
}

/// Metadata reported by `all_attachments`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub content_type: String,
    pub length: usize,
}

/// Sort direction for one key of `sort_on`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One sort criterion: a document key and a direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOn {
    pub key: String,
    pub order: SortOrder,
}

/// Options accepted by `build_query`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Query string (see [`crate::query`])
    pub query: Option<String>,
    /// Keys copied from each matching document into the row value
    pub select_list: Option<Vec<String>>,
    /// Sort criteria, most significant first
    pub sort_on: Option<Vec<SortOn>>,
    /// Row window `[start, end)`
    pub limit: Option<[usize; 2]>,
    /// Attach the full document to each row
    pub include_docs: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn select<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select_list = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn sort(mut self, key: impl Into<String>, order: SortOrder) -> Self {
        self.sort_on.get_or_insert_with(Vec::new).push(SortOn {
            key: key.into(),
            order,
        });
        self
    }

    pub fn limit(mut self, start: usize, end: usize) -> Self {
        self.limit = Some([start, end]);
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    /// True when the options ask for nothing beyond a plain listing
    pub fn is_plain_listing(&self) -> bool {
        self.query.is_none()
            && self.select_list.is_none()
            && self.sort_on.is_none()
            && self.limit.is_none()
            && !self.include_docs
    }
}

/// One row of a `build_query` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    pub id: String,
    /// Selected values (empty unless a select list was given)
    pub value: Document,
    /// Full document when `include_docs` was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

impl QueryRow {
    /// A row carrying only the id
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: Document::new(),
            doc: None,
        }
    }
}

/// Options accepted by `repair`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairOptions {}

/// Result of `Store::all_docs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllDocs {
    pub total_rows: usize,
    pub rows: Vec<QueryRow>,
}

impl From<Vec<QueryRow>> for AllDocs {
    fn from(rows: Vec<QueryRow>) -> Self {
        Self {
            total_rows: rows.len(),
            rows,
        }
    }
}
