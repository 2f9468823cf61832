//! Storage error handling
//!
//! Provides typed errors for storage operations. Every error carries a
//! status so callers can branch on "not found" versus "not implemented"
//! versus a backend failure without inspecting messages.

use std::io;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Requested document or attachment does not exist
    #[error("{0}")]
    NotFound(String),

    /// Operation or capability is not provided by the storage
    #[error("{what} is not implemented on '{storage}'")]
    NotImplemented { what: String, storage: String },

    /// Malformed storage description
    #[error("Bad storage configuration: {0}")]
    BadConfiguration(String),

    /// Query string could not be parsed
    #[error("Invalid query '{query}': {details}")]
    QuerySyntax { query: String, details: String },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transaction-level failure of the index store
    #[error("Connection to: {store} failed: {reason}")]
    Transaction { store: String, reason: String },

    /// Encryption failure
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// Replication engine failure
    #[error("Replication failed: {0}")]
    Replication(String),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Document lookup failure
    pub fn document_not_found(id: &str) -> Self {
        StorageError::NotFound(format!("Cannot find document: {}", id))
    }

    /// Attachment lookup failure
    pub fn attachment_not_found(id: &str, name: &str) -> Self {
        StorageError::NotFound(format!("Cannot find attachment: {} , {}", id, name))
    }

    /// An operation the storage does not provide
    pub fn operation_not_implemented(operation: &str, storage: &str) -> Self {
        StorageError::NotImplemented {
            what: format!("Method '{}'", operation),
            storage: storage.to_string(),
        }
    }

    /// A capability the storage does not provide
    pub fn capacity_not_implemented(capacity: &str, storage: &str) -> Self {
        StorageError::NotImplemented {
            what: format!("Capacity '{}'", capacity),
            storage: storage.to_string(),
        }
    }

    /// HTTP-like status code of this error
    pub fn status(&self) -> u16 {
        match self {
            StorageError::NotFound(_) => 404,
            StorageError::NotImplemented { .. } => 501,
            StorageError::BadConfiguration(_) | StorageError::QuerySyntax { .. } => 400,
            StorageError::Database(_)
            | StorageError::Serialization(_)
            | StorageError::Transaction { .. }
            | StorageError::Cipher(_)
            | StorageError::Replication(_)
            | StorageError::Backend(_)
            | StorageError::Io(_) => 500,
        }
    }

    /// Check if this error means the document or attachment is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Check if this error means the capability or operation is unknown
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, StorageError::NotImplemented { .. })
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::BadConfiguration(_) => {
                Some("Check the storage description: every node needs a 'type' and its required properties.")
            }
            StorageError::Transaction { .. } => {
                Some("The index will be rebuilt on the next open. Run repair if queries look stale.")
            }
            StorageError::NotImplemented { .. } => {
                Some("Wrap the storage in an adapter that provides the capability, or drop the option.")
            }
            _ => None,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(StorageError::document_not_found("a").status(), 404);
        assert_eq!(
            StorageError::capacity_not_implemented("query", "memory").status(),
            501
        );
        assert_eq!(StorageError::BadConfiguration("x".into()).status(), 400);
        assert_eq!(
            StorageError::QuerySyntax {
                query: "(".into(),
                details: "unbalanced".into()
            }
            .status(),
            400
        );
        assert_eq!(StorageError::Cipher("bad".into()).status(), 500);
        assert_eq!(
            StorageError::Transaction {
                store: "s".into(),
                reason: "r".into()
            }
            .status(),
            500
        );
    }

    #[test]
    fn test_predicates() {
        assert!(StorageError::attachment_not_found("a", "b").is_not_found());
        assert!(!StorageError::Backend("x".into()).is_not_found());
        assert!(StorageError::operation_not_implemented("get", "virtual").is_not_implemented());
    }

    #[test]
    fn test_capacity_message() {
        let err = StorageError::capacity_not_implemented("query", "memory");
        assert_eq!(
            err.to_string(),
            "Capacity 'query' is not implemented on 'memory'"
        );
    }

    #[test]
    fn test_transaction_display() {
        let err = StorageError::Transaction {
            store: "docweave:notes".to_string(),
            reason: "aborted".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("Connection to: docweave:notes failed"));
        assert!(msg.contains("aborted"));
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_from_rusqlite_error() {
        let err: StorageError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StorageError::Database(_)));
        assert_eq!(err.status(), 500);
    }
}
