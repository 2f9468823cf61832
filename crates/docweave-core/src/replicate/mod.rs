//! One-way replication between two storages
//!
//! Drives a `remote` storage to mirror a `local` one. Local always wins:
//! remote documents are overwritten and remote-only ids are removed.
//!
//! Both modes list the remote and remove every id the local side lacks.
//!
//! - `Full` forgets every signature and pushes every local document.
//! - `Incremental` only pushes documents whose signature changed.

mod signature;

pub use signature::{signature, SignatureStore, Signatures};

use std::collections::HashSet;

use tracing::{debug, info};

use crate::models::QueryOptions;
use crate::storage::{SharedStorage, StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    Full,
    Incremental,
}

/// Counts of what a replication run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    pub pushed: usize,
    pub removed: usize,
    pub skipped: usize,
}

pub struct Replication {
    local: SharedStorage,
    remote: SharedStorage,
    signatures: Signatures,
    mode: ReplicationMode,
}

impl Replication {
    pub fn new(
        local: SharedStorage,
        remote: SharedStorage,
        signatures: Signatures,
        mode: ReplicationMode,
    ) -> Self {
        Self {
            local,
            remote,
            signatures,
            mode,
        }
    }

    /// Run to completion, handing back the updated signatures
    pub async fn run(mut self) -> StorageResult<(ReplicationReport, Signatures)> {
        let mut report = ReplicationReport::default();

        let local_ids: Vec<String> = self
            .local
            .build_query(&QueryOptions::default())
            .await
            .map_err(|e| failure("listing local documents", e))?
            .into_iter()
            .map(|row| row.id)
            .collect();
        let local_set: HashSet<&str> = local_ids.iter().map(String::as_str).collect();

        if self.mode == ReplicationMode::Full {
            self.signatures.clear();
        }

        let stale: Vec<String> = self
            .remote
            .build_query(&QueryOptions::default())
            .await
            .map_err(|e| failure("listing remote documents", e))?
            .into_iter()
            .map(|row| row.id)
            .filter(|id| !local_set.contains(id.as_str()))
            .collect();

        // Signatures of documents that left both sides
        for id in self.signatures.ids() {
            if !local_set.contains(id.as_str()) && !stale.contains(&id) {
                self.signatures.remove(&id);
            }
        }

        for id in stale {
            match self.remote.remove(&id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(failure(&format!("removing '{}'", id), e)),
            }
            self.signatures.remove(&id);
            report.removed += 1;
        }

        for id in &local_ids {
            let doc = match self.local.get(id).await {
                Ok(doc) => doc,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(failure(&format!("reading '{}'", id), e)),
            };

            let hash = signature(&doc)?;
            if self.mode == ReplicationMode::Incremental
                && self.signatures.get(id) == Some(hash.as_str())
            {
                report.skipped += 1;
                continue;
            }

            self.remote
                .put(id, doc)
                .await
                .map_err(|e| failure(&format!("pushing '{}'", id), e))?;
            self.signatures.put(id, hash);
            report.pushed += 1;
            debug!(id = %id, "Pushed document");
        }

        info!(
            mode = ?self.mode,
            pushed = report.pushed,
            removed = report.removed,
            skipped = report.skipped,
            "Replication finished"
        );
        Ok((report, self.signatures))
    }
}

fn failure(step: &str, error: StorageError) -> StorageError {
    match error {
        StorageError::Replication(_) => error,
        other => StorageError::Replication(format!("{}: {}", step, other)),
    }
}
