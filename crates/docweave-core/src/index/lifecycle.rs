//! Open-cycle state machine of an index

use std::fmt;

use crate::storage::{StorageError, StorageResult};

/// State of one open cycle of an index store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Closed,
    Opening,
    Upgrading,
    Repairing,
    Ready,
    Aborted,
}

impl IndexState {
    /// Whether `next` may follow `self`
    pub fn can_advance_to(self, next: IndexState) -> bool {
        use IndexState::*;
        matches!(
            (self, next),
            (Closed, Opening)
                | (Opening, Upgrading)
                | (Opening, Ready)
                | (Upgrading, Repairing)
                | (Upgrading, Ready)
                | (Repairing, Ready)
                | (Ready, Repairing)
                | (Ready, Closed)
                | (Aborted, Closed)
                | (Opening | Upgrading | Repairing | Ready, Aborted)
        )
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexState::Closed => "closed",
            IndexState::Opening => "opening",
            IndexState::Upgrading => "upgrading",
            IndexState::Repairing => "repairing",
            IndexState::Ready => "ready",
            IndexState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Tracks the state of a single open cycle
#[derive(Debug)]
pub struct Lifecycle {
    state: IndexState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: IndexState::Closed,
        }
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn advance(&mut self, next: IndexState) -> StorageResult<IndexState> {
        if !self.state.can_advance_to(next) {
            return Err(StorageError::Backend(format!(
                "invalid index transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(next)
    }
}
