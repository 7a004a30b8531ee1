//! Persistence of evidence records.
//!
//! The store is keyed by fingerprint and indexed by status (the
//! reconciler's working set) and by submitter. Exactly two writers touch
//! it: the merge engine inserts, the reconciler updates status through
//! compare-and-set.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{EvidenceRecord, EvidenceStatus, Fingerprint, StatusUpdate};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record not found: {0}")]
    NotFound(Fingerprint),

    #[error("Invalid status transition: {from} → {to}")]
    InvalidTransition {
        from: EvidenceStatus,
        to: EvidenceStatus,
    },

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),

    #[error("Store task failed: {0}")]
    Task(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Keyed evidence record store
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<EvidenceRecord>, StoreError>;

    /// Insert if absent. Returns false when the fingerprint already exists.
    async fn put(&self, record: &EvidenceRecord) -> Result<bool, StoreError>;

    /// Apply `update` only if the record's status is still `expected`.
    ///
    /// Returns `Ok(false)` when the status has moved on, and
    /// `Err(InvalidTransition)` when `expected -> update.status` is not an
    /// edge of the lifecycle.
    async fn compare_and_set_status(
        &self,
        fingerprint: &Fingerprint,
        expected: EvidenceStatus,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError>;

    async fn list_by_status(&self, status: EvidenceStatus) -> Result<Vec<EvidenceRecord>, StoreError>;

    /// Records of one submitter, ordered by capture time then fingerprint
    async fn list_by_submitter(&self, submitter_id: &str) -> Result<Vec<EvidenceRecord>, StoreError>;
}

/// Reject updates that are not lifecycle edges
pub(crate) fn check_transition(from: EvidenceStatus, to: EvidenceStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}
