//! Read-only verification queries.
//!
//! Queries read the latest committed snapshot and the local store. They
//! never take the merge lock, so they run in parallel with merges and
//! reconciliation and see whatever was last committed.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use super::engine::MergeEngine;
use crate::domain::{EvidenceRecord, EvidenceStatus, Fingerprint};
use crate::store::{EvidenceStore, StoreError};

/// Answer to "is this fingerprint registered, and how far along is it"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub fingerprint: Fingerprint,
    pub found: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EvidenceStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_reference: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
}

impl VerificationResult {
    pub fn not_found(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            found: false,
            registration_id: None,
            status: None,
            ledger_reference: None,
            confirmation_count: None,
            error_info: None,
        }
    }

    pub fn from_record(record: &EvidenceRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            found: true,
            registration_id: Some(record.registration_id),
            status: Some(record.status),
            ledger_reference: record.ledger_reference.clone(),
            confirmation_count: Some(record.confirmation_count),
            error_info: record.error_info.clone(),
        }
    }
}

/// Read path over the replica snapshot and the record store
pub struct QueryService {
    engine: Arc<MergeEngine>,
    store: Arc<dyn EvidenceStore>,
}

impl QueryService {
    pub fn new(engine: Arc<MergeEngine>) -> Self {
        let store = engine.store();
        Self { engine, store }
    }

    /// Look a fingerprint up. A miss is `found: false`, not an error.
    pub async fn verify(&self, fingerprint: &Fingerprint) -> Result<VerificationResult, StoreError> {
        let snapshot = self.engine.snapshot();
        let Some(merged) = snapshot.get(fingerprint) else {
            return Ok(VerificationResult::not_found(fingerprint.clone()));
        };

        // The store carries reconciliation progress the snapshot does not
        match self.store.get(fingerprint).await? {
            Some(local) => Ok(VerificationResult::from_record(&local)),
            None => Ok(VerificationResult::from_record(merged)),
        }
    }

    /// Every record of one submitter, by capture time
    pub async fn list_by_submitter(&self, submitter_id: &str) -> Result<Vec<EvidenceRecord>, StoreError> {
        self.store.list_by_submitter(submitter_id).await
    }
}
