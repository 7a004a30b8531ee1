//! Types exchanged with the external confirmation source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fingerprint::Fingerprint;
use super::record::EvidenceRecord;

/// What gets anchored on the ledger for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPayload {
    pub fingerprint: Fingerprint,
    pub registration_id: Uuid,
    pub submitter_id: String,
    pub captured_at: DateTime<Utc>,
}

impl From<&EvidenceRecord> for LedgerPayload {
    fn from(record: &EvidenceRecord) -> Self {
        Self {
            fingerprint: record.fingerprint.clone(),
            registration_id: record.registration_id,
            submitter_id: record.metadata.submitter_id.clone(),
            captured_at: record.metadata.captured_at,
        }
    }
}

/// Confirmation state reported by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    /// Included but not yet final
    Pending,

    /// Final; no further confirmation needed
    Final,

    /// The ledger refused the submission
    Rejected,
}

/// Answer to a status check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub state: LedgerState,

    #[serde(default)]
    pub confirmations: u64,

    /// Rejection reason, if the ledger gave one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LedgerStatus {
    pub fn pending(confirmations: u64) -> Self {
        Self {
            state: LedgerState::Pending,
            confirmations,
            reason: None,
        }
    }

    pub fn finalized(confirmations: u64) -> Self {
        Self {
            state: LedgerState::Final,
            confirmations,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            state: LedgerState::Rejected,
            confirmations: 0,
            reason: Some(reason.into()),
        }
    }
}
