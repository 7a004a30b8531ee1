//! Evidence records and their status lifecycle.
//!
//! A record is created once per fingerprint and never deleted. Its status
//! only ever moves forward:
//!
//! ```text
//! Pending -> Submitted -> AwaitingConfirmation -> Finalized
//!                 \               \
//!                  +-------------->+-> Errored
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::fingerprint::Fingerprint;

/// Maximum title length, in characters
pub const MAX_TITLE_CHARS: usize = 500;

/// Maximum origin URL length, in characters
pub const MAX_ORIGIN_URL_CHARS: usize = 2048;

/// Maximum submitter id length, in characters
pub const MAX_SUBMITTER_CHARS: usize = 256;

/// Namespace for deterministic registration ids
const REGISTRATION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b8e_4d3a_5e90_a7b1_c4d2_e5f6_0718);

/// Lifecycle status of an evidence record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    /// Validated by the registry, not yet merged
    Pending,

    /// Accepted into the replicated registry
    Submitted,

    /// Anchored on the ledger, waiting for finality
    AwaitingConfirmation,

    /// Final on the ledger (terminal)
    Finalized,

    /// Permanently failed (terminal)
    Errored,
}

impl EvidenceStatus {
    pub const ALL: [EvidenceStatus; 5] = [
        Self::Pending,
        Self::Submitted,
        Self::AwaitingConfirmation,
        Self::Finalized,
        Self::Errored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Finalized => "finalized",
            Self::Errored => "errored",
        }
    }

    /// Finalized and Errored admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Errored)
    }

    /// Whether a record in this status is work for the reconciler
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Self::Submitted | Self::AwaitingConfirmation)
    }

    /// Edges of the lifecycle graph.
    ///
    /// AwaitingConfirmation may transition to itself so confirmation
    /// progress can be recorded without a status change.
    pub fn can_transition_to(&self, next: EvidenceStatus) -> bool {
        use EvidenceStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Submitted, AwaitingConfirmation)
                | (Submitted, Errored)
                | (AwaitingConfirmation, AwaitingConfirmation)
                | (AwaitingConfirmation, Finalized)
                | (AwaitingConfirmation, Errored)
        )
    }
}

impl fmt::Display for EvidenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvidenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Unknown evidence status: {}", s))
    }
}

/// Caller-supplied part of a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    /// Opaque identity of the submitter
    pub submitter_id: String,

    /// When the document was captured
    pub captured_at: DateTime<Utc>,

    /// Page the document was captured from
    pub origin_url: String,

    /// Document title
    pub title: String,
}

impl EvidenceMetadata {
    /// Check bounds on the free-text fields
    pub fn validate(&self) -> Result<(), String> {
        check_text("submitter_id", &self.submitter_id, MAX_SUBMITTER_CHARS)?;
        check_text("origin_url", &self.origin_url, MAX_ORIGIN_URL_CHARS)?;
        check_text("title", &self.title, MAX_TITLE_CHARS)?;
        Ok(())
    }
}

fn check_text(field: &str, value: &str, max_chars: usize) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} must not be empty", field));
    }

    let len = value.chars().count();
    if len > max_chars {
        return Err(format!("{} is {} characters, limit is {}", field, len, max_chars));
    }

    Ok(())
}

/// The durable record of one registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Identity key, immutable
    pub fingerprint: Fingerprint,

    /// Assigned once, derived from the candidate payload
    pub registration_id: Uuid,

    #[serde(flatten)]
    pub metadata: EvidenceMetadata,

    pub status: EvidenceStatus,

    /// Ledger transaction reference, set once the fingerprint is submitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_reference: Option<String>,

    /// Never decreases
    pub confirmation_count: u64,

    /// Set only when the record is Errored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvidenceRecord {
    /// Build a Pending candidate for the merge engine
    pub fn candidate(fingerprint: Fingerprint, metadata: EvidenceMetadata, now: DateTime<Utc>) -> Self {
        let registration_id = registration_id(&fingerprint, &metadata);

        Self {
            fingerprint,
            registration_id,
            metadata,
            status: EvidenceStatus::Pending,
            ledger_reference: None,
            confirmation_count: 0,
            error_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Same fingerprint and same caller-supplied metadata
    pub fn same_payload(&self, fingerprint: &Fingerprint, metadata: &EvidenceMetadata) -> bool {
        &self.fingerprint == fingerprint && &self.metadata == metadata
    }

    /// Apply a status update in place. The caller has already checked the transition.
    pub fn apply(&mut self, update: &StatusUpdate) {
        self.status = update.status;
        if let Some(ref reference) = update.ledger_reference {
            self.ledger_reference = Some(reference.clone());
        }
        if let Some(count) = update.confirmation_count {
            self.confirmation_count = self.confirmation_count.max(count);
        }
        if update.error_info.is_some() {
            self.error_info = update.error_info.clone();
        }
        self.updated_at = update.updated_at;
    }
}

/// Deterministic registration id: UUIDv5 over the canonical candidate payload
pub fn registration_id(fingerprint: &Fingerprint, metadata: &EvidenceMetadata) -> Uuid {
    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}",
        fingerprint,
        metadata.submitter_id,
        metadata.captured_at.timestamp_millis(),
        metadata.origin_url,
        metadata.title
    );
    Uuid::new_v5(&REGISTRATION_NAMESPACE, canonical.as_bytes())
}

/// Fields written together with a status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: EvidenceStatus,
    pub ledger_reference: Option<String>,
    pub confirmation_count: Option<u64>,
    pub error_info: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(status: EvidenceStatus, updated_at: DateTime<Utc>) -> Self {
        Self {
            status,
            ledger_reference: None,
            confirmation_count: None,
            error_info: None,
            updated_at,
        }
    }

    pub fn with_ledger_reference(mut self, reference: impl Into<String>) -> Self {
        self.ledger_reference = Some(reference.into());
        self
    }

    pub fn with_confirmations(mut self, count: u64) -> Self {
        self.confirmation_count = Some(count);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_info = Some(error.into());
        self
    }
}
