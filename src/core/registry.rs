//! Fingerprint registry: admission checks for new registrations.
//!
//! The registry validates a submission against format rules and a snapshot
//! of the replica state, and produces a Pending candidate. It never writes
//! the replica state; the merge engine owns that.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{EvidenceMetadata, EvidenceRecord, Fingerprint, ReplicaState};

/// A registration as sent by a capture client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Hex-encoded 256-bit digest
    pub fingerprint: String,

    pub submitter_id: String,

    /// Capture time, unix milliseconds
    pub captured_at_ms: i64,

    pub origin_url: String,

    pub title: String,
}

/// Reasons a submission is refused at the boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Invalid fingerprint format: {0}")]
    InvalidFingerprintFormat(String),

    #[error("Invalid capture timestamp {captured_at_ms} (must be > 0 and <= {now_ms})")]
    InvalidTimestamp { captured_at_ms: i64, now_ms: i64 },

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Fingerprint already registered: {fingerprint} ({registration_id})")]
    DuplicateFingerprint {
        fingerprint: Fingerprint,
        registration_id: Uuid,
        /// The existing record carries exactly the submitted payload
        same_payload: bool,
    },
}

impl RegistryError {
    /// Error code reported to capture clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFingerprintFormat(_) => "InvalidFingerprintFormat",
            Self::InvalidTimestamp { .. } => "InvalidTimestamp",
            Self::InvalidMetadata(_) => "InvalidMetadata",
            Self::DuplicateFingerprint { .. } => "DuplicateFingerprint",
        }
    }
}

/// Validated, not yet merged submission
#[derive(Debug, Clone)]
pub struct ValidatedSubmission {
    pub fingerprint: Fingerprint,
    pub metadata: EvidenceMetadata,
}

/// Gatekeeper for admission of new candidates
#[derive(Debug, Clone, Default)]
pub struct Registry;

impl Registry {
    pub fn new() -> Self {
        Self
    }

    /// Validate format, timestamp and metadata. No state is consulted.
    pub fn validate(
        &self,
        request: &SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<ValidatedSubmission, RegistryError> {
        let fingerprint = Fingerprint::parse(&request.fingerprint)
            .map_err(|e| RegistryError::InvalidFingerprintFormat(e.to_string()))?;

        let now_ms = now.timestamp_millis();
        let invalid_timestamp = || RegistryError::InvalidTimestamp {
            captured_at_ms: request.captured_at_ms,
            now_ms,
        };
        if request.captured_at_ms <= 0 || request.captured_at_ms > now_ms {
            return Err(invalid_timestamp());
        }
        let captured_at = Utc
            .timestamp_millis_opt(request.captured_at_ms)
            .single()
            .ok_or_else(invalid_timestamp)?;

        let metadata = EvidenceMetadata {
            submitter_id: request.submitter_id.clone(),
            captured_at,
            origin_url: request.origin_url.clone(),
            title: request.title.clone(),
        };
        metadata.validate().map_err(RegistryError::InvalidMetadata)?;

        Ok(ValidatedSubmission {
            fingerprint,
            metadata,
        })
    }

    /// Admit a submission against a snapshot, producing a Pending candidate.
    ///
    /// A fingerprint already in the snapshot is refused with
    /// `DuplicateFingerprint`, including an identical resubmission.
    pub fn submit(
        &self,
        snapshot: &ReplicaState,
        request: &SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<EvidenceRecord, RegistryError> {
        let submission = self.validate(request, now)?;

        if let Some(existing) = snapshot.get(&submission.fingerprint) {
            return Err(RegistryError::DuplicateFingerprint {
                fingerprint: submission.fingerprint.clone(),
                registration_id: existing.registration_id,
                same_payload: existing.same_payload(&submission.fingerprint, &submission.metadata),
            });
        }

        Ok(EvidenceRecord::candidate(
            submission.fingerprint,
            submission.metadata,
            now,
        ))
    }
}
