//! Submission entry point: registry admission followed by a merge.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use super::engine::{MergeEngine, MergeError};
use super::registry::{Registry, RegistryError, SubmitRequest};
use crate::domain::{EvidenceRecord, EvidenceStatus, Fingerprint};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    /// Error code for capture clients; infrastructure failures are "Internal"
    pub fn code(&self) -> &'static str {
        match self {
            Self::Registry(e) => e.code(),
            Self::Merge(_) | Self::Store(_) => "Internal",
        }
    }
}

/// Answer to a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub registration_id: Uuid,
    pub fingerprint: Fingerprint,
    pub status: EvidenceStatus,

    /// False when this was an identical resubmission
    pub created: bool,
}

/// Registry + merge engine behind one call
pub struct Attestor {
    registry: Registry,
    engine: Arc<MergeEngine>,
}

impl Attestor {
    pub fn new(engine: Arc<MergeEngine>) -> Self {
        Self {
            registry: Registry::new(),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        self.submit_at(request, Utc::now()).await
    }

    /// Submit with an explicit clock reading.
    ///
    /// Resubmitting an identical payload returns the existing registration
    /// with `created: false`. A different payload for a registered
    /// fingerprint is `DuplicateFingerprint`.
    #[instrument(skip(self, request), fields(fingerprint = %request.fingerprint))]
    pub async fn submit_at(&self, request: SubmitRequest, now: DateTime<Utc>) -> Result<SubmitReceipt, SubmitError> {
        let snapshot = self.engine.snapshot();

        let candidate = match self.registry.submit(&snapshot, &request, now) {
            Ok(candidate) => candidate,
            Err(RegistryError::DuplicateFingerprint {
                fingerprint,
                same_payload: true,
                ..
            }) => {
                let existing = snapshot.get(&fingerprint).cloned().ok_or_else(|| {
                    MergeError::InvariantViolation(format!("snapshot lost {}", fingerprint))
                })?;
                return self.receipt(&existing, false).await;
            }
            Err(e) => return Err(e.into()),
        };

        let report = self.engine.apply_batch(vec![candidate.clone()]).await?;
        let created = report
            .accepted
            .iter()
            .any(|r| r.registration_id == candidate.registration_id);

        let snapshot = self.engine.snapshot();
        let winner = snapshot.get(&candidate.fingerprint).cloned().ok_or_else(|| {
            MergeError::InvariantViolation(format!(
                "validated candidate {} missing after merge",
                candidate.fingerprint
            ))
        })?;

        // Lost a race against a concurrent batch
        if winner.registration_id != candidate.registration_id {
            let same_payload = winner.same_payload(&candidate.fingerprint, &candidate.metadata);
            if !same_payload {
                return Err(RegistryError::DuplicateFingerprint {
                    fingerprint: winner.fingerprint.clone(),
                    registration_id: winner.registration_id,
                    same_payload,
                }
                .into());
            }
        }

        if created {
            info!(registration_id = %winner.registration_id, "Registered fingerprint");
        }
        self.receipt(&winner, created).await
    }

    /// Receipt carrying the freshest known status
    async fn receipt(&self, record: &EvidenceRecord, created: bool) -> Result<SubmitReceipt, SubmitError> {
        self.engine.sync_store().await?;
        let status = match self.engine.store().get(&record.fingerprint).await? {
            Some(stored) => stored.status,
            None => record.status,
        };

        Ok(SubmitReceipt {
            registration_id: record.registration_id,
            fingerprint: record.fingerprint.clone(),
            status,
            created,
        })
    }
}
