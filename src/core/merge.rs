//! Deterministic replica merge.
//!
//! `combine` folds a batch of candidate updates into the next replica state.
//! It is pure: no clock, no I/O. Updates are sorted by a total tie-break key
//! before they are applied, so any permutation of the same batch yields the
//! same registry. The first update for a fingerprint wins; later ones are
//! discarded.

use std::cmp::Ordering;

use tracing::warn;
use uuid::Uuid;

use crate::domain::{EvidenceRecord, EvidenceStatus, Fingerprint, ReplicaState};

/// Why an update did not make it into the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Fingerprint already present (prior state or earlier in the batch)
    AlreadyRegistered,

    /// Update failed the admission rules
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discarded {
    pub fingerprint: Fingerprint,
    pub registration_id: Uuid,
    pub reason: DiscardReason,
}

/// Result of one combine step
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub state: ReplicaState,

    /// Accepted records in application order, already Submitted
    pub accepted: Vec<EvidenceRecord>,

    pub discarded: Vec<Discarded>,
}

/// Total order used to apply a batch: capture time, then fingerprint, then
/// the remaining payload so that fully tied keys still order the same way
/// on every replica.
pub fn tie_break(a: &EvidenceRecord, b: &EvidenceRecord) -> Ordering {
    a.metadata
        .captured_at
        .cmp(&b.metadata.captured_at)
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        .then_with(|| a.metadata.submitter_id.cmp(&b.metadata.submitter_id))
        .then_with(|| a.metadata.origin_url.cmp(&b.metadata.origin_url))
        .then_with(|| a.metadata.title.cmp(&b.metadata.title))
        .then_with(|| a.registration_id.cmp(&b.registration_id))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Fold `updates` into `current`
pub fn combine(current: &ReplicaState, updates: Vec<EvidenceRecord>) -> ReplicaState {
    combine_with_report(current, updates).state
}

/// Fold `updates` into `current`, reporting what was accepted and discarded
pub fn combine_with_report(current: &ReplicaState, mut updates: Vec<EvidenceRecord>) -> MergeOutcome {
    updates.sort_by(tie_break);

    let mut state = current.clone();
    let mut accepted = Vec::new();
    let mut discarded = Vec::new();

    for update in updates {
        if let Err(reason) = check_update(&update) {
            warn!(
                fingerprint = %update.fingerprint,
                registration_id = %update.registration_id,
                %reason,
                "Discarding malformed update"
            );
            discarded.push(Discarded {
                fingerprint: update.fingerprint,
                registration_id: update.registration_id,
                reason: DiscardReason::Malformed(reason),
            });
            continue;
        }

        if state.contains(&update.fingerprint) {
            discarded.push(Discarded {
                fingerprint: update.fingerprint,
                registration_id: update.registration_id,
                reason: DiscardReason::AlreadyRegistered,
            });
            continue;
        }

        let mut record = update;
        record.status = EvidenceStatus::Submitted;

        if state.accept(record.clone()) {
            accepted.push(record);
        }
    }

    MergeOutcome {
        state,
        accepted,
        discarded,
    }
}

/// Admission rules that do not need a clock
fn check_update(update: &EvidenceRecord) -> Result<(), String> {
    if update.status != EvidenceStatus::Pending {
        return Err(format!("expected pending candidate, got {}", update.status));
    }
    if update.metadata.captured_at.timestamp_millis() <= 0 {
        return Err("capture timestamp must be positive".to_string());
    }
    if update.ledger_reference.is_some() || update.error_info.is_some() {
        return Err("candidate carries ledger state".to_string());
    }
    update.metadata.validate()
}
