//! Canonical replicated registry view.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::fingerprint::Fingerprint;
use super::record::EvidenceRecord;

/// The merged registry held by one replica.
///
/// Keys are ordered so two replicas holding the same records serialize to
/// the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    registry: BTreeMap<Fingerprint, EvidenceRecord>,

    /// Incremented once per accepted update
    last_merged_sequence: u64,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&EvidenceRecord> {
        self.registry.get(fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.registry.contains_key(fingerprint)
    }

    /// Number of registered fingerprints
    pub fn total_count(&self) -> usize {
        self.registry.len()
    }

    pub fn last_merged_sequence(&self) -> u64 {
        self.last_merged_sequence
    }

    /// Records in fingerprint order
    pub fn records(&self) -> impl Iterator<Item = &EvidenceRecord> {
        self.registry.values()
    }

    /// Insert a record the merge engine has accepted and bump the sequence.
    ///
    /// Returns false (and changes nothing) if the fingerprint is present.
    pub(crate) fn accept(&mut self, record: EvidenceRecord) -> bool {
        if self.registry.contains_key(&record.fingerprint) {
            return false;
        }
        self.registry.insert(record.fingerprint.clone(), record);
        self.last_merged_sequence += 1;
        true
    }

    /// Canonical JSON encoding of the registry, used to compare replicas
    pub fn registry_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.registry)
    }
}
