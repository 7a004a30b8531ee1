//! In-process evidence store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{check_transition, EvidenceStore, StoreError};
use crate::domain::{EvidenceRecord, EvidenceStatus, Fingerprint, StatusUpdate};

/// Map-backed store; status and submitter lookups scan the map
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<Fingerprint, EvidenceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<EvidenceRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(fingerprint).cloned())
    }

    async fn put(&self, record: &EvidenceRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        if records.contains_key(&record.fingerprint) {
            return Ok(false);
        }
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(true)
    }

    async fn compare_and_set_status(
        &self,
        fingerprint: &Fingerprint,
        expected: EvidenceStatus,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        check_transition(expected, update.status)?;

        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::NotFound(fingerprint.clone()))?;

        if record.status != expected {
            return Ok(false);
        }

        record.apply(update);
        Ok(true)
    }

    async fn list_by_status(&self, status: EvidenceStatus) -> Result<Vec<EvidenceRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn list_by_submitter(&self, submitter_id: &str) -> Result<Vec<EvidenceRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut matching: Vec<EvidenceRecord> = records
            .values()
            .filter(|r| r.metadata.submitter_id == submitter_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.metadata
                .captured_at
                .cmp(&b.metadata.captured_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(matching)
    }
}
