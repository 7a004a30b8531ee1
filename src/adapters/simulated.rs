//! In-process ledger for local runs and tests.
//!
//! Each anchored fingerprint gains one confirmation per status check and
//! becomes final once it reaches the configured depth.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ConfirmationError, ConfirmationSource};
use crate::domain::{Fingerprint, LedgerPayload, LedgerStatus};

#[derive(Debug)]
struct Entry {
    fingerprint: Fingerprint,
    confirmations: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    submissions: usize,
}

/// Deterministic simulated ledger
#[derive(Debug)]
pub struct SimulatedLedger {
    finality_depth: u64,
    rejected: HashSet<Fingerprint>,
    inner: Mutex<Inner>,
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedLedger {
    /// Ledger that reports final after `finality_depth` status checks
    pub fn new(finality_depth: u64) -> Self {
        Self {
            finality_depth: finality_depth.max(1),
            rejected: HashSet::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Refuse submissions of these fingerprints
    pub fn with_rejections(mut self, fingerprints: impl IntoIterator<Item = Fingerprint>) -> Self {
        self.rejected.extend(fingerprints);
        self
    }

    /// Number of successful submissions so far
    pub fn submissions(&self) -> usize {
        self.inner.lock().map(|inner| inner.submissions).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, ConfirmationError> {
        self.inner
            .lock()
            .map_err(|_| ConfirmationError::Transient("simulated ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl ConfirmationSource for SimulatedLedger {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn submit_fingerprint(&self, payload: &LedgerPayload) -> Result<String, ConfirmationError> {
        if self.rejected.contains(&payload.fingerprint) {
            return Err(ConfirmationError::Rejected(format!(
                "fingerprint {} refused",
                payload.fingerprint.short()
            )));
        }

        let mut inner = self.lock()?;
        inner.submissions += 1;
        let reference = format!("sim-{:06}-{}", inner.submissions, payload.fingerprint.short());
        inner.entries.insert(
            reference.clone(),
            Entry {
                fingerprint: payload.fingerprint.clone(),
                confirmations: 0,
            },
        );
        Ok(reference)
    }

    async fn check_status(&self, ledger_reference: &str) -> Result<LedgerStatus, ConfirmationError> {
        let mut inner = self.lock()?;
        let entry = inner
            .entries
            .get_mut(ledger_reference)
            .ok_or_else(|| ConfirmationError::Rejected(format!("unknown reference {}", ledger_reference)))?;

        entry.confirmations += 1;
        tracing::debug!(
            fingerprint = %entry.fingerprint.short(),
            confirmations = entry.confirmations,
            "Simulated confirmation"
        );

        if entry.confirmations >= self.finality_depth {
            Ok(LedgerStatus::finalized(entry.confirmations))
        } else {
            Ok(LedgerStatus::pending(entry.confirmations))
        }
    }
}
