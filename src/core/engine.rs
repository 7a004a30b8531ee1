//! Owner of the replica state.
//!
//! The merge engine is the only writer of `ReplicaState`. Batches are
//! applied one at a time, in the order they reach the engine's lock; readers
//! get immutable snapshots and never wait for a batch in progress.
//!
//! Snapshots are published while the lock is still held, so subscribers see
//! sequence numbers in commit order.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::merge::{combine_with_report, Discarded};
use super::update_log::{AcceptedUpdate, UpdateLog, UpdateLogError};
use crate::domain::{EvidenceRecord, ReplicaState};
use crate::store::{EvidenceStore, StoreError};

#[derive(Debug, Error)]
pub enum MergeError {
    /// The merge contract was broken; the batch was not committed
    #[error("Merge invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Update log error: {0}")]
    Log(#[from] UpdateLogError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What one batch did
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub accepted: Vec<EvidenceRecord>,
    pub discarded: Vec<Discarded>,

    /// last_merged_sequence after the batch
    pub sequence: u64,
}

/// State guarded by the engine lock
struct Committed {
    state: ReplicaState,

    /// Logged and merged records whose store insert has not succeeded yet
    unstored: Vec<EvidenceRecord>,
}

/// Serialized writer of the replica state
pub struct MergeEngine {
    committed: Mutex<Committed>,
    snapshot_tx: watch::Sender<Arc<ReplicaState>>,
    log: Option<UpdateLog>,
    store: Arc<dyn EvidenceStore>,
}

impl MergeEngine {
    /// Engine over an empty state, without a durable log
    pub fn in_memory(store: Arc<dyn EvidenceStore>) -> Self {
        Self::with_state(ReplicaState::new(), None, store)
    }

    /// Rebuild the state from `log` and make sure every logged record is
    /// present in the store.
    pub async fn open(log: UpdateLog, store: Arc<dyn EvidenceStore>) -> Result<Self, MergeError> {
        let updates = log.replay().await?;
        let records: Vec<EvidenceRecord> = updates.iter().map(|u| u.record.clone()).collect();
        let state = super::update_log::state_from_updates(updates)?;

        let mut restored = 0;
        for record in &records {
            if store.put(record).await? {
                restored += 1;
            }
        }
        if restored > 0 {
            warn!(restored, "Restored records missing from the store");
        }

        info!(
            records = state.total_count(),
            sequence = state.last_merged_sequence(),
            log = %log.path().display(),
            "Replica state rebuilt from update log"
        );

        Ok(Self::with_state(state, Some(log), store))
    }

    fn with_state(state: ReplicaState, log: Option<UpdateLog>, store: Arc<dyn EvidenceStore>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(state.clone()));
        Self {
            committed: Mutex::new(Committed {
                state,
                unstored: Vec::new(),
            }),
            snapshot_tx,
            log,
            store,
        }
    }

    /// Latest committed state
    pub fn snapshot(&self) -> Arc<ReplicaState> {
        self.snapshot_tx.borrow().clone()
    }

    /// Receive every committed state
    pub fn subscribe(&self) -> watch::Receiver<Arc<ReplicaState>> {
        self.snapshot_tx.subscribe()
    }

    pub fn store(&self) -> Arc<dyn EvidenceStore> {
        Arc::clone(&self.store)
    }

    /// Fold a batch of candidates into the replica state.
    ///
    /// Commit order, all under the engine lock: pending store inserts from
    /// earlier batches, post-condition checks, update log, in-memory state,
    /// store inserts, snapshot. A failed check halts the batch with nothing
    /// written. Once the log append succeeds the batch is committed: the
    /// snapshot is published even if a store insert fails, and the failed
    /// rows are retried by the next batch or `sync_store`.
    #[instrument(skip(self, updates), fields(batch = updates.len()))]
    pub async fn apply_batch(&self, updates: Vec<EvidenceRecord>) -> Result<BatchReport, MergeError> {
        let mut committed = self.committed.lock().await;
        self.store_pending(&mut committed).await?;

        let outcome = combine_with_report(&committed.state, updates);

        self.check_postconditions(&committed.state, &outcome.state, &outcome.accepted)
            .await
            .map_err(|violation| {
                error!(%violation, "Halting batch");
                MergeError::InvariantViolation(violation)
            })?;

        let sequence = outcome.state.last_merged_sequence();
        if let Some(ref log) = self.log {
            let accepted_at = Utc::now();
            let base = committed.state.last_merged_sequence();
            let entries: Vec<AcceptedUpdate> = outcome
                .accepted
                .iter()
                .enumerate()
                .map(|(i, record)| AcceptedUpdate {
                    sequence: base + i as u64 + 1,
                    accepted_at,
                    record: record.clone(),
                })
                .collect();
            log.append(&entries).await?;
        }

        committed.state = outcome.state;
        committed.unstored.extend(outcome.accepted.iter().cloned());
        let stored = self.store_pending(&mut committed).await;

        self.snapshot_tx.send_replace(Arc::new(committed.state.clone()));
        drop(committed);

        if !outcome.accepted.is_empty() || !outcome.discarded.is_empty() {
            info!(
                accepted = outcome.accepted.len(),
                discarded = outcome.discarded.len(),
                sequence,
                "Batch merged"
            );
        }
        stored?;

        Ok(BatchReport {
            accepted: outcome.accepted,
            discarded: outcome.discarded,
            sequence,
        })
    }

    /// Retry store inserts left over from a failed batch.
    ///
    /// Returns how many records are still waiting afterwards.
    pub async fn sync_store(&self) -> Result<usize, MergeError> {
        let mut committed = self.committed.lock().await;
        self.store_pending(&mut committed).await?;
        Ok(committed.unstored.len())
    }

    /// Insert every unstored record, keeping the ones from the first failure on
    async fn store_pending(&self, committed: &mut Committed) -> Result<(), MergeError> {
        while let Some(record) = committed.unstored.first() {
            if let Err(e) = self.store.put(record).await {
                warn!(
                    fingerprint = %record.fingerprint.short(),
                    pending = committed.unstored.len(),
                    error = %e,
                    "Store insert failed; will retry"
                );
                return Err(e.into());
            }
            debug!(fingerprint = %record.fingerprint.short(), "Accepted update");
            committed.unstored.remove(0);
        }
        Ok(())
    }

    async fn check_postconditions(
        &self,
        before: &ReplicaState,
        after: &ReplicaState,
        accepted: &[EvidenceRecord],
    ) -> Result<(), String> {
        let grown = after.total_count().checked_sub(before.total_count());
        if grown != Some(accepted.len()) {
            return Err(format!(
                "registry grew from {} to {} for {} accepted updates",
                before.total_count(),
                after.total_count(),
                accepted.len()
            ));
        }

        if after.last_merged_sequence() != before.last_merged_sequence() + accepted.len() as u64 {
            return Err(format!(
                "sequence moved from {} to {} for {} accepted updates",
                before.last_merged_sequence(),
                after.last_merged_sequence(),
                accepted.len()
            ));
        }

        for record in accepted {
            if before.contains(&record.fingerprint) {
                return Err(format!("accepted fingerprint {} was already registered", record.fingerprint));
            }
            match self.store.get(&record.fingerprint).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    return Err(format!(
                        "accepted fingerprint {} already persisted without being in the registry",
                        record.fingerprint
                    ))
                }
                Err(e) => return Err(format!("store lookup for {} failed: {}", record.fingerprint, e)),
            }
        }

        Ok(())
    }
}
