//! Reconciliation Integration Tests
//!
//! Finalization, retry budget, rejection and resubmission behavior of the
//! reconciler against scripted confirmation sources.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use attestor::adapters::{ConfirmationError, ConfirmationSource, SimulatedLedger};
use attestor::core::{Attestor, BackoffPolicy, MergeEngine, Reconciler, ReconcilerConfig, SubmitRequest};
use attestor::domain::{
    EvidenceMetadata, EvidenceRecord, EvidenceStatus, Fingerprint, LedgerPayload, LedgerStatus, StatusUpdate,
};
use attestor::store::{EvidenceStore, MemoryStore, StoreError};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// check_status never answers
    Hang,
    /// check_status fails with a transient error
    Flaky,
    /// check_status reports rejection
    Reject,
    /// pending until this many confirmations, then final
    FinalAt(u64),
}

struct ScriptedLedger {
    behavior: Behavior,
    submits: AtomicUsize,
    checks: AtomicUsize,
    confirmations: AtomicU64,
    checked_refs: Mutex<Vec<String>>,
}

impl ScriptedLedger {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            submits: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            confirmations: AtomicU64::new(0),
            checked_refs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ConfirmationSource for ScriptedLedger {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit_fingerprint(&self, payload: &LedgerPayload) -> Result<String, ConfirmationError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(format!("tx-{}", payload.fingerprint.short()))
    }

    async fn check_status(&self, ledger_reference: &str) -> Result<LedgerStatus, ConfirmationError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.checked_refs.lock().unwrap().push(ledger_reference.to_string());

        match self.behavior {
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(LedgerStatus::pending(0))
            }
            Behavior::Flaky => Err(ConfirmationError::Transient("503 Service Unavailable".to_string())),
            Behavior::Reject => Ok(LedgerStatus::rejected("double spend")),
            Behavior::FinalAt(depth) => {
                let seen = self.confirmations.fetch_add(1, Ordering::SeqCst) + 1;
                if seen >= depth {
                    Ok(LedgerStatus::finalized(seen))
                } else {
                    Ok(LedgerStatus::pending(seen))
                }
            }
        }
    }
}

/// Store where another writer wins the first race to mark a record Errored
struct ContendedStore {
    inner: Arc<MemoryStore>,
    lost_errored_write: AtomicBool,
}

#[async_trait]
impl EvidenceStore for ContendedStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<EvidenceRecord>, StoreError> {
        self.inner.get(fingerprint).await
    }

    async fn put(&self, record: &EvidenceRecord) -> Result<bool, StoreError> {
        self.inner.put(record).await
    }

    async fn compare_and_set_status(
        &self,
        fingerprint: &Fingerprint,
        expected: EvidenceStatus,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        if update.status == EvidenceStatus::Errored && !self.lost_errored_write.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.compare_and_set_status(fingerprint, expected, update).await
    }

    async fn list_by_status(&self, status: EvidenceStatus) -> Result<Vec<EvidenceRecord>, StoreError> {
        self.inner.list_by_status(status).await
    }

    async fn list_by_submitter(&self, submitter_id: &str) -> Result<Vec<EvidenceRecord>, StoreError> {
        self.inner.list_by_submitter(submitter_id).await
    }
}

fn config(max_attempts: u32) -> ReconcilerConfig {
    ReconcilerConfig {
        tick_interval_ms: 1000,
        attempt_timeout_ms: 5000,
        max_attempts,
        backoff: BackoffPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.0,
        },
    }
}

/// Register `fp` through the attestor and return the store behind it
async fn registered(fp: &str) -> (Arc<MemoryStore>, Fingerprint) {
    let store = Arc::new(MemoryStore::new());
    let attestor = Attestor::new(Arc::new(MergeEngine::in_memory(store.clone())));

    let receipt = attestor
        .submit(SubmitRequest {
            fingerprint: fp.repeat(32),
            submitter_id: "reconcile-test".to_string(),
            captured_at_ms: Utc::now().timestamp_millis() - 1000,
            origin_url: "https://example.org/page".to_string(),
            title: "Page".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(receipt.status, EvidenceStatus::Submitted);

    (store, receipt.fingerprint)
}

async fn status_of(store: &MemoryStore, fp: &Fingerprint) -> EvidenceRecord {
    store.get(fp).await.unwrap().unwrap()
}

fn later(t: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    t + chrono::Duration::seconds(secs)
}

#[tokio::test]
async fn test_finalizes_on_first_poll() {
    let (store, fp) = registered("a1").await;
    let ledger = Arc::new(SimulatedLedger::new(1));
    let reconciler = Reconciler::new(store.clone(), ledger.clone(), config(5));

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.finalized, 1);

    let record = status_of(&store, &fp).await;
    assert_eq!(record.status, EvidenceStatus::Finalized);
    assert!(record.confirmation_count >= 1);
    assert!(record.ledger_reference.is_some());
    assert!(record.error_info.is_none());
    assert_eq!(ledger.submissions(), 1);
    assert!(reconciler.tasks().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_exhaust_retry_budget() {
    let (store, fp) = registered("b2").await;
    let ledger = ScriptedLedger::new(Behavior::Hang);
    let reconciler = Reconciler::new(store.clone(), ledger.clone(), config(3));

    let mut now = Utc::now();
    for attempt in 1..3u32 {
        let report = reconciler.tick_at(now).await.unwrap();
        assert_eq!(report.rescheduled, 1);

        let task = reconciler.tasks().await.remove(0);
        assert_eq!(task.attempt_count, attempt);
        assert!(task.last_error.unwrap().contains("timed out"));
        assert_eq!(status_of(&store, &fp).await.status, EvidenceStatus::AwaitingConfirmation);

        now = later(now, 120);
    }

    let report = reconciler.tick_at(now).await.unwrap();
    assert_eq!(report.errored, 1);

    let record = status_of(&store, &fp).await;
    assert_eq!(record.status, EvidenceStatus::Errored);
    assert!(record.error_info.unwrap().contains("3 attempts"));
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.submits.load(Ordering::SeqCst), 1);

    // Terminal: no further work
    let idle = reconciler.tick_at(later(now, 600)).await.unwrap();
    assert_eq!(idle.attempted, 0);
}

#[tokio::test]
async fn test_transient_errors_make_exactly_max_attempts() {
    let (store, fp) = registered("c3").await;
    let ledger = ScriptedLedger::new(Behavior::Flaky);
    let reconciler = Reconciler::new(store.clone(), ledger.clone(), config(5));

    let mut now = Utc::now();
    for _ in 0..20 {
        reconciler.tick_at(now).await.unwrap();
        now = later(now, 120);
    }

    assert_eq!(status_of(&store, &fp).await.status, EvidenceStatus::Errored);
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_backoff_respects_schedule() {
    let (store, _) = registered("c4").await;
    let ledger = ScriptedLedger::new(Behavior::Flaky);
    let reconciler = Reconciler::new(store, ledger.clone(), config(10));

    let t0 = Utc::now();
    reconciler.tick_at(t0).await.unwrap();
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 1);

    // First retry is due 1s later, the second 2s after that
    reconciler.tick_at(t0 + chrono::Duration::milliseconds(999)).await.unwrap();
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 1);
    reconciler.tick_at(later(t0, 1)).await.unwrap();
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 2);
    reconciler.tick_at(later(t0, 2)).await.unwrap();
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 2);
    reconciler.tick_at(later(t0, 3)).await.unwrap();
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_rejection_errors_immediately() {
    let (store, fp) = registered("d4").await;
    let ledger = ScriptedLedger::new(Behavior::Reject);
    let reconciler = Reconciler::new(store.clone(), ledger.clone(), config(5));

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.errored, 1);

    let record = status_of(&store, &fp).await;
    assert_eq!(record.status, EvidenceStatus::Errored);
    assert_eq!(record.error_info.as_deref(), Some("double spend"));
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_existing_reference_is_not_resubmitted() {
    let store = Arc::new(MemoryStore::new());
    let fp = Fingerprint::parse(&"e5".repeat(32)).unwrap();
    let mut record = EvidenceRecord::candidate(
        fp.clone(),
        EvidenceMetadata {
            submitter_id: "crashed-replica".to_string(),
            captured_at: Utc::now(),
            origin_url: "https://example.org".to_string(),
            title: "Recovered".to_string(),
        },
        Utc::now(),
    );
    record.status = EvidenceStatus::AwaitingConfirmation;
    record.ledger_reference = Some("tx-existing".to_string());
    record.confirmation_count = 2;
    store.put(&record).await.unwrap();

    let ledger = ScriptedLedger::new(Behavior::FinalAt(1));
    let reconciler = Reconciler::new(store.clone(), ledger.clone(), config(5));
    reconciler.tick().await.unwrap();

    assert_eq!(ledger.submits.load(Ordering::SeqCst), 0);
    assert_eq!(*ledger.checked_refs.lock().unwrap(), vec!["tx-existing".to_string()]);

    let record = status_of(&store, &fp).await;
    assert_eq!(record.status, EvidenceStatus::Finalized);
    assert_eq!(record.ledger_reference.as_deref(), Some("tx-existing"));
    // Never decreases, even though the ledger reported fewer
    assert_eq!(record.confirmation_count, 2);
}

#[tokio::test]
async fn test_status_only_moves_forward() {
    let (store, fp) = registered("f6").await;
    let ledger = ScriptedLedger::new(Behavior::FinalAt(4));
    let reconciler = Reconciler::new(store.clone(), ledger, config(5));

    let rank = |status: EvidenceStatus| EvidenceStatus::ALL.iter().position(|s| *s == status).unwrap();
    let mut last = status_of(&store, &fp).await;
    let mut now = Utc::now();

    for _ in 0..10 {
        reconciler.tick_at(now).await.unwrap();
        let current = status_of(&store, &fp).await;
        assert!(rank(current.status) >= rank(last.status));
        assert!(current.confirmation_count >= last.confirmation_count);
        last = current;
        now = later(now, 120);
    }

    assert_eq!(last.status, EvidenceStatus::Finalized);
    assert_eq!(last.confirmation_count, 4);
}

#[tokio::test]
async fn test_lost_errored_write_keeps_retry_budget() {
    let (inner, fp) = registered("a8").await;
    let store = Arc::new(ContendedStore {
        inner: inner.clone(),
        lost_errored_write: AtomicBool::new(false),
    });
    let ledger = ScriptedLedger::new(Behavior::Flaky);
    let reconciler = Reconciler::new(store, ledger.clone(), config(3));

    let mut now = Utc::now();
    for _ in 0..10 {
        reconciler.tick_at(now).await.unwrap();
        now = later(now, 120);
    }

    let record = status_of(&inner, &fp).await;
    assert_eq!(record.status, EvidenceStatus::Errored);
    assert!(record.error_info.unwrap().contains("3 attempts"));
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 3);
    assert!(reconciler.tasks().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_check() {
    let (store, fp) = registered("b9").await;
    let ledger = ScriptedLedger::new(Behavior::Hang);
    let reconciler = Arc::new(Reconciler::new(store.clone(), ledger.clone(), config(3)));

    let handle = reconciler.clone().spawn();
    while ledger.checks.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    handle.stop().await.unwrap();

    // The hung check timed out and was counted before the loop exited
    let tasks = reconciler.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempt_count, 1);
    assert!(tasks[0].last_error.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(ledger.checks.load(Ordering::SeqCst), 1);
    assert_eq!(status_of(&store, &fp).await.status, EvidenceStatus::AwaitingConfirmation);
}
