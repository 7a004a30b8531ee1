//! End-to-end Integration Tests
//!
//! Submission, reconciliation and verification over an on-disk SQLite
//! store and update log, including a restart.

use std::sync::Arc;

use attestor::adapters::SimulatedLedger;
use attestor::core::{Attestor, MergeEngine, QueryService, Reconciler, ReconcilerConfig, SubmitRequest, UpdateLog};
use attestor::domain::{EvidenceStatus, Fingerprint};
use attestor::store::{EvidenceStore, SqliteStore};
use chrono::Utc;
use tempfile::TempDir;

async fn open(temp: &TempDir) -> (Arc<MergeEngine>, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open(&temp.path().join("evidence.db")).unwrap());
    let log = UpdateLog::open(temp.path().join("updates.jsonl")).await.unwrap();
    let engine = Arc::new(MergeEngine::open(log, store.clone()).await.unwrap());
    (engine, store)
}

fn request(content: &[u8], submitter: &str) -> SubmitRequest {
    SubmitRequest {
        fingerprint: Fingerprint::of_bytes(content).to_string(),
        submitter_id: submitter.to_string(),
        captured_at_ms: 1_700_000_000_000,
        origin_url: "https://archive.example.org/item".to_string(),
        title: "Archived item".to_string(),
    }
}

#[tokio::test]
async fn test_register_reconcile_verify_restart() {
    let temp = TempDir::new().unwrap();
    let fp = Fingerprint::of_bytes(b"screenshot bytes");

    let registration_id = {
        let (engine, store) = open(&temp).await;
        let attestor = Attestor::new(engine.clone());

        let receipt = attestor.submit(request(b"screenshot bytes", "alice")).await.unwrap();
        assert!(receipt.created);
        attestor.submit(request(b"page html", "alice")).await.unwrap();

        let ledger = Arc::new(SimulatedLedger::new(2));
        let reconciler = Reconciler::new(store.clone(), ledger.clone(), ReconcilerConfig::default());

        let mut now = Utc::now();
        for _ in 0..4 {
            reconciler.tick_at(now).await.unwrap();
            now = now + chrono::Duration::seconds(120);
        }
        assert_eq!(ledger.submissions(), 2);
        assert!(store.list_by_status(EvidenceStatus::Submitted).await.unwrap().is_empty());
        assert_eq!(store.list_by_status(EvidenceStatus::Finalized).await.unwrap().len(), 2);

        receipt.registration_id
    };

    // Reopen: state comes back from the log, progress from the store
    let (engine, _) = open(&temp).await;
    assert_eq!(engine.snapshot().total_count(), 2);
    assert_eq!(engine.snapshot().last_merged_sequence(), 2);

    let result = QueryService::new(engine.clone()).verify(&fp).await.unwrap();
    assert!(result.found);
    assert_eq!(result.registration_id, Some(registration_id));
    assert_eq!(result.status, Some(EvidenceStatus::Finalized));
    assert_eq!(result.confirmation_count, Some(2));

    let attestor = Attestor::new(engine);
    let again = attestor.submit(request(b"screenshot bytes", "alice")).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.registration_id, registration_id);
    assert_eq!(again.status, EvidenceStatus::Finalized);

    let other = attestor.submit(request(b"screenshot bytes", "mallory")).await;
    assert_eq!(other.unwrap_err().code(), "DuplicateFingerprint");
}

#[tokio::test]
async fn test_reopen_restores_missing_rows() {
    let temp = TempDir::new().unwrap();
    {
        let (engine, _) = open(&temp).await;
        Attestor::new(engine).submit(request(b"lost row", "bob")).await.unwrap();
    }

    std::fs::remove_file(temp.path().join("evidence.db")).unwrap();

    let (engine, store) = open(&temp).await;
    let fp = Fingerprint::of_bytes(b"lost row");
    let restored = store.get(&fp).await.unwrap().unwrap();
    assert_eq!(restored.status, EvidenceStatus::Submitted);
    assert_eq!(engine.snapshot().get(&fp).unwrap().registration_id, restored.registration_id);
    assert_eq!(store.list_by_submitter("bob").await.unwrap().len(), 1);
}
