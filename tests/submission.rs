//! Submission Integration Tests
//!
//! Registry admission through the attestor facade: idempotent
//! resubmission, conflicting duplicates and boundary validation.

use std::sync::Arc;

use attestor::core::{Attestor, MergeEngine, QueryService, RegistryError, SubmitError, SubmitRequest};
use attestor::domain::{EvidenceStatus, Fingerprint};
use attestor::store::MemoryStore;
use chrono::{TimeZone, Utc};

fn request(fingerprint: &str, submitter: &str) -> SubmitRequest {
    SubmitRequest {
        fingerprint: fingerprint.to_string(),
        submitter_id: submitter.to_string(),
        captured_at_ms: 1_700_000_000_000,
        origin_url: "https://news.example.com/story".to_string(),
        title: "Story".to_string(),
    }
}

fn attestor() -> Attestor {
    Attestor::new(Arc::new(MergeEngine::in_memory(Arc::new(MemoryStore::new()))))
}

#[tokio::test]
async fn test_resubmission_returns_same_registration() {
    let attestor = attestor();
    let fp = "a1".repeat(32);

    let first = attestor.submit(request(&fp, "ext-1")).await.unwrap();
    assert!(first.created);
    assert_eq!(first.status, EvidenceStatus::Submitted);

    let second = attestor.submit(request(&fp, "ext-1")).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.registration_id, first.registration_id);
    assert_eq!(attestor.engine().snapshot().total_count(), 1);

    let bad = attestor.submit(request("bad", "ext-1")).await.unwrap_err();
    assert!(matches!(
        bad,
        SubmitError::Registry(RegistryError::InvalidFingerprintFormat(_))
    ));
    assert_eq!(bad.code(), "InvalidFingerprintFormat");
}

#[tokio::test]
async fn test_uppercase_fingerprint_is_the_same_registration() {
    let attestor = attestor();

    let lower = attestor.submit(request(&"ab".repeat(32), "ext-1")).await.unwrap();
    let upper = attestor.submit(request(&"AB".repeat(32), "ext-1")).await.unwrap();

    assert!(!upper.created);
    assert_eq!(upper.registration_id, lower.registration_id);
}

#[tokio::test]
async fn test_conflicting_payload_is_duplicate() {
    let attestor = attestor();
    let fp = "c3".repeat(32);

    let first = attestor.submit(request(&fp, "ext-1")).await.unwrap();
    let err = attestor.submit(request(&fp, "ext-2")).await.unwrap_err();

    match err {
        SubmitError::Registry(RegistryError::DuplicateFingerprint {
            registration_id,
            same_payload,
            ..
        }) => {
            assert_eq!(registration_id, first.registration_id);
            assert!(!same_payload);
        }
        other => panic!("expected DuplicateFingerprint, got {:?}", other),
    }
}

#[tokio::test]
async fn test_boundary_validation() {
    let attestor = attestor();
    let now = Utc.timestamp_millis_opt(1_700_000_100_000).unwrap();
    let fp = "d4".repeat(32);

    let mut future = request(&fp, "ext-1");
    future.captured_at_ms = now.timestamp_millis() + 1;
    let err = attestor.submit_at(future, now).await.unwrap_err();
    assert_eq!(err.code(), "InvalidTimestamp");

    let mut zero = request(&fp, "ext-1");
    zero.captured_at_ms = 0;
    let err = attestor.submit_at(zero, now).await.unwrap_err();
    assert_eq!(err.code(), "InvalidTimestamp");

    let err = attestor.submit_at(request(&fp, ""), now).await.unwrap_err();
    assert_eq!(err.code(), "InvalidMetadata");

    let mut long_title = request(&fp, "ext-1");
    long_title.title = "t".repeat(501);
    let err = attestor.submit_at(long_title, now).await.unwrap_err();
    assert_eq!(err.code(), "InvalidMetadata");

    assert_eq!(attestor.engine().snapshot().total_count(), 0);

    // Exactly now is accepted
    let mut exact = request(&fp, "ext-1");
    exact.captured_at_ms = now.timestamp_millis();
    assert!(attestor.submit_at(exact, now).await.unwrap().created);
}

#[tokio::test]
async fn test_verify_and_list() {
    let attestor = attestor();
    let query = QueryService::new(attestor.engine().clone());

    for (i, fp) in ["e5", "f6", "07"].iter().enumerate() {
        let mut req = request(&fp.repeat(32), if i < 2 { "alice" } else { "bob" });
        req.captured_at_ms -= i as i64 * 1000;
        attestor.submit(req).await.unwrap();
    }

    let found = query.verify(&Fingerprint::parse(&"e5".repeat(32)).unwrap()).await.unwrap();
    assert!(found.found);
    assert_eq!(found.status, Some(EvidenceStatus::Submitted));
    assert_eq!(found.confirmation_count, Some(0));

    let missing = query.verify(&Fingerprint::parse(&"99".repeat(32)).unwrap()).await.unwrap();
    assert!(!missing.found);

    let alice = query.list_by_submitter("alice").await.unwrap();
    assert_eq!(alice.len(), 2);
    // Ordered by capture time
    assert!(alice[0].metadata.captured_at <= alice[1].metadata.captured_at);
    assert!(query.list_by_submitter("nobody").await.unwrap().is_empty());
}
