//! Domain types for the attestation core.
//!
//! This module contains the core data structures:
//! - Fingerprint: Normalized content digest
//! - EvidenceRecord: One registration and its lifecycle status
//! - ReplicaState: The merged registry view
//! - Ledger types exchanged with confirmation sources

pub mod fingerprint;
pub mod ledger;
pub mod record;
pub mod replica;

// Re-export commonly used types
pub use fingerprint::{Fingerprint, FingerprintError, FINGERPRINT_HEX_LEN};
pub use ledger::{LedgerPayload, LedgerState, LedgerStatus};
pub use record::{
    registration_id, EvidenceMetadata, EvidenceRecord, EvidenceStatus, StatusUpdate,
    MAX_ORIGIN_URL_CHARS, MAX_SUBMITTER_CHARS, MAX_TITLE_CHARS,
};
pub use replica::ReplicaState;
