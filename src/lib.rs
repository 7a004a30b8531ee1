//! attestor - Evidence attestation state machine
//!
//! Registers SHA-256 fingerprints of captured evidence, merges
//! registrations from concurrent submitters into a deterministic replica
//! state, and reconciles each registration with an external ledger until
//! it is finalized or errored.
//!
//! # Architecture
//!
//! - The registry validates submissions against a snapshot of the replica
//!   state and produces Pending candidates
//! - The merge engine is the single writer of the replica state; batches
//!   are folded in with a pure, order-independent combine function and
//!   appended to an update log
//! - The reconciler polls the ledger and moves records forward through
//!   compare-and-set on the record store
//! - Queries read the last committed snapshot and the store
//!
//! # Modules
//!
//! - `adapters`: Confirmation sources (HTTP ledger, simulated ledger)
//! - `core`: Registry, merge, engine, reconciler, queries
//! - `domain`: Data structures (Fingerprint, EvidenceRecord, ReplicaState)
//! - `store`: Record persistence (SQLite, in-memory)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Register a file's fingerprint
//! attestor submit --file capture.png --submitter alice \
//!     --url https://example.org/post --title "Post"
//!
//! # Drive registrations to finality
//! attestor reconcile
//!
//! # Check a fingerprint
//! attestor verify <hex>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Attestor, MergeEngine, QueryService, Reconciler, SubmitRequest};
pub use domain::{EvidenceRecord, EvidenceStatus, Fingerprint, ReplicaState};
