//! Core attestation logic.
//!
//! This module contains:
//! - Registry: validation and dedup of submissions
//! - Merge: the deterministic combine function
//! - MergeEngine: serialized owner of the replica state
//! - UpdateLog: append-only log of accepted updates
//! - Reconciler: drives records to a terminal status
//! - QueryService: read-only verification

pub mod attestor;
pub mod backoff;
pub mod engine;
pub mod merge;
pub mod query;
pub mod reconciler;
pub mod registry;
pub mod update_log;

pub use attestor::{Attestor, SubmitError, SubmitReceipt};
pub use backoff::BackoffPolicy;
pub use engine::{BatchReport, MergeEngine, MergeError};
pub use merge::{combine, combine_with_report, tie_break, DiscardReason, Discarded, MergeOutcome};
pub use query::{QueryService, VerificationResult};
pub use reconciler::{
    ReconcileError, Reconciler, ReconcilerConfig, ReconcilerHandle, ReconciliationTask, TickReport,
};
pub use registry::{Registry, RegistryError, SubmitRequest};
pub use update_log::{AcceptedUpdate, UpdateLog, UpdateLogError};
