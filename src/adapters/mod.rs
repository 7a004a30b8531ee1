//! Adapter interfaces for external confirmation sources.
//!
//! Adapters provide a unified interface for anchoring fingerprints on a
//! ledger and polling for their confirmation.

pub mod http;
pub mod simulated;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{LedgerPayload, LedgerStatus};

pub use http::HttpLedgerClient;
pub use simulated::SimulatedLedger;

/// Failures reported by a confirmation source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfirmationError {
    /// Worth retrying: timeouts, connection failures, overload
    #[error("Transient ledger error: {0}")]
    Transient(String),

    /// The ledger refused the request; retrying will not help
    #[error("Ledger rejected request: {0}")]
    Rejected(String),
}

/// Trait for external confirmation sources
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    /// Human-readable source name
    fn name(&self) -> &str;

    /// Anchor a fingerprint, returning the ledger reference.
    ///
    /// Not idempotent: calling twice may anchor twice. Callers check for
    /// an existing reference first.
    async fn submit_fingerprint(&self, payload: &LedgerPayload) -> Result<String, ConfirmationError>;

    /// Current confirmation state of a ledger reference
    async fn check_status(&self, ledger_reference: &str) -> Result<LedgerStatus, ConfirmationError>;
}
