//! Append-only log of accepted updates.
//!
//! Every update the merge engine accepts is stored as one JSON line. The
//! replica state is rebuilt on startup by replaying the log in order; the
//! log is never rewritten.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::{EvidenceRecord, EvidenceStatus, ReplicaState};

#[derive(Debug, Error)]
pub enum UpdateLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt update log line {line}: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Update log out of sequence: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Update log replays fingerprint {0} twice")]
    DuplicateFingerprint(String),

    #[error("Update log entry {sequence} has status {status}, expected submitted")]
    UnexpectedStatus {
        sequence: u64,
        status: EvidenceStatus,
    },
}

/// One line of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedUpdate {
    /// Value of last_merged_sequence after this update was applied
    pub sequence: u64,

    /// Wall-clock time the batch was committed (informational)
    pub accepted_at: DateTime<Utc>,

    pub record: EvidenceRecord,
}

/// JSONL file of accepted updates
pub struct UpdateLog {
    path: PathBuf,
}

impl UpdateLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Open the log at `path`, creating the parent directory
    pub async fn open(path: PathBuf) -> Result<Self, UpdateLogError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a committed batch in one write
    pub async fn append(&self, updates: &[AcceptedUpdate]) -> Result<(), UpdateLogError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut buf = String::new();
        for update in updates {
            buf.push_str(&serde_json::to_string(update)?);
            buf.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Read all updates in order
    pub async fn replay(&self) -> Result<Vec<AcceptedUpdate>, UpdateLogError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut updates = Vec::new();
        let mut line_no = 0;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let update: AcceptedUpdate = serde_json::from_str(&line)
                .map_err(|source| UpdateLogError::Corrupt { line: line_no, source })?;
            updates.push(update);
        }

        Ok(updates)
    }

    /// Rebuild the replica state from the log
    pub async fn rebuild_state(&self) -> Result<ReplicaState, UpdateLogError> {
        let updates = self.replay().await?;
        state_from_updates(updates)
    }
}

/// Apply logged updates to an empty state, checking the sequence is gapless
pub fn state_from_updates(updates: Vec<AcceptedUpdate>) -> Result<ReplicaState, UpdateLogError> {
    let mut state = ReplicaState::new();

    for update in updates {
        let expected = state.last_merged_sequence() + 1;
        if update.sequence != expected {
            return Err(UpdateLogError::SequenceGap {
                expected,
                found: update.sequence,
            });
        }
        if update.record.status != EvidenceStatus::Submitted {
            return Err(UpdateLogError::UnexpectedStatus {
                sequence: update.sequence,
                status: update.record.status,
            });
        }

        let fingerprint = update.record.fingerprint.to_string();
        if !state.accept(update.record) {
            return Err(UpdateLogError::DuplicateFingerprint(fingerprint));
        }
    }

    Ok(state)
}
