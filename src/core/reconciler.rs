//! Reconciliation loop.
//!
//! Drives every Submitted record to a terminal status. Each tick picks the
//! tasks that are due, runs one attempt per task concurrently, and applies
//! the outcome to the store with compare-and-set:
//!
//! - no ledger reference yet: submit, persist the reference
//!   (Submitted -> AwaitingConfirmation), then poll
//! - final: Finalized, task removed
//! - pending: stays AwaitingConfirmation, rescheduled with backoff
//! - transient failure or timeout: attempt counted, rescheduled; Errored
//!   once the attempt budget is spent
//! - rejection: Errored immediately

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::backoff::BackoffPolicy;
use crate::adapters::{ConfirmationError, ConfirmationSource};
use crate::domain::{EvidenceRecord, EvidenceStatus, Fingerprint, LedgerPayload, LedgerState, StatusUpdate};
use crate::store::{EvidenceStore, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Reconciler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Interval between ticks in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Upper bound on one attempt's ledger calls in milliseconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Transient failures allowed before a record is Errored
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(flatten)]
    pub backoff: BackoffPolicy,
}

fn default_tick_interval() -> u64 {
    1000
}
fn default_attempt_timeout() -> u64 {
    5000
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            attempt_timeout_ms: default_attempt_timeout(),
            max_attempts: default_max_attempts(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Pending work for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationTask {
    pub fingerprint: Fingerprint,

    /// Transient failures so far
    pub attempt_count: u32,

    /// Successful polls that came back pending
    pub poll_count: u32,

    pub next_attempt_at: DateTime<Utc>,

    pub last_error: Option<String>,
}

impl ReconciliationTask {
    pub fn new(fingerprint: Fingerprint, due_at: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            attempt_count: 0,
            poll_count: 0,
            next_attempt_at: due_at,
            last_error: None,
        }
    }
}

/// What one attempt did to its task
#[derive(Debug)]
enum TaskOutcome {
    /// Terminal status reached (or found); drop the task
    Done(EvidenceStatus),

    /// Record no longer exists; drop the task
    Dropped,

    /// Try again at `task.next_attempt_at`
    Reschedule(ReconciliationTask),
}

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub discovered: usize,
    pub attempted: usize,
    pub finalized: usize,
    pub errored: usize,
    pub rescheduled: usize,
}

/// Everything an attempt needs, cheap to clone into a spawned task
#[derive(Clone)]
struct AttemptContext {
    store: Arc<dyn EvidenceStore>,
    source: Arc<dyn ConfirmationSource>,
    config: ReconcilerConfig,
}

/// Polls the confirmation source and advances record status
pub struct Reconciler {
    ctx: AttemptContext,
    tasks: Mutex<BTreeMap<Fingerprint, ReconciliationTask>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EvidenceStore>,
        source: Arc<dyn ConfirmationSource>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ctx: AttemptContext {
                store,
                source,
                config,
            },
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.ctx.config
    }

    /// Start tracking a record, due immediately
    pub async fn track(&self, fingerprint: Fingerprint) {
        let mut tasks = self.tasks.lock().await;
        tasks
            .entry(fingerprint.clone())
            .or_insert_with(|| ReconciliationTask::new(fingerprint, Utc::now()));
    }

    /// Current task queue, in fingerprint order
    pub async fn tasks(&self) -> Vec<ReconciliationTask> {
        self.tasks.lock().await.values().cloned().collect()
    }

    pub async fn tick(&self) -> Result<TickReport, ReconcileError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one reconciliation pass as of `now`
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, ReconcileError> {
        let mut tasks = self.tasks.lock().await;
        let mut report = TickReport {
            discovered: self.discover(&mut tasks, now).await?,
            ..Default::default()
        };

        let mut attempts = JoinSet::new();
        for task in tasks.values().filter(|t| t.next_attempt_at <= now) {
            let ctx = self.ctx.clone();
            let task = task.clone();
            attempts.spawn(async move {
                let fingerprint = task.fingerprint.clone();
                let outcome = ctx.attempt(task, now).await;
                (fingerprint, outcome)
            });
            report.attempted += 1;
        }

        while let Some(joined) = attempts.join_next().await {
            let (fingerprint, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    // Task stays queued with its old schedule
                    error!(error = %e, "Reconciliation attempt aborted");
                    continue;
                }
            };

            match outcome {
                Ok(TaskOutcome::Done(status)) => {
                    tasks.remove(&fingerprint);
                    match status {
                        EvidenceStatus::Finalized => report.finalized += 1,
                        EvidenceStatus::Errored => report.errored += 1,
                        _ => {}
                    }
                }
                Ok(TaskOutcome::Dropped) => {
                    tasks.remove(&fingerprint);
                }
                Ok(TaskOutcome::Reschedule(task)) => {
                    tasks.insert(fingerprint, task);
                    report.rescheduled += 1;
                }
                Err(e) => {
                    warn!(fingerprint = %fingerprint.short(), error = %e, "Store failure during attempt");
                    if let Some(task) = tasks.get_mut(&fingerprint) {
                        task.last_error = Some(e.to_string());
                        task.next_attempt_at = now + self.ctx.delay(1);
                    }
                    report.rescheduled += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                finalized = report.finalized,
                errored = report.errored,
                rescheduled = report.rescheduled,
                queued = tasks.len(),
                "Reconciliation tick"
            );
        }

        Ok(report)
    }

    /// Queue a task for every record in the working set not yet tracked
    async fn discover(
        &self,
        tasks: &mut BTreeMap<Fingerprint, ReconciliationTask>,
        now: DateTime<Utc>,
    ) -> Result<usize, ReconcileError> {
        let mut discovered = 0;
        for status in [EvidenceStatus::Submitted, EvidenceStatus::AwaitingConfirmation] {
            for record in self.ctx.store.list_by_status(status).await? {
                if !tasks.contains_key(&record.fingerprint) {
                    tasks.insert(
                        record.fingerprint.clone(),
                        ReconciliationTask::new(record.fingerprint, now),
                    );
                    discovered += 1;
                }
            }
        }
        Ok(discovered)
    }

    /// Tick every `tick_interval` until a message arrives on `shutdown`
    pub async fn run(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.ctx.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Reconciler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    // A tick in progress runs to completion before shutdown is seen
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Reconciliation tick failed");
                    }
                }
            }
        }
    }

    /// Run in a background task
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(self.run(stop_rx));
        ReconcilerHandle { stop_tx, task }
    }
}

/// Handle to control a running reconciler
pub struct ReconcilerHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop after the current tick and wait for the loop to exit
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

impl AttemptContext {
    fn delay(&self, attempt: u32) -> chrono::Duration {
        let delay = self
            .config
            .backoff
            .jittered_delay(attempt.max(1), &mut rand::thread_rng());
        chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.config.backoff.max_delay_ms as i64))
    }

    /// One submit-and/or-poll attempt for `task`
    async fn attempt(&self, mut task: ReconciliationTask, now: DateTime<Utc>) -> Result<TaskOutcome, StoreError> {
        let Some(mut record) = self.store.get(&task.fingerprint).await? else {
            warn!(fingerprint = %task.fingerprint.short(), "Tracked record missing from store");
            return Ok(TaskOutcome::Dropped);
        };

        if !record.status.needs_reconciliation() {
            return Ok(TaskOutcome::Done(record.status));
        }

        // Budget spent but the Errored write lost a race: finish it without the ledger
        if task.attempt_count >= self.config.max_attempts {
            let reason = task.last_error.clone().unwrap_or_default();
            let info = exhausted(task.attempt_count, &reason);
            return self.fail(task, &record, info, now).await;
        }

        let deadline = Instant::now() + self.config.attempt_timeout();

        // Never resubmit once a reference exists: submission is not idempotent
        let reference = match record.ledger_reference.clone() {
            Some(reference) => reference,
            None => {
                let payload = LedgerPayload::from(&record);
                let submitted = timeout_at(deadline, self.source.submit_fingerprint(&payload)).await;
                let reference = match flatten_timeout(submitted) {
                    Ok(reference) => reference,
                    Err(ConfirmationError::Rejected(reason)) => {
                        return self.fail(task, &record, format!("submission rejected: {}", reason), now).await;
                    }
                    Err(ConfirmationError::Transient(reason)) => {
                        return self.transient(task, &record, reason, now).await;
                    }
                };

                let update = StatusUpdate::new(EvidenceStatus::AwaitingConfirmation, now)
                    .with_ledger_reference(reference.clone());
                if !self
                    .store
                    .compare_and_set_status(&record.fingerprint, record.status, &update)
                    .await?
                {
                    return Ok(self.conflict(task, &record, now));
                }
                info!(fingerprint = %record.fingerprint.short(), %reference, "Anchored on ledger");
                record.apply(&update);
                reference
            }
        };

        let checked = timeout_at(deadline, self.source.check_status(&reference)).await;
        let status = match flatten_timeout(checked) {
            Ok(status) => status,
            Err(ConfirmationError::Rejected(reason)) => {
                return self.fail(task, &record, format!("status check rejected: {}", reason), now).await;
            }
            Err(ConfirmationError::Transient(reason)) => {
                return self.transient(task, &record, reason, now).await;
            }
        };

        match status.state {
            LedgerState::Final => {
                let confirmations = status.confirmations.max(1);
                let update = StatusUpdate::new(EvidenceStatus::Finalized, now).with_confirmations(confirmations);
                if !self
                    .store
                    .compare_and_set_status(&record.fingerprint, record.status, &update)
                    .await?
                {
                    return Ok(self.conflict(task, &record, now));
                }
                info!(fingerprint = %record.fingerprint.short(), confirmations, "Finalized");
                Ok(TaskOutcome::Done(EvidenceStatus::Finalized))
            }
            LedgerState::Pending => {
                let update = StatusUpdate::new(EvidenceStatus::AwaitingConfirmation, now)
                    .with_confirmations(status.confirmations);
                if !self
                    .store
                    .compare_and_set_status(&record.fingerprint, record.status, &update)
                    .await?
                {
                    return Ok(self.conflict(task, &record, now));
                }
                task.poll_count += 1;
                task.next_attempt_at = now + self.delay(task.poll_count);
                debug!(
                    fingerprint = %record.fingerprint.short(),
                    confirmations = status.confirmations,
                    next_attempt_at = %task.next_attempt_at,
                    "Awaiting confirmation"
                );
                Ok(TaskOutcome::Reschedule(task))
            }
            LedgerState::Rejected => {
                let reason = status.reason.unwrap_or_else(|| "rejected by ledger".to_string());
                self.fail(task, &record, reason, now).await
            }
        }
    }

    /// Count a transient failure; Errored once the budget is spent
    async fn transient(
        &self,
        mut task: ReconciliationTask,
        record: &EvidenceRecord,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome, StoreError> {
        task.attempt_count += 1;
        task.last_error = Some(reason.clone());

        if task.attempt_count >= self.config.max_attempts {
            let info = exhausted(task.attempt_count, &reason);
            return self.fail(task, record, info, now).await;
        }

        task.next_attempt_at = now + self.delay(task.attempt_count);
        debug!(
            fingerprint = %record.fingerprint.short(),
            attempt = task.attempt_count,
            %reason,
            next_attempt_at = %task.next_attempt_at,
            "Transient failure"
        );
        Ok(TaskOutcome::Reschedule(task))
    }

    /// Move the record to Errored. A lost CAS keeps the task and its counters.
    async fn fail(
        &self,
        task: ReconciliationTask,
        record: &EvidenceRecord,
        error_info: String,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome, StoreError> {
        let update = StatusUpdate::new(EvidenceStatus::Errored, now).with_error(error_info.clone());
        if self
            .store
            .compare_and_set_status(&record.fingerprint, record.status, &update)
            .await?
        {
            warn!(fingerprint = %record.fingerprint.short(), error = %error_info, "Registration errored");
            return Ok(TaskOutcome::Done(EvidenceStatus::Errored));
        }

        Ok(self.conflict(task, record, now))
    }

    /// CAS lost: status changed underneath us. Re-read next tick.
    fn conflict(&self, mut task: ReconciliationTask, record: &EvidenceRecord, now: DateTime<Utc>) -> TaskOutcome {
        warn!(
            fingerprint = %record.fingerprint.short(),
            expected = %record.status,
            "Status changed concurrently"
        );
        task.next_attempt_at = now;
        TaskOutcome::Reschedule(task)
    }
}

fn exhausted(attempts: u32, reason: &str) -> String {
    format!("retry budget exhausted after {} attempts: {}", attempts, reason)
}

/// A timed-out call is a transient failure
fn flatten_timeout<T>(
    result: Result<Result<T, ConfirmationError>, tokio::time::error::Elapsed>,
) -> Result<T, ConfirmationError> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(ConfirmationError::Transient("confirmation call timed out".to_string())),
    }
}
