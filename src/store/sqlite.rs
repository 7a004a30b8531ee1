//! SQLite-backed evidence store.
//!
//! One table keyed by fingerprint with secondary indexes on status and
//! submitter. Compare-and-set is a single conditional UPDATE, so concurrent
//! writers on the same record cannot lose updates.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{check_transition, EvidenceStore, StoreError};
use crate::domain::{EvidenceMetadata, EvidenceRecord, EvidenceStatus, Fingerprint, StatusUpdate};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS evidence_records (
    fingerprint        TEXT PRIMARY KEY NOT NULL,
    registration_id    TEXT NOT NULL UNIQUE,
    submitter_id       TEXT NOT NULL,
    captured_at        TEXT NOT NULL,
    origin_url         TEXT NOT NULL,
    title              TEXT NOT NULL,
    status             TEXT NOT NULL,
    ledger_reference   TEXT,
    confirmation_count INTEGER NOT NULL DEFAULT 0,
    error_info         TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evidence_status ON evidence_records(status);
CREATE INDEX IF NOT EXISTS idx_evidence_submitter ON evidence_records(submitter_id, captured_at);
"#;

const COLUMNS: &str = "fingerprint, registration_id, submitter_id, captured_at, origin_url, title, \
                       status, ledger_reference, confirmation_count, error_info, created_at, updated_at";

/// SQLite evidence store.
///
/// Statements run on the blocking pool; the connection mutex serializes them.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Corrupt(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn query_records(&self, sql: String, param: String) -> Result<Vec<EvidenceRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![param], RawRecord::from_row)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?.into_record()?);
            }
            Ok(records)
        })
        .await
    }
}

/// SQLite INTEGER is signed
fn to_sql_count(count: u64, fingerprint: &Fingerprint) -> Result<i64, StoreError> {
    i64::try_from(count)
        .map_err(|_| StoreError::Corrupt(format!("confirmation count {} out of range for {}", count, fingerprint)))
}

#[async_trait]
impl EvidenceStore for SqliteStore {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<EvidenceRecord>, StoreError> {
        let fingerprint = fingerprint.clone();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {} FROM evidence_records WHERE fingerprint = ?1", COLUMNS),
                    params![fingerprint.as_str()],
                    RawRecord::from_row,
                )
                .optional()?;

            raw.map(RawRecord::into_record).transpose()
        })
        .await
    }

    async fn put(&self, record: &EvidenceRecord) -> Result<bool, StoreError> {
        let confirmation_count = to_sql_count(record.confirmation_count, &record.fingerprint)?;
        let record = record.clone();

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO evidence_records ({}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    COLUMNS
                ),
                params![
                    record.fingerprint.as_str(),
                    record.registration_id.to_string(),
                    record.metadata.submitter_id,
                    encode_time(&record.metadata.captured_at),
                    record.metadata.origin_url,
                    record.metadata.title,
                    record.status.as_str(),
                    record.ledger_reference,
                    confirmation_count,
                    record.error_info,
                    encode_time(&record.created_at),
                    encode_time(&record.updated_at),
                ],
            )?;

            Ok(inserted == 1)
        })
        .await
    }

    async fn compare_and_set_status(
        &self,
        fingerprint: &Fingerprint,
        expected: EvidenceStatus,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        check_transition(expected, update.status)?;
        let confirmation_count = update
            .confirmation_count
            .map(|count| to_sql_count(count, fingerprint))
            .transpose()?;
        let fingerprint = fingerprint.clone();
        let update = update.clone();

        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE evidence_records SET \
                     status = ?1, \
                     ledger_reference = COALESCE(?2, ledger_reference), \
                     confirmation_count = MAX(confirmation_count, COALESCE(?3, confirmation_count)), \
                     error_info = COALESCE(?4, error_info), \
                     updated_at = ?5 \
                 WHERE fingerprint = ?6 AND status = ?7",
                params![
                    update.status.as_str(),
                    update.ledger_reference,
                    confirmation_count,
                    update.error_info,
                    encode_time(&update.updated_at),
                    fingerprint.as_str(),
                    expected.as_str(),
                ],
            )?;

            if changed == 1 {
                return Ok(true);
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM evidence_records WHERE fingerprint = ?1",
                    params![fingerprint.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            match exists {
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound(fingerprint)),
            }
        })
        .await
    }

    async fn list_by_status(&self, status: EvidenceStatus) -> Result<Vec<EvidenceRecord>, StoreError> {
        self.query_records(
            format!(
                "SELECT {} FROM evidence_records WHERE status = ?1 ORDER BY fingerprint",
                COLUMNS
            ),
            status.as_str().to_string(),
        )
        .await
    }

    async fn list_by_submitter(&self, submitter_id: &str) -> Result<Vec<EvidenceRecord>, StoreError> {
        self.query_records(
            format!(
                "SELECT {} FROM evidence_records WHERE submitter_id = ?1 \
                 ORDER BY captured_at, fingerprint",
                COLUMNS
            ),
            submitter_id.to_string(),
        )
        .await
    }
}

/// Column values as stored
struct RawRecord {
    fingerprint: String,
    registration_id: String,
    submitter_id: String,
    captured_at: String,
    origin_url: String,
    title: String,
    status: String,
    ledger_reference: Option<String>,
    confirmation_count: i64,
    error_info: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            registration_id: row.get(1)?,
            submitter_id: row.get(2)?,
            captured_at: row.get(3)?,
            origin_url: row.get(4)?,
            title: row.get(5)?,
            status: row.get(6)?,
            ledger_reference: row.get(7)?,
            confirmation_count: row.get(8)?,
            error_info: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<EvidenceRecord, StoreError> {
        let fingerprint = Fingerprint::parse(&self.fingerprint)
            .map_err(|e| StoreError::Corrupt(format!("fingerprint {}: {}", self.fingerprint, e)))?;
        let registration_id = Uuid::parse_str(&self.registration_id)
            .map_err(|e| StoreError::Corrupt(format!("registration id {}: {}", self.registration_id, e)))?;
        let status = self.status.parse::<EvidenceStatus>().map_err(StoreError::Corrupt)?;
        let confirmation_count = u64::try_from(self.confirmation_count)
            .map_err(|_| StoreError::Corrupt(format!("negative confirmation count for {}", fingerprint)))?;

        Ok(EvidenceRecord {
            fingerprint,
            registration_id,
            metadata: EvidenceMetadata {
                submitter_id: self.submitter_id,
                captured_at: decode_time(&self.captured_at)?,
                origin_url: self.origin_url,
                title: self.title,
            },
            status,
            ledger_reference: self.ledger_reference,
            confirmation_count,
            error_info: self.error_info,
            created_at: decode_time(&self.created_at)?,
            updated_at: decode_time(&self.updated_at)?,
        })
    }
}

/// Fixed-width UTC timestamps sort lexicographically in time order
fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use tempfile::TempDir;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_put_is_insert_if_absent() {
        contract::put_is_insert_if_absent(&store()).await;
    }

    #[tokio::test]
    async fn test_cas_applies_only_on_expected_status() {
        contract::cas_applies_only_on_expected_status(&store()).await;
    }

    #[tokio::test]
    async fn test_cas_rejects_backward_transitions() {
        contract::cas_rejects_backward_transitions(&store()).await;
    }

    #[tokio::test]
    async fn test_cas_keeps_confirmations_monotonic() {
        contract::cas_keeps_confirmations_monotonic(&store()).await;
    }

    #[tokio::test]
    async fn test_cas_on_missing_record() {
        contract::cas_on_missing_record(&store()).await;
    }

    #[tokio::test]
    async fn test_indexes_enumerate() {
        contract::indexes_enumerate(&store()).await;
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db").join("evidence.db");
        let rec = contract::record("a9", "dana", 5_000);

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&rec).await.unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get(&rec.fingerprint).await.unwrap(), Some(rec));
    }

    #[test]
    fn test_time_encoding_roundtrip_keeps_nanos() {
        let now = Utc::now();
        assert_eq!(decode_time(&encode_time(&now)).unwrap(), now);
    }

    #[tokio::test]
    async fn test_out_of_range_confirmations_are_rejected() {
        let store = store();
        let mut rec = contract::record("b1", "erin", 1_000);
        rec.confirmation_count = u64::MAX;
        assert!(matches!(store.put(&rec).await, Err(StoreError::Corrupt(_))));
        assert_eq!(store.get(&rec.fingerprint).await.unwrap(), None);

        rec.confirmation_count = 0;
        assert!(store.put(&rec).await.unwrap());
        let update = StatusUpdate::new(EvidenceStatus::AwaitingConfirmation, Utc::now())
            .with_confirmations(u64::MAX);
        let result = store
            .compare_and_set_status(&rec.fingerprint, rec.status, &update)
            .await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
        assert_eq!(store.get(&rec.fingerprint).await.unwrap().unwrap().status, rec.status);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_share_connection() {
        let store = Arc::new(store());
        let mut writers = tokio::task::JoinSet::new();
        for i in 0..32u8 {
            let store = Arc::clone(&store);
            writers.spawn(async move {
                let rec = contract::record(&format!("{:02x}", i), "fanout", i64::from(i) * 1_000);
                assert!(store.put(&rec).await.unwrap());
                assert_eq!(store.get(&rec.fingerprint).await.unwrap(), Some(rec));
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap();
        }

        let listed = store.list_by_submitter("fanout").await.unwrap();
        assert_eq!(listed.len(), 32);
        assert!(listed
            .windows(2)
            .all(|w| w[0].metadata.captured_at <= w[1].metadata.captured_at));
    }
}
