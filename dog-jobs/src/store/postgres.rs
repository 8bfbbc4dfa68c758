//! Postgres-backed job store.
//!
//! Claims rely on `SELECT ... FOR UPDATE SKIP LOCKED`, so any number of
//! worker processes can share one `jobs` table. Idempotency is enforced by
//! the unique index on `idempotency_key`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (other) | any | `Backend` |
//! | Decode / ColumnDecode | N/A | `Corrupt` |
//! | Other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use crate::{
    store::{Candidate, JobStore, StoreTx},
    JobId, JobRecord, JobState, StoreError, StoreResult, WorkerId,
};

const MIGRATION: &str = include_str!("../../migrations/0001_create_jobs.sql");

const COLUMNS: &str = "id, job_type, payload, idempotency_key, state, lease_owner, lease_expiry, \
                       retry_count, max_retries, created_at, updated_at, last_error";

/// Job store on a shared Postgres `jobs` table
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` and return a store on the new pool
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` table and its indexes if they are missing
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PostgresTx { tx: Some(tx) }))
    }

    async fn fetch(&self, id: JobId) -> StoreResult<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = $1", COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch", e))?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn fetch_by_idempotency_key(&self, key: &str) -> StoreResult<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE idempotency_key = $1",
            COLUMNS
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_by_idempotency_key", e))?;
        row.as_ref().map(decode_record).transpose()
    }
}

struct PostgresTx {
    /// `None` once committed or rolled back
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTx {
    fn conn(&mut self) -> StoreResult<&mut Transaction<'static, Postgres>> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }

    async fn select_for_update(
        &mut self,
        id: JobId,
        lock_clause: &str,
    ) -> StoreResult<Option<JobRecord>> {
        let conn = self.conn()?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE id = $1 {}",
            COLUMNS, lock_clause
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **conn)
        .await
        .map_err(|e| map_sqlx_error("lock", e))?;
        row.as_ref().map(decode_record).transpose()
    }
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn insert(&mut self, record: &JobRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        sqlx::query(&format!(
            "INSERT INTO jobs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            COLUMNS
        ))
        .bind(record.id.as_uuid())
        .bind(&record.job_type)
        .bind(&record.payload)
        .bind(&record.idempotency_key)
        .bind(record.state.as_str())
        .bind(record.lease_owner.as_ref().map(|w| w.as_str()))
        .bind(record.lease_expiry)
        .bind(to_db_count(record.retry_count)?)
        .bind(to_db_count(record.max_retries)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.last_error.as_deref())
        .execute(&mut **conn)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    async fn eligible_candidates(
        &mut self,
        now: DateTime<Utc>,
        after: Option<Candidate>,
        limit: usize,
    ) -> StoreResult<Vec<Candidate>> {
        let conn = self.conn()?;
        let rows = sqlx::query(
            r#"
            SELECT id, created_at
            FROM jobs
            WHERE (
                    (state IN ('PENDING', 'QUEUED') AND (lease_expiry IS NULL OR lease_expiry < $1))
                 OR (state = 'RUNNING' AND lease_expiry < $1)
                  )
              AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3))
            ORDER BY created_at, id
            LIMIT $4
            "#,
        )
        .bind(now)
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| *c.id.as_uuid()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut **conn)
        .await
        .map_err(|e| map_sqlx_error("eligible_candidates", e))?;

        rows.iter()
            .map(|row| {
                Ok(Candidate {
                    id: JobId::from(row.try_get::<uuid::Uuid, _>("id").map_err(decode_error)?),
                    created_at: row.try_get("created_at").map_err(decode_error)?,
                })
            })
            .collect()
    }

    async fn try_lock(&mut self, id: JobId) -> StoreResult<Option<JobRecord>> {
        self.select_for_update(id, "FOR UPDATE SKIP LOCKED").await
    }

    async fn lock(&mut self, id: JobId) -> StoreResult<Option<JobRecord>> {
        self.select_for_update(id, "FOR UPDATE").await
    }

    async fn update(&mut self, record: &JobRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                lease_owner = $3,
                lease_expiry = $4,
                retry_count = $5,
                updated_at = $6,
                last_error = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.state.as_str())
        .bind(record.lease_owner.as_ref().map(|w| w.as_str()))
        .bind(record.lease_expiry)
        .bind(to_db_count(record.retry_count)?)
        .bind(record.updated_at)
        .bind(record.last_error.as_deref())
        .execute(&mut **conn)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotLocked(record.id));
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn decode_record(row: &PgRow) -> StoreResult<JobRecord> {
    let state: String = row.try_get("state").map_err(decode_error)?;
    let lease_owner: Option<String> = row.try_get("lease_owner").map_err(decode_error)?;
    let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;

    Ok(JobRecord {
        id: JobId::from(id),
        job_type: row.try_get("job_type").map_err(decode_error)?,
        payload: row.try_get("payload").map_err(decode_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode_error)?,
        state: state.parse::<JobState>().map_err(StoreError::Corrupt)?,
        lease_owner: lease_owner.map(WorkerId::from),
        lease_expiry: row.try_get("lease_expiry").map_err(decode_error)?,
        retry_count: from_db_count(row.try_get("retry_count").map_err(decode_error)?)?,
        max_retries: from_db_count(row.try_get("max_retries").map_err(decode_error)?)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
        last_error: row.try_get("last_error").map_err(decode_error)?,
    })
}

fn to_db_count(value: u32) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("count {} out of range", value)))
}

fn from_db_count(value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative count {}", value)))
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode job row: {}", err))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("23505") {
                StoreError::UniqueViolation(format!("{}: {}", operation, db_err.message()))
            } else {
                StoreError::Backend(format!("database error in {}: {}", operation, db_err.message()))
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    #[test]
    fn test_counts_convert_within_range() {
        assert_eq!(to_db_count(3).unwrap(), 3);
        assert_eq!(from_db_count(7).unwrap(), 7);
        assert!(matches!(to_db_count(u32::MAX), Err(StoreError::Corrupt(_))));
        assert!(matches!(from_db_count(-1), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_sqlx_errors_are_classified() {
        assert!(matches!(
            map_sqlx_error("claim", sqlx::Error::PoolClosed),
            StoreError::Backend(msg) if msg.contains("claim")
        ));
        assert!(matches!(
            map_sqlx_error("fetch", sqlx::Error::Decode("bad bytes".into())),
            StoreError::Corrupt(_)
        ));
        assert!(matches!(
            map_sqlx_error("fetch", sqlx::Error::RowNotFound),
            StoreError::Backend(_)
        ));
        assert!(!map_sqlx_error("insert", sqlx::Error::PoolTimedOut).is_unique_violation());
    }

    fn record(key: &str, now: DateTime<Utc>) -> JobRecord {
        JobRecord::new("pg_test", b"{}".to_vec(), key, 3, now)
    }

    fn leased(mut record: JobRecord, state: JobState, expiry: DateTime<Utc>) -> JobRecord {
        record.state = state;
        record.lease_owner = Some(WorkerId::from("w-pg"));
        record.lease_expiry = Some(expiry);
        record
    }

    /// Runs against a live database: `DATABASE_URL=... cargo test --features postgres -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_claim_queries_against_live_database() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let store = PostgresStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();

        let now = Utc::now();
        let run = uuid::Uuid::new_v4();
        let key = |name: &str| format!("pg-{}-{}", run, name);

        let mut finished = record(&key("success"), now);
        finished.state = JobState::Success;
        let mut dead = record(&key("dead"), now);
        dead.state = JobState::Dead;
        let rows = vec![
            record(&key("pending"), now),
            leased(record(&key("expired"), now), JobState::Running, now - Duration::hours(1)),
            leased(record(&key("live"), now), JobState::Running, now + Duration::hours(1)),
            finished,
            dead,
        ];

        let mut tx = store.begin().await.unwrap();
        for row in &rows {
            tx.insert(row).await.unwrap();
        }
        tx.commit().await.unwrap();

        // The SQL predicate must select exactly what the record itself calls eligible.
        let ours: HashSet<JobId> = rows.iter().map(|r| r.id).collect();
        let expected: HashSet<JobId> =
            rows.iter().filter(|r| r.is_eligible(now)).map(|r| r.id).collect();
        let mut found = HashSet::new();
        let mut cursor = None;
        let mut tx = store.begin().await.unwrap();
        loop {
            let page = tx.eligible_candidates(now, cursor, 50).await.unwrap();
            let Some(last) = page.last().copied() else {
                break;
            };
            found.extend(page.iter().map(|c| c.id).filter(|id| ours.contains(id)));
            cursor = Some(last);
        }
        tx.rollback().await.unwrap();
        assert_eq!(found, expected);

        // A row held by one transaction is skipped by another.
        let pending = rows[0].id;
        let mut holder = store.begin().await.unwrap();
        assert!(holder.try_lock(pending).await.unwrap().is_some());
        let mut other = store.begin().await.unwrap();
        assert!(other.try_lock(pending).await.unwrap().is_none());
        other.rollback().await.unwrap();
        holder.rollback().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let duplicate = record(&key("pending"), now);
        assert!(tx.insert(&duplicate).await.unwrap_err().is_unique_violation());
        tx.rollback().await.unwrap();

        sqlx::query("DELETE FROM jobs WHERE job_type = 'pg_test' AND idempotency_key LIKE $1")
            .bind(format!("pg-{}-%", run))
            .execute(store.pool())
            .await
            .unwrap();
    }
}
