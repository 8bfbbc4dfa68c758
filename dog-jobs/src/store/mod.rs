//! Persistence interface for job records.
//!
//! The store owns all job state. Callers never cache a record across
//! transactions: every read that informs a transition happens inside the
//! [`StoreTx`] that writes it.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{JobId, JobRecord, StoreResult};

pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// An eligible row found by a scan, also used as the keyset cursor for the next page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
}

impl From<&JobRecord> for Candidate {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            created_at: record.created_at,
        }
    }
}

/// Durable store of job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Open a transaction
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Read a committed record by id
    async fn fetch(&self, id: JobId) -> StoreResult<Option<JobRecord>>;

    /// Read a committed record by idempotency key
    async fn fetch_by_idempotency_key(&self, key: &str) -> StoreResult<Option<JobRecord>>;
}

/// A single all-or-nothing unit of work against the store
///
/// Row locks taken through [`StoreTx::try_lock`] or [`StoreTx::lock`] are
/// exclusive and held until commit or rollback. Dropping an open
/// transaction rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Insert a new record
    ///
    /// Fails with [`crate::StoreError::UniqueViolation`] when another record
    /// (committed or in flight) already uses the idempotency key.
    async fn insert(&mut self, record: &JobRecord) -> StoreResult<()>;

    /// Page of eligible rows in `(created_at, id)` order, strictly after `after`
    ///
    /// Takes no locks: the result may include rows other transactions are
    /// about to claim, so every candidate must be re-read under a lock.
    async fn eligible_candidates(
        &mut self,
        now: DateTime<Utc>,
        after: Option<Candidate>,
        limit: usize,
    ) -> StoreResult<Vec<Candidate>>;

    /// Lock a row without waiting and return its current contents
    ///
    /// Returns `None` when another transaction holds the lock (skip-locked)
    /// or the row does not exist.
    async fn try_lock(&mut self, id: JobId) -> StoreResult<Option<JobRecord>>;

    /// Lock a row, waiting for any competing holder, and return its contents
    async fn lock(&mut self, id: JobId) -> StoreResult<Option<JobRecord>>;

    /// Overwrite a row locked by (or inserted in) this transaction
    async fn update(&mut self, record: &JobRecord) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
