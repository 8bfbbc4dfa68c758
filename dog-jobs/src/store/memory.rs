use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    store::{Candidate, JobStore, StoreTx},
    JobId, JobRecord, StoreError, StoreResult,
};

type TxId = u64;

#[derive(Default)]
struct Tables {
    /// Committed rows
    rows: HashMap<JobId, JobRecord>,

    /// Unique index: idempotency_key -> job_id (committed rows)
    keys: HashMap<String, JobId>,

    /// Keys inserted by transactions that have not finished yet
    pending_keys: HashSet<String>,

    /// Exclusive row locks: job_id -> holding transaction
    locks: HashMap<JobId, TxId>,
}

struct Shared {
    tables: Mutex<Tables>,
    released: Notify,
    next_tx: AtomicU64,
}

/// In-memory store with real row locking, for tests and single-node use
///
/// Writes are buffered per transaction and published on commit, so other
/// transactions never observe half-applied state. Clones share the same
/// tables.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    /// Number of committed records
    pub fn len(&self) -> usize {
        self.shared.tables.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All committed records in FIFO order (test helper)
    pub fn records(&self) -> Vec<JobRecord> {
        let tables = self.shared.tables.lock();
        let mut records: Vec<JobRecord> = tables.rows.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    /// Check if some open transaction holds the row lock (test helper)
    pub fn is_locked(&self, id: JobId) -> bool {
        self.shared.tables.lock().locks.contains_key(&id)
    }

    /// Overwrite a committed record, bypassing transactions (test helper)
    pub fn put_record(&self, record: JobRecord) {
        let mut tables = self.shared.tables.lock();
        tables.keys.insert(record.idempotency_key.clone(), record.id);
        tables.rows.insert(record.id, record);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx_id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTx {
            shared: Arc::clone(&self.shared),
            tx_id,
            writes: HashMap::new(),
            inserts: Vec::new(),
            closed: false,
        }))
    }

    async fn fetch(&self, id: JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.shared.tables.lock().rows.get(&id).cloned())
    }

    async fn fetch_by_idempotency_key(&self, key: &str) -> StoreResult<Option<JobRecord>> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .keys
            .get(key)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }
}

struct MemoryTx {
    shared: Arc<Shared>,
    tx_id: TxId,
    writes: HashMap<JobId, JobRecord>,
    inserts: Vec<JobRecord>,
    closed: bool,
}

enum LockAttempt {
    Acquired(JobRecord),
    Contended,
    Missing,
}

impl MemoryTx {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::TransactionClosed);
        }
        Ok(())
    }

    fn attempt_lock(&self, id: JobId) -> LockAttempt {
        let mut tables = self.shared.tables.lock();

        if let Some(record) = self.inserts.iter().find(|r| r.id == id) {
            return LockAttempt::Acquired(record.clone());
        }

        let current = match self.writes.get(&id).or_else(|| tables.rows.get(&id)) {
            Some(record) => record.clone(),
            None => return LockAttempt::Missing,
        };

        match tables.locks.get(&id) {
            Some(holder) if *holder != self.tx_id => LockAttempt::Contended,
            _ => {
                tables.locks.insert(id, self.tx_id);
                LockAttempt::Acquired(current)
            }
        }
    }

    /// Drop buffered work and release every lock and key reservation
    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        {
            let mut tables = self.shared.tables.lock();
            for record in &self.inserts {
                tables.pending_keys.remove(&record.idempotency_key);
            }
            let tx_id = self.tx_id;
            tables.locks.retain(|_, holder| *holder != tx_id);
        }

        self.writes.clear();
        self.inserts.clear();
        self.shared.released.notify_waiters();
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert(&mut self, record: &JobRecord) -> StoreResult<()> {
        self.ensure_open()?;
        let mut tables = self.shared.tables.lock();

        if tables.keys.contains_key(&record.idempotency_key)
            || tables.pending_keys.contains(&record.idempotency_key)
        {
            return Err(StoreError::UniqueViolation(record.idempotency_key.clone()));
        }

        tables.pending_keys.insert(record.idempotency_key.clone());
        self.inserts.push(record.clone());
        Ok(())
    }

    async fn eligible_candidates(
        &mut self,
        now: DateTime<Utc>,
        after: Option<Candidate>,
        limit: usize,
    ) -> StoreResult<Vec<Candidate>> {
        self.ensure_open()?;
        let tables = self.shared.tables.lock();

        let mut page: Vec<Candidate> = tables
            .rows
            .values()
            .filter(|record| record.is_eligible(now))
            .map(Candidate::from)
            .filter(|candidate| match after {
                Some(cursor) => (candidate.created_at, candidate.id) > (cursor.created_at, cursor.id),
                None => true,
            })
            .collect();

        page.sort_by_key(|c| (c.created_at, c.id));
        page.truncate(limit);
        Ok(page)
    }

    async fn try_lock(&mut self, id: JobId) -> StoreResult<Option<JobRecord>> {
        self.ensure_open()?;
        match self.attempt_lock(id) {
            LockAttempt::Acquired(record) => Ok(Some(record)),
            LockAttempt::Contended | LockAttempt::Missing => Ok(None),
        }
    }

    async fn lock(&mut self, id: JobId) -> StoreResult<Option<JobRecord>> {
        self.ensure_open()?;
        loop {
            // Register for the wake-up before looking, so a release between
            // the check and the await is not missed.
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.attempt_lock(id) {
                LockAttempt::Acquired(record) => return Ok(Some(record)),
                LockAttempt::Missing => return Ok(None),
                LockAttempt::Contended => released.await,
            }
        }
    }

    async fn update(&mut self, record: &JobRecord) -> StoreResult<()> {
        self.ensure_open()?;

        if let Some(inserted) = self.inserts.iter_mut().find(|r| r.id == record.id) {
            *inserted = record.clone();
            return Ok(());
        }

        let holds_lock = self.shared.tables.lock().locks.get(&record.id) == Some(&self.tx_id);
        if !holds_lock {
            return Err(StoreError::NotLocked(record.id));
        }

        self.writes.insert(record.id, record.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.ensure_open()?;

        {
            let mut tables = self.shared.tables.lock();
            for record in self.inserts.drain(..) {
                tables.pending_keys.remove(&record.idempotency_key);
                tables.keys.insert(record.idempotency_key.clone(), record.id);
                tables.rows.insert(record.id, record);
            }
            for (id, record) in self.writes.drain() {
                tables.rows.insert(id, record);
            }
        }

        self.release();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.ensure_open()?;
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.release();
    }
}
