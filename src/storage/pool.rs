//! Bounded pool of storage handles with scoped release.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::database::{MemoryDatabase, Pending, RowSource, WriteOp};
use super::table::RowKey;
use crate::config::PoolConfig;
use crate::error::{ConnectivityError, DataError};
use crate::model::{Filter, Row};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub closed: bool,
}

/// A bounded set of storage handles.
///
/// `acquire` blocks until a handle is free or the configured timeout
/// elapses. Handles go back to the pool when the [`PooledHandle`] drops, on
/// every exit path including unwinding.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    database: Arc<MemoryDatabase>,
    state: Mutex<PoolState>,
    available: Condvar,
    max_size: usize,
    timeout: Duration,
}

struct PoolState {
    idle: Vec<Handle>,
    in_use: usize,
    opened: usize,
    closed: bool,
}

impl Pool {
    pub fn new(database: Arc<MemoryDatabase>, config: &PoolConfig) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                database,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_use: 0,
                    opened: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                max_size: config.max_size,
                timeout: config.acquire_timeout(),
            }),
        }
    }

    pub fn acquire(&self) -> Result<PooledHandle, DataError> {
        let deadline = Instant::now() + self.inner.timeout;
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| ConnectivityError::Poisoned("pool acquire"))?;
        loop {
            if state.closed {
                return Err(ConnectivityError::Closed.into());
            }
            if let Some(handle) = state.idle.pop() {
                state.in_use += 1;
                tracing::trace!(handle = handle.id, "reusing pooled handle");
                return Ok(self.wrap(handle));
            }
            if state.in_use < self.inner.max_size {
                state.in_use += 1;
                state.opened += 1;
                let handle = Handle::new(Arc::clone(&self.inner.database), state.opened);
                tracing::debug!(handle = handle.id, "opened storage handle");
                return Ok(self.wrap(handle));
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    max_size = self.inner.max_size,
                    timeout_ms = self.inner.timeout.as_millis() as u64,
                    "storage pool exhausted"
                );
                return Err(ConnectivityError::PoolTimeout(self.inner.timeout).into());
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| ConnectivityError::Poisoned("pool acquire"))?;
            state = guard;
        }
    }

    /// Stop handing out handles. Handles already out stay usable until
    /// dropped.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.idle.clear();
        self.inner.available.notify_all();
        tracing::info!("storage pool closed");
    }

    pub fn reopen(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = false;
        tracing::info!("storage pool reopened");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        PoolStatus {
            max_size: self.inner.max_size,
            idle: state.idle.len(),
            in_use: state.in_use,
            closed: state.closed,
        }
    }

    fn wrap(&self, handle: Handle) -> PooledHandle {
        PooledHandle {
            handle: Some(handle),
            pool: self.clone(),
        }
    }

    fn release(&self, mut handle: Handle) {
        if handle.transaction.take().is_some() {
            tracing::warn!(handle = handle.id, "rolled back transaction on released handle");
        }
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_use = state.in_use.saturating_sub(1);
        if !state.closed {
            state.idle.push(handle);
        }
        self.inner.available.notify_one();
    }
}

/// A handle checked out of a [`Pool`].
pub struct PooledHandle {
    handle: Option<Handle>,
    pool: Pool,
}

impl Deref for PooledHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        // Only `Drop` takes the handle out.
        self.handle.as_ref().expect("pooled handle already released")
    }
}

impl DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut Handle {
        self.handle.as_mut().expect("pooled handle already released")
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

/// Result of an insert.
#[derive(Debug, Clone)]
pub struct Inserted {
    pub key: Value,
    /// The stored row, when the insert was asked to return it.
    pub row: Option<Row>,
}

struct Transaction {
    pending: Pending,
    log: Vec<WriteOp>,
}

/// One storage session. Outside a transaction every write lands
/// immediately; inside one, writes are held in a private pending layer that
/// reads see through, and the write log is replayed atomically on commit.
pub struct Handle {
    database: Arc<MemoryDatabase>,
    id: usize,
    transaction: Option<Transaction>,
}

impl Handle {
    fn new(database: Arc<MemoryDatabase>, id: usize) -> Self {
        Handle {
            database,
            id,
            transaction: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn begin(&mut self) -> Result<(), DataError> {
        if self.transaction.is_some() {
            return Err(DataError::Transaction("transaction already open"));
        }
        self.transaction = Some(Transaction {
            pending: Pending::default(),
            log: Vec::new(),
        });
        tracing::debug!(handle = self.id, "begin transaction");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), DataError> {
        let transaction = self
            .transaction
            .take()
            .ok_or(DataError::Transaction("no open transaction"))?;
        self.database.apply(&transaction.log)?;
        tracing::debug!(handle = self.id, writes = transaction.log.len(), "committed transaction");
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), DataError> {
        let transaction = self
            .transaction
            .take()
            .ok_or(DataError::Transaction("no open transaction"))?;
        tracing::debug!(handle = self.id, writes = transaction.log.len(), "rolled back transaction");
        Ok(())
    }

    /// Insert a row; the key (and version, for versioned tables) is
    /// generated by storage.
    pub fn insert(&mut self, table: &str, values: Row, returning: bool) -> Result<Inserted, DataError> {
        let key = self.database.next_key(table)?;
        let stored = match &mut self.transaction {
            Some(tx) => {
                let base = self.database.read()?;
                let stored = tx.pending.insert(&base, table, values, key.clone())?;
                tx.log.push(WriteOp::Insert {
                    table: table.to_string(),
                    row: stored.clone(),
                });
                stored
            }
            None => self.database.write()?.insert(table, values, key.clone())?,
        };
        tracing::debug!(handle = self.id, table, key = %key, "insert");
        Ok(Inserted {
            key,
            row: returning.then_some(stored),
        })
    }

    /// Update a row, returning its new version for versioned tables.
    pub fn update(
        &mut self,
        table: &str,
        key: &Value,
        changes: &Row,
        expected_version: Option<u64>,
    ) -> Result<Option<u64>, DataError> {
        let row_key = RowKey::from_value(table, key)?;
        let version = match &mut self.transaction {
            Some(tx) => {
                let base = self.database.read()?;
                let version = tx
                    .pending
                    .update(&base, table, &row_key, changes, expected_version)?;
                tx.log.push(WriteOp::Update {
                    table: table.to_string(),
                    key: row_key.clone(),
                    changes: changes.clone(),
                    expected_version,
                });
                version
            }
            None => self
                .database
                .write()?
                .update(table, &row_key, changes, expected_version)?,
        };
        tracing::debug!(handle = self.id, table, key = %row_key, fields = changes.len(), "update");
        Ok(version)
    }

    pub fn delete(
        &mut self,
        table: &str,
        key: &Value,
        expected_version: Option<u64>,
    ) -> Result<(), DataError> {
        let row_key = RowKey::from_value(table, key)?;
        match &mut self.transaction {
            Some(tx) => {
                let base = self.database.read()?;
                tx.pending.delete(&base, table, &row_key, expected_version)?;
                tx.log.push(WriteOp::Delete {
                    table: table.to_string(),
                    key: row_key.clone(),
                    expected_version,
                });
            }
            None => self
                .database
                .write()?
                .delete(table, &row_key, expected_version)?,
        }
        tracing::debug!(handle = self.id, table, key = %row_key, "delete");
        Ok(())
    }

    pub fn select(&self, table: &str, key: &Value) -> Result<Option<Row>, DataError> {
        let row_key = RowKey::from_value(table, key)?;
        match &self.transaction {
            Some(tx) => tx.pending.over(&*self.database.read()?).select(table, &row_key),
            None => self.database.read()?.select(table, &row_key),
        }
    }

    pub fn scan(
        &self,
        table: &str,
        filter: &Filter,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>, DataError> {
        match &self.transaction {
            Some(tx) => tx.pending.over(&*self.database.read()?).scan(table, filter, order_by),
            None => self.database.read()?.scan(table, filter, order_by),
        }
    }
}
