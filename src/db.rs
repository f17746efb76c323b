//! Store access layer
//!
//! SQLite behind a single connection: one writer, short transactions.
//! Blocking I/O never runs on async worker threads; every call is routed
//! through `spawn_blocking`, and a semaphore bounds how many store jobs are
//! in flight so a slow write cannot starve the coordination hot path.

use crate::backoff::backoff_delay;
use crate::config::StoreConfig;
use crate::error::{EngineError, Result};
use crate::types::parse_ts;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Open a connection and apply local pragmas
pub fn open_connection(path: &Path, busy_timeout_ms: u64) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| {
        EngineError::Other(anyhow::anyhow!(
            "failed to open database at {}: {e}",
            path.display()
        ))
    })?;
    configure(&conn, busy_timeout_ms)?;
    Ok(conn)
}

fn configure(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Shared handle to the relational store
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    permits: Semaphore,
    config: StoreConfig,
}

impl Store {
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        let conn = open_connection(path, config.busy_timeout_ms)?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::from_connection(conn, config))
    }

    fn from_connection(conn: Connection, config: &StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                permits: Semaphore::new(config.workers.max(1)),
                config: config.clone(),
            }),
        }
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|e| EngineError::Other(anyhow::anyhow!("store closed: {e}")))?;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = inner.conn.lock();
            f(&mut conn)
        })
        .await?
    }

    /// Run `f` inside an IMMEDIATE transaction, retrying transient failures.
    ///
    /// Any error from `f` rolls the whole transaction back. Only transient
    /// errors are retried, up to `max_retries` times with backoff; on
    /// exhaustion the last error is returned and nothing is committed.
    pub async fn transaction<F, T>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(&Transaction<'_>) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0u32;
        loop {
            let f = Arc::clone(&f);
            let result = self.call(move |conn| run_in_transaction(conn, |tx| (*f)(tx))).await;
            match result {
                Err(err) if err.is_transient() && attempt < self.inner.config.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(
                        Duration::from_millis(self.inner.config.retry_backoff_ms),
                        attempt,
                        Duration::from_secs(5),
                    );
                    warn!(op, attempt, error = %err, ?delay, "transient store error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(op, attempts = attempt + 1, error = %err, "store retries exhausted");
                    }
                    return Err(err);
                }
                Ok(value) => {
                    debug!(op, attempts = attempt + 1, "transaction committed");
                    return Ok(value);
                }
            }
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }
}

/// Run `f` in an IMMEDIATE transaction on a plain connection
pub fn run_in_transaction<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Add a column unless it already exists
pub fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"), [])?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Read an RFC 3339 text column
pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn ts_col_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        parse_ts(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn sql_to_bool(value: i64) -> bool {
    value != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn store() -> Store {
        Store::open_in_memory(&StoreConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_call_runs_off_thread() {
        let store = store();
        let n: i64 = store
            .call(|conn| Ok(conn.query_row("SELECT 41 + 1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 42);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let store = store();
        store
            .call(|conn| {
                conn.execute_batch("CREATE TABLE t (v INTEGER)")?;
                Ok(())
            })
            .await
            .unwrap();

        let result: Result<()> = store
            .transaction("test", |tx| {
                tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
                Err(EngineError::validation("boom"))
            })
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));

        let count: i64 = store
            .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_surface() {
        let mut config = StoreConfig::default();
        config.max_retries = 2;
        config.retry_backoff_ms = 1;
        let store = Store::open_in_memory(&config).unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: Result<()> = store
            .transaction("always-busy", move |_tx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::TransientStore("database is locked".into()))
            })
            .await;

        assert!(matches!(result, Err(EngineError::TransientStore(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let mut config = StoreConfig::default();
        config.retry_backoff_ms = 1;
        let store = Store::open_in_memory(&config).unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let value = store
            .transaction("flaky", move |_tx| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EngineError::TransientStore("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_ensure_column_is_idempotent() {
        let dir = tempdir().unwrap();
        let conn = open_connection(&dir.path().join("t.db"), 1000).unwrap();
        conn.execute_batch("CREATE TABLE h (id TEXT)").unwrap();

        ensure_column(&conn, "h", "note", "TEXT NOT NULL DEFAULT ''").unwrap();
        ensure_column(&conn, "h", "note", "TEXT NOT NULL DEFAULT ''").unwrap();
        assert!(table_has_column(&conn, "h", "note").unwrap());
        assert!(table_exists(&conn, "h").unwrap());
        assert!(!table_exists(&conn, "missing").unwrap());
    }
}
