//! Multi-reader / single-writer `SQLite` pool.
//!
//! `SQLite` permits many concurrent readers but exactly one writer. The
//! pool makes that discipline structural: readers come from a bounded
//! `r2d2` pool and may run in parallel; every write goes through the one
//! writer connection behind a mutex, inside an `IMMEDIATE` transaction
//! that commits on success and rolls back on error or panic.
//!
//! Foreign keys and WAL mode are enabled on every connection. In-memory
//! databases are rejected — `:memory:` cannot be shared across the pool's
//! connections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use crate::errors::{Result, StoreError};

/// Configuration for [`Pool::open`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Path to the database file. Parent directories are created.
    pub path: PathBuf,
    /// Number of reader connections (minimum 2).
    pub readers: u32,
    /// Busy timeout applied to every connection, in milliseconds.
    pub busy_timeout_ms: u32,
}

impl PoolConfig {
    /// Config with default sizing for the given path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            readers: 3,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Pragmas applied to each new reader connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        apply_pragmas(conn, self.busy_timeout_ms)
    }
}

fn apply_pragmas(
    conn: &Connection,
    busy_timeout_ms: u32,
) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;\
         PRAGMA busy_timeout = {busy_timeout_ms};\
         PRAGMA foreign_keys = ON;\
         PRAGMA synchronous = NORMAL;"
    ))
}

/// The reader/writer pool.
pub struct Pool {
    writer: Mutex<Connection>,
    readers: r2d2::Pool<SqliteConnectionManager>,
}

impl Pool {
    /// Open the database file and build the pool.
    ///
    /// # Errors
    ///
    /// [`StoreError::Config`] for an empty or `:memory:` path or fewer than
    /// two readers; connection-open failures are fatal and returned as-is.
    pub fn open(config: &PoolConfig) -> Result<Self> {
        let path_str = config.path.to_string_lossy();
        if path_str.is_empty() {
            return Err(StoreError::Config("database path cannot be empty".into()));
        }
        if path_str == ":memory:" {
            return Err(StoreError::Config(
                ":memory: database not supported (the pool requires multiple connections); \
                 use a temp file"
                    .into(),
            ));
        }
        if config.readers < 2 {
            return Err(StoreError::Config(format!(
                "pool requires at least 2 readers, got {}",
                config.readers
            )));
        }

        ensure_parent_dir(&config.path)?;

        let writer = Connection::open(&config.path)?;
        apply_pragmas(&writer, config.busy_timeout_ms)?;

        let manager = SqliteConnectionManager::file(&config.path);
        let readers = r2d2::Pool::builder()
            .max_size(config.readers)
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)?;

        debug!(path = %path_str, readers = config.readers, "database pool opened");

        Ok(Self {
            writer: Mutex::new(writer),
            readers,
        })
    }

    /// Run `f` with a reader connection. Parallel with other readers;
    /// acquisition blocks when all readers are in use.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.readers.get()?;
        f(&conn).map_err(StoreError::remap_busy)
    }

    /// Run `f` inside an exclusive write transaction.
    ///
    /// The transaction begins `IMMEDIATE`, commits when `f` returns `Ok`,
    /// and rolls back when `f` returns `Err` or panics (transaction drop).
    /// Serialized with all other writes.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::from(e).remap_busy())?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(|e| StoreError::from(e).remap_busy())?;
                Ok(value)
            }
            Err(e) => Err(e.remap_busy()),
        }
    }

    /// Execute one statement inside its own write transaction.
    pub fn exec(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        self.write(|tx| Ok(tx.execute(sql, params)?))
    }

    /// Execute a batch of statements inside one write transaction.
    pub fn exec_batch(&self, sql: &str) -> Result<()> {
        self.write(|tx| Ok(tx.execute_batch(sql)?))
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Config(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::open(&PoolConfig::new(dir.path().join("test.db"))).unwrap();
        (dir, pool)
    }

    #[test]
    fn empty_path_rejected() {
        let err = match Pool::open(&PoolConfig::new("")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn memory_path_rejected() {
        let err = match Pool::open(&PoolConfig::new(":memory:")) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, StoreError::Config(_)));
        assert!(err.to_string().contains(":memory:"));
    }

    #[test]
    fn too_few_readers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PoolConfig::new(dir.path().join("test.db"));
        config.readers = 1;
        assert!(matches!(
            Pool::open(&config),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn parent_directory_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b").join("test.db");
        let pool = Pool::open(&PoolConfig::new(&nested)).unwrap();
        pool.exec_batch("CREATE TABLE t (x INTEGER)").unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn write_commits_on_ok() {
        let (_dir, pool) = open_temp_pool();
        pool.exec_batch("CREATE TABLE t (x INTEGER)").unwrap();
        pool.write(|tx| {
            tx.execute("INSERT INTO t (x) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();

        let count: i64 = pool
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn write_rolls_back_on_err() {
        let (_dir, pool) = open_temp_pool();
        pool.exec_batch("CREATE TABLE t (x INTEGER)").unwrap();

        let result: Result<()> = pool.write(|tx| {
            tx.execute("INSERT INTO t (x) VALUES (1)", [])?;
            Err(StoreError::Internal("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = pool
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn foreign_keys_enabled_everywhere() {
        let (_dir, pool) = open_temp_pool();
        let on: i64 = pool
            .read(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(on, 1);

        let on: i64 = pool
            .write(|tx| Ok(tx.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(on, 1);
    }

    #[test]
    fn parallel_readers() {
        let (_dir, pool) = open_temp_pool();
        pool.exec_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7);")
            .unwrap();

        // Acquire one reader while another read scope is active.
        pool.read(|a| {
            let inner: i64 = pool
                .read(|b| Ok(b.query_row("SELECT x FROM t", [], |r| r.get(0))?))?;
            let outer: i64 = a.query_row("SELECT x FROM t", [], |r| r.get(0))?;
            assert_eq!(inner, outer);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn writes_serialized_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            std::sync::Arc::new(Pool::open(&PoolConfig::new(dir.path().join("test.db"))).unwrap());
        pool.exec_batch("CREATE TABLE t (x INTEGER)").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    pool.exec("INSERT INTO t (x) VALUES (?1)", [i]).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let count: i64 = pool
            .read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 8);
    }
}
