//! Purpose: Own the SQLite connection pool, the table registry and the expiration sweep.
//! Exports: `Store`, `SweepReport`.
//! Role: Shared handle every collection is opened against; cloning shares one inner state.
//! Invariants: The registry is per handle, de-duplicated and insertion ordered.
//! Invariants: After `close` every operation fails with `ErrorKind::StoreClosed`.
//! Invariants: `close` stops the sweep and waits for it before releasing connections.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::core::error::{Error, ErrorKind};
use crate::core::options::StoreOptions;
use crate::core::sweep::{Sweeper, sweep_table};
use crate::core::table::{TableKind, create_table};
use crate::core::tx::with_transaction;

pub(crate) type SqlitePool = Pool<SqliteConnectionManager>;
pub(crate) type PooledConn = PooledConnection<SqliteConnectionManager>;

const MEMORY_PATH: &str = ":memory:";

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RegisteredTable {
    pub(crate) name: String,
    pub(crate) kind: TableKind,
}

type Registry = Arc<Mutex<Vec<RegisteredTable>>>;

/// Rows removed from one table by a sweep pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SweepReport {
    pub table: String,
    pub removed: usize,
}

struct StoreInner {
    path: PathBuf,
    options: StoreOptions,
    pool: RwLock<Option<SqlitePool>>,
    tables: Registry,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` with default options
    /// and starts the background sweep.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let in_memory = path.as_os_str() == MEMORY_PATH;

        // Fail fast on an unusable path before the pool starts retrying.
        let first = Connection::open(&path).map_err(|err| unavailable(&path, "open database", err))?;
        configure_connection(&first, &options)
            .map_err(|err| unavailable(&path, "configure database", err))?;
        drop(first);

        let manager = if in_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(&path)
        };
        let init_options = options.clone();
        let manager = manager.with_init(move |conn| configure_connection(conn, &init_options));
        // Each in-memory connection is its own database, so keep exactly one.
        let max_size = if in_memory { 1 } else { options.max_connections };
        let (max_lifetime, idle_timeout) = connection_recycling(in_memory);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .max_lifetime(max_lifetime)
            .idle_timeout(idle_timeout)
            .connection_timeout(options.busy_timeout.max(Duration::from_millis(100)))
            .build(manager)
            .map_err(|err| {
                Error::new(ErrorKind::StoreUnavailable)
                    .with_message(format!("build connection pool for {}", path.display()))
                    .with_source(err)
            })?;

        let tables: Registry = Arc::new(Mutex::new(Vec::new()));
        let sweeper = Sweeper::spawn(
            "stowage-sweep",
            options.sweep_interval,
            sweep_pass(pool.clone(), Arc::clone(&tables), options.sweep_batch_size),
        )?;

        tracing::debug!(path = %path.display(), max_size, "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                options,
                pool: RwLock::new(Some(pool)),
                tables,
                sweeper: Mutex::new(Some(sweeper)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stops the sweep, waits for it to finish, and releases the pool.
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
        let pool = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            tracing::debug!(path = %self.inner.path.display(), "store closed");
        }
        Ok(())
    }

    /// Names of the tables collections have opened on this handle, in registration order.
    pub fn registered_tables(&self) -> Vec<String> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|table| table.name.clone())
            .collect()
    }

    /// Collection tables present in the database file, whether or not this
    /// handle has opened them.
    pub fn existing_tables(&self) -> Result<Vec<String>, Error> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(|err| query_error("store.existing_tables: prepare", err))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| query_error("store.existing_tables: query", err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| query_error("store.existing_tables: read row", err))?;
        Ok(names
            .into_iter()
            .filter(|name| TableKind::from_table_name(name).is_some())
            .collect())
    }

    /// Runs one sweep pass over every registered table on the caller's thread.
    pub fn sweep_now(&self) -> Result<Vec<SweepReport>, Error> {
        let conn = self.conn()?;
        let tables = snapshot(&self.inner.tables);
        let mut reports = Vec::with_capacity(tables.len());
        for table in tables {
            let removed = sweep_table(
                &conn,
                &table.name,
                table.kind,
                self.inner.options.sweep_batch_size,
            )?;
            reports.push(SweepReport {
                table: table.name,
                removed,
            });
        }
        Ok(reports)
    }

    pub(crate) fn conn(&self) -> Result<PooledConn, Error> {
        let pool = self
            .inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::StoreClosed).with_message("store is closed"))?;
        pool.get().map_err(|err| {
            Error::new(ErrorKind::StoreUnavailable)
                .with_message("acquire connection")
                .with_source(err)
        })
    }

    pub(crate) fn transaction<T>(
        &self,
        op: &str,
        f: impl FnOnce(&Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let conn = self.conn()?;
        with_transaction(&conn, op, f)
    }

    /// Creates the table if absent and registers it for sweeping.
    pub(crate) fn ensure_table(&self, kind: TableKind, table: &str) -> Result<(), Error> {
        self.transaction(&format!("store.create_{}", kind.prefix()), |tx| {
            create_table(tx, kind, table)
        })?;
        self.register_table(kind, table);
        Ok(())
    }

    /// Adds an existing table to this handle's sweep registry. Registering the
    /// same table twice is a no-op.
    pub fn register_table(&self, kind: TableKind, table: &str) {
        let mut tables = self
            .inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !tables.iter().any(|known| known.name == table) {
            tables.push(RegisteredTable {
                name: table.to_string(),
                kind,
            });
        }
    }
}

fn configure_connection(conn: &Connection, options: &StoreOptions) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(options.busy_timeout)?;
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -{};
         PRAGMA auto_vacuum = INCREMENTAL;",
        options.cache_size_kib
    ))
}

/// Max lifetime and idle timeout for pooled connections. An in-memory
/// database lives only as long as its single connection, so it is never recycled.
fn connection_recycling(in_memory: bool) -> (Option<Duration>, Option<Duration>) {
    if in_memory {
        (None, None)
    } else {
        (
            Some(Duration::from_secs(30 * 60)),
            Some(Duration::from_secs(10 * 60)),
        )
    }
}

fn snapshot(tables: &Registry) -> Vec<RegisteredTable> {
    tables
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn sweep_pass(pool: SqlitePool, tables: Registry, batch_size: usize) -> impl FnMut() + Send + 'static {
    move || {
        let tables = snapshot(&tables);
        if tables.is_empty() {
            return;
        }
        let conn = match pool.get() {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "sweep: acquire connection");
                return;
            }
        };
        for table in tables {
            match sweep_table(&conn, &table.name, table.kind, batch_size) {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(table = %table.name, removed, "swept expired rows"),
                Err(err) => tracing::warn!(table = %table.name, error = %err, "sweep failed"),
            }
        }
    }
}

fn unavailable(path: &Path, what: &str, err: rusqlite::Error) -> Error {
    Error::new(ErrorKind::StoreUnavailable)
        .with_message(format!("{what} at {}", path.display()))
        .with_source(err)
}

fn query_error(message: &str, err: rusqlite::Error) -> Error {
    Error::new(ErrorKind::Query)
        .with_message(message.to_string())
        .with_source(err)
}
