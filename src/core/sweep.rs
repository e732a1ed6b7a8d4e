//! Purpose: Periodic background sweeping for the store and the in-memory LRU cache.
//! Exports: `Sweeper`, `sweep_table`.
//! Role: Owns one named thread that runs a pass every interval until stopped.
//! Invariants: No pass starts after `stop` is called; `stop` returns only once the thread has exited.
//! Invariants: Table sweeps delete in bounded batches so no single statement holds the write lock long.
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::Connection;

use crate::core::clock::now_millis;
use crate::core::error::{Error, ErrorKind};
use crate::core::table::{TableKind, compact_positions};
use crate::core::tx::with_transaction;

pub(crate) struct Sweeper {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn spawn<F>(name: &str, interval: Duration, mut pass: F) -> Result<Self, Error>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => pass(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message(format!("spawn {name} thread"))
                    .with_source(err)
            })?;
        Ok(Self { stop_tx, handle })
    }

    /// Signals the thread and waits for any in-flight pass to finish.
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::warn!("sweep thread panicked");
        }
    }
}

/// Deletes expired rows from `table` in batches until a batch comes back
/// short. List tables are renumbered afterwards when anything was removed.
pub(crate) fn sweep_table(
    conn: &Connection,
    table: &str,
    kind: TableKind,
    batch_size: usize,
) -> Result<usize, Error> {
    let now = now_millis();
    let batch = i64::try_from(batch_size).unwrap_or(i64::MAX);
    let sql = format!(
        "DELETE FROM {table}
            WHERE rowid IN (
                SELECT rowid FROM {table}
                WHERE expires_at != 0 AND expires_at <= ?1
                ORDER BY expires_at ASC
                LIMIT ?2
            )"
    );

    let mut removed = 0usize;
    loop {
        let deleted = conn.execute(&sql, rusqlite::params![now, batch]).map_err(|err| {
            Error::new(ErrorKind::Query)
                .with_message("sweep: delete expired rows")
                .with_table(table)
                .with_source(err)
        })?;
        removed += deleted;
        if deleted < batch_size {
            break;
        }
    }

    if removed > 0 && kind == TableKind::List {
        with_transaction(conn, "sweep", |tx| compact_positions(tx, table, now))?;
    }
    Ok(removed)
}
