// Scoped write transaction: begin immediate, run, commit; roll back on error or unwind.
use rusqlite::Connection;

use crate::core::error::{Error, ErrorKind};

/// Rolls back on drop unless `commit` consumed it.
struct TxGuard<'a> {
    conn: &'a Connection,
    finished: bool,
}

impl<'a> TxGuard<'a> {
    fn begin(conn: &'a Connection, op: &str) -> Result<Self, Error> {
        conn.execute_batch("BEGIN IMMEDIATE").map_err(|err| {
            Error::new(ErrorKind::Transaction)
                .with_message(format!("{op}: begin transaction"))
                .with_source(err)
        })?;
        Ok(Self {
            conn,
            finished: false,
        })
    }

    fn commit(mut self, op: &str) -> Result<(), Error> {
        self.finished = true;
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            let failure = Error::new(ErrorKind::Transaction)
                .with_message(format!("{op}: commit transaction"))
                .with_source(err);
            return Err(rollback_into(self.conn, failure));
        }
        Ok(())
    }

    fn rollback(mut self, cause: Error) -> Error {
        self.finished = true;
        rollback_into(self.conn, cause)
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.conn.is_autocommit() {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn rollback_into(conn: &Connection, cause: Error) -> Error {
    // A failed COMMIT may already have ended the transaction.
    if conn.is_autocommit() {
        return cause;
    }
    match conn.execute_batch("ROLLBACK") {
        Ok(()) => cause,
        Err(rollback_err) => cause.with_rollback_failure(rollback_err),
    }
}

/// Runs `f` inside `BEGIN IMMEDIATE … COMMIT`. Errors from `f` roll the
/// transaction back and are returned as-is; a failing rollback is attached to
/// that error rather than replacing it.
pub(crate) fn with_transaction<T>(
    conn: &Connection,
    op: &str,
    f: impl FnOnce(&Connection) -> Result<T, Error>,
) -> Result<T, Error> {
    let guard = TxGuard::begin(conn, op)?;
    match f(conn) {
        Ok(value) => {
            guard.commit(op)?;
            Ok(value)
        }
        Err(err) => Err(guard.rollback(err)),
    }
}
