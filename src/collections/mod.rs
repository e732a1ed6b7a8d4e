// Typed collections, each owning one table in the shared store.
pub mod cache;
pub mod list;
pub mod map;
pub mod priority_queue;
pub mod queue;
pub mod set;
pub mod stack;

mod ordered;

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};

use crate::core::error::{Error, ErrorKind};

/// Default SQLite bound on host parameters per statement.
pub(crate) const MAX_PARAMS: usize = 999;

/// Executes `INSERT INTO … VALUES (…),(…) <tail>` for one chunk of rows.
pub(crate) fn insert_rows(
    conn: &Connection,
    head: &str,
    tail: &str,
    rows: &[Vec<Value>],
) -> rusqlite::Result<usize> {
    let Some(first) = rows.first() else {
        return Ok(0);
    };
    let tuple = format!("({})", vec!["?"; first.len()].join(", "));
    let values = vec![tuple.as_str(); rows.len()].join(", ");
    let sql = format!("{head} VALUES {values} {tail}");
    conn.execute(&sql, params_from_iter(rows.iter().flatten()))
}

/// `SELECT COUNT(*)` over live rows.
pub(crate) fn count_live(conn: &Connection, table: &str, now: i64) -> rusqlite::Result<usize> {
    let sql = format!(
        "SELECT COUNT(*) FROM {table} WHERE {live}",
        live = crate::core::clock::live_predicate(1)
    );
    let count: i64 = conn.query_row(&sql, [now], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or_default())
}

pub(crate) fn delete_all(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
    conn.execute(&format!("DELETE FROM {table}"), [])
}

pub(crate) fn query_error(op: &str, what: &str, table: &str, err: rusqlite::Error) -> Error {
    Error::new(ErrorKind::Query)
        .with_message(format!("{op}: {what}"))
        .with_table(table)
        .with_source(err)
}

/// Prefixes a codec error with the operation that hit it.
pub(crate) fn codec_context(op: &str, what: &str, err: Error) -> Error {
    err.with_message(format!("{op}: {what}"))
}

#[cfg(test)]
mod tests {
    use super::{count_live, insert_rows};
    use rusqlite::Connection;
    use rusqlite::types::Value;

    #[test]
    fn insert_rows_binds_every_tuple() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute("CREATE TABLE t (a INTEGER, expires_at INTEGER)", [])
            .expect("create");
        let rows = vec![
            vec![Value::Integer(1), Value::Integer(0)],
            vec![Value::Integer(2), Value::Integer(5)],
            vec![Value::Integer(3), Value::Integer(50)],
        ];
        let inserted = insert_rows(&conn, "INSERT INTO t (a, expires_at)", "", &rows).expect("insert");
        assert_eq!(inserted, 3);
        assert_eq!(count_live(&conn, "t", 10).expect("count"), 2);
    }

    #[test]
    fn empty_chunk_is_a_no_op() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(insert_rows(&conn, "INSERT INTO missing (a)", "", &[]).expect("noop"), 0);
    }
}
