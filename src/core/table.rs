//! Purpose: Physical layout of every collection table.
//! Exports: `TableKind`, `normalized_table_name`, `create_table`, `compact_positions`.
//! Role: Single owner of DDL and of the list renumbering rewrite used by lists and the sweep.
//! Invariants: Table names are a pure function of kind and user name; re-opening addresses the same table.
//! Invariants: Names only contain `[a-z0-9_]`, so interpolating them into SQL is safe.
use rusqlite::Connection;

use crate::core::clock::live_predicate;
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TableKind {
    Map,
    Set,
    List,
    Queue,
    Stack,
    PriorityQueue,
    Cache,
}

impl TableKind {
    pub fn prefix(self) -> &'static str {
        match self {
            TableKind::Map => "map",
            TableKind::Set => "set",
            TableKind::List => "list",
            TableKind::Queue => "queue",
            TableKind::Stack => "stack",
            TableKind::PriorityQueue => "pqueue",
            TableKind::Cache => "cache",
        }
    }

    pub fn from_table_name(name: &str) -> Option<Self> {
        let prefix = name.split('_').next()?;
        [
            TableKind::Map,
            TableKind::Set,
            TableKind::List,
            TableKind::Queue,
            TableKind::Stack,
            TableKind::PriorityQueue,
            TableKind::Cache,
        ]
        .into_iter()
        .find(|kind| kind.prefix() == prefix)
    }
}

/// Lower-cases every part, replaces anything outside `[a-z0-9]` with `_`,
/// and joins the kind prefix and parts with `_`.
pub fn normalized_table_name(kind: TableKind, name: &str) -> String {
    join_normalized(&[kind.prefix(), name])
}

pub(crate) fn join_normalized(parts: &[&str]) -> String {
    let mut out = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            out.push('_');
        }
        for ch in part.chars().flat_map(char::to_lowercase) {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
                out.push(ch);
            } else {
                out.push('_');
            }
        }
    }
    out
}

pub(crate) fn create_table(conn: &Connection, kind: TableKind, table: &str) -> Result<(), Error> {
    let (ddl, index) = match kind {
        TableKind::Map | TableKind::Cache => (
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    key_hash TEXT PRIMARY KEY,
                    key BLOB NOT NULL,
                    value BLOB NOT NULL,
                    expires_at INTEGER DEFAULT 0,
                    updated_at INTEGER NOT NULL
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS {table}_expires_idx ON {table}(expires_at)"),
        ),
        TableKind::Set => (
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    key_hash TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    expires_at INTEGER DEFAULT 0,
                    updated_at INTEGER NOT NULL
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS {table}_expires_idx ON {table}(expires_at)"),
        ),
        TableKind::List => (
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    position INTEGER PRIMARY KEY,
                    value BLOB NOT NULL,
                    expires_at INTEGER DEFAULT 0,
                    created_at INTEGER NOT NULL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_expires_pos_idx ON {table}(expires_at, position)"
            ),
        ),
        TableKind::Queue | TableKind::Stack => (
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    value BLOB NOT NULL,
                    expires_at INTEGER DEFAULT 0,
                    created_at INTEGER NOT NULL
                )"
            ),
            format!("CREATE INDEX IF NOT EXISTS {table}_expires_id_idx ON {table}(expires_at, id)"),
        ),
        TableKind::PriorityQueue => (
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    value BLOB NOT NULL,
                    priority INTEGER NOT NULL,
                    expires_at INTEGER DEFAULT 0,
                    created_at INTEGER NOT NULL
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_expires_priority_id_idx
                    ON {table}(expires_at, priority DESC, id ASC)"
            ),
        ),
    };

    conn.execute(&ddl, []).map_err(|err| {
        Error::new(ErrorKind::Schema)
            .with_message(format!("create {} table", kind.prefix()))
            .with_table(table)
            .with_source(err)
    })?;
    conn.execute(&index, []).map_err(|err| {
        Error::new(ErrorKind::Schema)
            .with_message(format!("create {} index", kind.prefix()))
            .with_table(table)
            .with_source(err)
    })?;
    Ok(())
}

/// Rewrites a list table so live rows occupy positions `0..n-1` in their
/// original order and expired rows are dropped. Must run inside a transaction.
pub(crate) fn compact_positions(conn: &Connection, table: &str, now: i64) -> Result<usize, Error> {
    let scratch = join_normalized(&["scratch", table]);
    let query_err = |message: &str, err: rusqlite::Error| {
        Error::new(ErrorKind::Query)
            .with_message(format!("compact positions: {message}"))
            .with_table(table)
            .with_source(err)
    };

    conn.execute(&format!("DROP TABLE IF EXISTS temp.{scratch}"), [])
        .map_err(|err| query_err("drop stale scratch table", err))?;
    conn.execute(
        &format!(
            "CREATE TEMPORARY TABLE {scratch} AS
                SELECT ROW_NUMBER() OVER (ORDER BY position) - 1 AS new_position,
                       value, expires_at, created_at
                FROM {table}
                WHERE {live}",
            live = live_predicate(1),
        ),
        [now],
    )
    .map_err(|err| query_err("create scratch table", err))?;
    conn.execute(&format!("DELETE FROM {table}"), [])
        .map_err(|err| query_err("clear list table", err))?;
    let kept = conn
        .execute(
            &format!(
                "INSERT INTO {table} (position, value, expires_at, created_at)
                    SELECT new_position, value, expires_at, created_at
                    FROM temp.{scratch}
                    ORDER BY new_position"
            ),
            [],
        )
        .map_err(|err| query_err("reinsert renumbered rows", err))?;
    conn.execute(&format!("DROP TABLE temp.{scratch}"), [])
        .map_err(|err| query_err("drop scratch table", err))?;
    Ok(kept)
}
