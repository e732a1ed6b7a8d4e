//! Purpose: Lazy, one-shot iteration over live rows with deferred error reporting.
//! Exports: `Entries`, `IterErrorSlot`, `PageQuery`, `Order`, `RawRow`.
//! Role: Keyset pagination so no connection is held between pages.
//! Invariants: Liveness is judged against the time the iteration started.
//! Invariants: The first failure ends the iteration and is parked in the owning collection's slot.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{Row, params_from_iter};
use rusqlite::types::Value;

use crate::core::clock::{live_predicate, now_millis};
use crate::core::error::{Error, ErrorKind};
use crate::core::store::Store;

/// Last error seen by an iteration; cleared when the next iteration starts.
#[derive(Clone, Default)]
pub(crate) struct IterErrorSlot(Arc<Mutex<Option<Error>>>);

impl IterErrorSlot {
    pub(crate) fn reset(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn record(&self, err: Error) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take(&self) -> Option<Error> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Iteration order expressed over at most two integer sort keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Order {
    /// `updated_at DESC, rowid DESC`: most recently written first.
    RecentFirst,
    /// `position ASC`.
    Position,
    /// `id ASC`.
    OldestId,
    /// `id DESC`.
    NewestId,
    /// `priority DESC, id ASC`.
    Priority,
}

impl Order {
    fn keys(self) -> (&'static str, &'static str) {
        match self {
            Order::RecentFirst => ("updated_at", "rowid"),
            Order::Position => ("position", "position"),
            Order::OldestId | Order::NewestId => ("id", "id"),
            Order::Priority => ("priority", "id"),
        }
    }

    fn has_tiebreak(self) -> bool {
        matches!(self, Order::RecentFirst | Order::Priority)
    }

    fn order_by(self) -> &'static str {
        match self {
            Order::RecentFirst => "updated_at DESC, rowid DESC",
            Order::Position => "position ASC",
            Order::OldestId => "id ASC",
            Order::NewestId => "id DESC",
            Order::Priority => "priority DESC, id ASC",
        }
    }

    /// Predicate selecting rows strictly after the cursor `(?a, ?b)`.
    fn after(self, a: usize, b: usize) -> String {
        match self {
            Order::RecentFirst => {
                format!("(updated_at < ?{a} OR (updated_at = ?{a} AND rowid < ?{b}))")
            }
            Order::Position => format!("(position > ?{a})"),
            Order::OldestId => format!("(id > ?{a})"),
            Order::NewestId => format!("(id < ?{a})"),
            Order::Priority => format!("(priority < ?{a} OR (priority = ?{a} AND id > ?{b}))"),
        }
    }
}

/// Encoded payload of one row: the value, plus the key for map tables.
pub(crate) struct RawRow {
    pub(crate) key: Option<Vec<u8>>,
    pub(crate) value: Vec<u8>,
}

#[derive(Clone, Debug)]
pub(crate) struct PageQuery {
    pub(crate) table: String,
    pub(crate) order: Order,
    pub(crate) with_key: bool,
    /// Error context prefix, e.g. `map.entries`.
    pub(crate) op: &'static str,
}

impl PageQuery {
    fn sql(&self, after_cursor: bool) -> String {
        let (a, b) = self.order.keys();
        let payload = if self.with_key { "key, value" } else { "value" };
        let mut filter = live_predicate(1);
        if after_cursor {
            filter.push_str(" AND ");
            filter.push_str(&self.order.after(3, 4));
        }
        format!(
            "SELECT {a}, {b}, {payload} FROM {table}
                WHERE {filter}
                ORDER BY {order}
                LIMIT ?2",
            table = self.table,
            order = self.order.order_by(),
        )
    }
}

type Decoder<T> = fn(RawRow) -> Result<T, Error>;

pub struct Entries<T> {
    store: Store,
    query: PageQuery,
    now: i64,
    page_size: usize,
    cursor: Option<(i64, i64)>,
    buffer: VecDeque<RawRow>,
    exhausted: bool,
    decode: Decoder<T>,
    errors: IterErrorSlot,
}

impl<T> Entries<T> {
    /// Resets `errors` and prepares a lazy iteration; nothing is queried until
    /// the first `next`.
    pub(crate) fn new(store: &Store, query: PageQuery, decode: Decoder<T>, errors: &IterErrorSlot) -> Self {
        errors.reset();
        Self {
            store: store.clone(),
            page_size: store.options().iter_page_size,
            query,
            now: now_millis(),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
            decode,
            errors: errors.clone(),
        }
    }

    fn fail(&mut self, err: Error) -> Option<T> {
        self.exhausted = true;
        self.buffer.clear();
        self.errors.record(err.with_table(self.query.table.clone()));
        None
    }

    fn fetch_page(&mut self) -> Result<(), Error> {
        let op = self.query.op;
        let query_err = |what: &str, err: rusqlite::Error| {
            Error::new(ErrorKind::Query)
                .with_message(format!("{op}: {what}"))
                .with_source(err)
        };

        let conn = self.store.conn()?;
        let sql = self.query.sql(self.cursor.is_some());
        let mut args = vec![
            Value::Integer(self.now),
            Value::Integer(i64::try_from(self.page_size).unwrap_or(i64::MAX)),
        ];
        if let Some((a, b)) = self.cursor {
            args.push(Value::Integer(a));
            if self.query.order.has_tiebreak() {
                args.push(Value::Integer(b));
            }
        }

        let mut stmt = conn.prepare(&sql).map_err(|err| query_err("prepare", err))?;
        let with_key = self.query.with_key;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| read_row(row, with_key))
            .map_err(|err| query_err("query rows", err))?;

        let mut fetched = 0usize;
        for row in rows {
            let (cursor, raw) = row.map_err(|err| query_err("read row", err))?;
            self.cursor = Some(cursor);
            self.buffer.push_back(raw);
            fetched += 1;
        }
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

fn read_row(row: &Row<'_>, with_key: bool) -> rusqlite::Result<((i64, i64), RawRow)> {
    let cursor = (row.get(0)?, row.get(1)?);
    let raw = if with_key {
        RawRow {
            key: Some(row.get(2)?),
            value: row.get(3)?,
        }
    } else {
        RawRow {
            key: None,
            value: row.get(2)?,
        }
    };
    Ok((cursor, raw))
}

impl<T> Iterator for Entries<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                return self.fail(err);
            }
        }
        let raw = self.buffer.pop_front()?;
        match (self.decode)(raw) {
            Ok(item) => Some(item),
            Err(err) => {
                let op = self.query.op;
                let message = format!("{op}: {}", err.message().unwrap_or("decode"));
                self.fail(err.with_message(message))
            }
        }
    }
}

impl<T> std::iter::FusedIterator for Entries<T> {}

#[cfg(test)]
mod tests {
    use super::{Order, PageQuery};

    #[test]
    fn first_page_sql_has_no_cursor() {
        let query = PageQuery {
            table: "queue_jobs".to_string(),
            order: Order::OldestId,
            with_key: false,
            op: "queue.entries",
        };
        let sql = query.sql(false);
        assert!(sql.contains("SELECT id, id, value FROM queue_jobs"));
        assert!(sql.contains("ORDER BY id ASC"));
        assert!(!sql.contains("?3"));
        assert!(!query.sql(true).contains("?4"));
    }

    #[test]
    fn recent_first_cursor_breaks_ties_on_rowid() {
        let query = PageQuery {
            table: "map_m".to_string(),
            order: Order::RecentFirst,
            with_key: true,
            op: "map.entries",
        };
        let sql = query.sql(true);
        assert!(sql.contains("SELECT updated_at, rowid, key, value FROM map_m"));
        assert!(sql.contains("(updated_at < ?3 OR (updated_at = ?3 AND rowid < ?4))"));
    }

    #[test]
    fn priority_cursor_is_fifo_within_band() {
        assert_eq!(
            Order::Priority.after(3, 4),
            "(priority < ?3 OR (priority = ?3 AND id > ?4))"
        );
    }
}
