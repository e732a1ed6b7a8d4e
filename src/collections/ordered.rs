//! Purpose: Shared storage for queue, stack and priority queue tables.
//! Exports: `OrderedTable`, `Discipline`.
//! Role: Byte-level insert/take/peek; the typed wrappers own encoding.
//! Invariants: A take selects and deletes the head row inside one immediate transaction.
use rusqlite::{Connection, OptionalExtension};

use crate::collections::{count_live, delete_all, query_error};
use crate::core::clock::{live_predicate, now_millis};
use crate::core::error::Error;
use crate::core::iter::{IterErrorSlot, Order, PageQuery};
use crate::core::store::Store;
use crate::core::table::{TableKind, normalized_table_name};

/// Consumption order of an ordered table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Discipline {
    Fifo,
    Lifo,
    Priority,
}

impl Discipline {
    fn kind(self) -> TableKind {
        match self {
            Discipline::Fifo => TableKind::Queue,
            Discipline::Lifo => TableKind::Stack,
            Discipline::Priority => TableKind::PriorityQueue,
        }
    }

    fn order(self) -> Order {
        match self {
            Discipline::Fifo => Order::OldestId,
            Discipline::Lifo => Order::NewestId,
            Discipline::Priority => Order::Priority,
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            Discipline::Fifo => "id ASC",
            Discipline::Lifo => "id DESC",
            Discipline::Priority => "priority DESC, id ASC",
        }
    }
}

pub(crate) struct OrderedTable {
    pub(crate) store: Store,
    pub(crate) table: String,
    pub(crate) errors: IterErrorSlot,
    discipline: Discipline,
}

impl OrderedTable {
    pub(crate) fn open(store: &Store, discipline: Discipline, name: &str) -> Result<Self, Error> {
        let kind = discipline.kind();
        let table = normalized_table_name(kind, name);
        store.ensure_table(kind, &table)?;
        Ok(Self {
            store: store.clone(),
            table,
            errors: IterErrorSlot::default(),
            discipline,
        })
    }

    /// `priority` is only stored for priority tables.
    pub(crate) fn insert(
        &self,
        op: &str,
        value: &[u8],
        priority: i64,
        expires_at: i64,
    ) -> Result<(), Error> {
        let conn = self.store.conn()?;
        let now = now_millis();
        let result = if self.discipline == Discipline::Priority {
            conn.execute(
                &format!(
                    "INSERT INTO {} (value, priority, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ),
                rusqlite::params![value, priority, expires_at, now],
            )
        } else {
            conn.execute(
                &format!(
                    "INSERT INTO {} (value, expires_at, created_at) VALUES (?1, ?2, ?3)",
                    self.table
                ),
                rusqlite::params![value, expires_at, now],
            )
        };
        result.map_err(|err| query_error(op, "insert value", &self.table, err))?;
        Ok(())
    }

    /// Removes and returns the head value, or `None` when no live row remains.
    pub(crate) fn take(&self, op: &str) -> Result<Option<Vec<u8>>, Error> {
        self.store.transaction(op, |tx| {
            let Some((id, value)) = self.head(tx, op)? else {
                return Ok(None);
            };
            tx.execute(&format!("DELETE FROM {} WHERE id = ?1", self.table), [id])
                .map_err(|err| query_error(op, "delete head", &self.table, err))?;
            Ok(Some(value))
        })
    }

    pub(crate) fn peek(&self, op: &str) -> Result<Option<Vec<u8>>, Error> {
        let conn = self.store.conn()?;
        Ok(self.head(&conn, op)?.map(|(_, value)| value))
    }

    fn head(&self, conn: &Connection, op: &str) -> Result<Option<(i64, Vec<u8>)>, Error> {
        let sql = format!(
            "SELECT id, value FROM {table}
                WHERE {live}
                ORDER BY {order}
                LIMIT 1",
            table = self.table,
            live = live_predicate(1),
            order = self.discipline.order_by(),
        );
        conn.query_row(&sql, [now_millis()], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .map_err(|err| query_error(op, "select head", &self.table, err))
    }

    pub(crate) fn page_query(&self, op: &'static str) -> PageQuery {
        PageQuery {
            table: self.table.clone(),
            order: self.discipline.order(),
            with_key: false,
            op,
        }
    }

    pub(crate) fn size(&self, op: &str) -> Result<usize, Error> {
        let conn = self.store.conn()?;
        count_live(&conn, &self.table, now_millis())
            .map_err(|err| query_error(op, "count", &self.table, err))
    }

    pub(crate) fn clear(&self, op: &str) -> Result<(), Error> {
        let conn = self.store.conn()?;
        delete_all(&conn, &self.table)
            .map_err(|err| query_error(op, "clear values", &self.table, err))?;
        Ok(())
    }
}
