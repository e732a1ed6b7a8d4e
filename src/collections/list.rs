//! Purpose: Persistent positional sequence with zero-based contiguous positions.
//! Exports: `List`.
//! Role: Owns one `list_*` table; every removal renumbers survivors in the same transaction.
//! Invariants: Live rows occupy positions `0..n-1` after every committed write.
use std::marker::PhantomData;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::collections::{codec_context, count_live, delete_all, query_error};
use crate::core::clock::{expires_at, live_predicate, now_millis};
use crate::core::codec::{decode, encode};
use crate::core::error::{Error, ErrorKind};
use crate::core::iter::{Entries, IterErrorSlot, Order, PageQuery, RawRow};
use crate::core::store::Store;
use crate::core::table::{TableKind, compact_positions, normalized_table_name};

pub struct List<T> {
    store: Store,
    table: String,
    errors: IterErrorSlot,
    _types: PhantomData<fn() -> T>,
}

impl<T> List<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, name: &str) -> Result<Self, Error> {
        let table = normalized_table_name(TableKind::List, name);
        store.ensure_table(TableKind::List, &table)?;
        Ok(Self {
            store: store.clone(),
            table,
            errors: IterErrorSlot::default(),
            _types: PhantomData,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Appends at the end and returns the new position.
    pub fn append(&self, value: &T) -> Result<usize, Error> {
        self.append_with("list.append", value, Duration::ZERO)
    }

    pub fn append_ex(&self, value: &T, ttl: Duration) -> Result<usize, Error> {
        self.append_with("list.append_ex", value, ttl)
    }

    fn append_with(&self, op: &str, value: &T, ttl: Duration) -> Result<usize, Error> {
        let enc = encode(value).map_err(|err| codec_context(op, "encode value", err))?;
        self.store.transaction(op, |tx| {
            let now = now_millis();
            if self.has_expired_rows(tx, op, now)? {
                compact_positions(tx, &self.table, now)?;
            }
            let position: i64 = tx
                .query_row(
                    &format!("SELECT COALESCE(MAX(position) + 1, 0) FROM {}", self.table),
                    [],
                    |row| row.get(0),
                )
                .map_err(|err| query_error(op, "next position", &self.table, err))?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (position, value, expires_at, created_at)
                        VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ),
                rusqlite::params![position, enc, expires_at(ttl), now],
            )
            .map_err(|err| query_error(op, "insert value", &self.table, err))?;
            Ok(usize::try_from(position).unwrap_or_default())
        })
    }

    pub fn get(&self, position: usize) -> Result<Option<T>, Error> {
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT value FROM {table} WHERE position = ?1 AND {live}",
            table = self.table,
            live = live_predicate(2),
        );
        let raw: Option<Vec<u8>> = conn
            .query_row(&sql, rusqlite::params![to_sql_position(position), now_millis()], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|err| query_error("list.get", "get value", &self.table, err))?;
        raw.map(|raw| decode(&raw).map_err(|err| codec_context("list.get", "decode value", err)))
            .transpose()
    }

    /// Replaces the value at a live position; the position must exist.
    pub fn set(&self, position: usize, value: &T) -> Result<(), Error> {
        self.update("list.set", position, value, Duration::ZERO)
    }

    pub fn set_ex(&self, position: usize, value: &T, ttl: Duration) -> Result<(), Error> {
        self.update("list.set_ex", position, value, ttl)
    }

    fn update(&self, op: &str, position: usize, value: &T, ttl: Duration) -> Result<(), Error> {
        let enc = encode(value).map_err(|err| codec_context(op, "encode value", err))?;
        let conn = self.store.conn()?;
        let sql = format!(
            "UPDATE {table} SET value = ?1, expires_at = ?2
                WHERE position = ?3 AND {live}",
            table = self.table,
            live = live_predicate(4),
        );
        let updated = conn
            .execute(
                &sql,
                rusqlite::params![enc, expires_at(ttl), to_sql_position(position), now_millis()],
            )
            .map_err(|err| query_error(op, "update value", &self.table, err))?;
        if updated == 0 {
            return Err(self.position_not_found(op, position));
        }
        Ok(())
    }

    /// Removes one position and shifts every later live row down by one.
    pub fn delete(&self, position: usize) -> Result<(), Error> {
        let op = "list.delete";
        self.store.transaction(op, |tx| {
            let now = now_millis();
            let deleted = tx
                .execute(
                    &format!(
                        "DELETE FROM {table} WHERE position = ?1 AND {live}",
                        table = self.table,
                        live = live_predicate(2),
                    ),
                    rusqlite::params![to_sql_position(position), now],
                )
                .map_err(|err| query_error(op, "delete value", &self.table, err))?;
            if deleted == 0 {
                return Err(self.position_not_found(op, position));
            }
            compact_positions(tx, &self.table, now)?;
            Ok(())
        })
    }

    /// Live values in position order.
    pub fn entries(&self) -> Entries<T> {
        Entries::new(
            &self.store,
            PageQuery {
                table: self.table.clone(),
                order: Order::Position,
                with_key: false,
                op: "list.entries",
            },
            decode_value::<T>,
            &self.errors,
        )
    }

    pub fn values(&self) -> Entries<T> {
        self.entries()
    }

    pub fn iter_error(&self) -> Option<Error> {
        self.errors.take()
    }

    pub fn size(&self) -> Result<usize, Error> {
        let conn = self.store.conn()?;
        count_live(&conn, &self.table, now_millis())
            .map_err(|err| query_error("list.size", "count", &self.table, err))
    }

    pub fn clear(&self) -> Result<(), Error> {
        let conn = self.store.conn()?;
        delete_all(&conn, &self.table)
            .map_err(|err| query_error("list.clear", "clear values", &self.table, err))?;
        Ok(())
    }

    fn has_expired_rows(&self, conn: &Connection, op: &str, now: i64) -> Result<bool, Error> {
        conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE expires_at != 0 AND expires_at <= ?1)",
                self.table
            ),
            [now],
            |row| row.get(0),
        )
        .map_err(|err| query_error(op, "check for expired rows", &self.table, err))
    }

    fn position_not_found(&self, op: &str, position: usize) -> Error {
        Error::new(ErrorKind::PositionNotFound)
            .with_message(format!("{op}: no value at position"))
            .with_table(self.table.clone())
            .with_position(position)
    }
}

fn to_sql_position(position: usize) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}

fn decode_value<T: DeserializeOwned>(raw: RawRow) -> Result<T, Error> {
    decode(&raw.value).map_err(|err| err.with_message("decode value"))
}
