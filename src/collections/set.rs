//! Purpose: Persistent set of serde values, addressed by the content hash of each value.
//! Exports: `Set`.
//! Role: Owns one `set_*` table; re-adding a member refreshes its expiry and recency.
//! Invariants: Membership checks ignore expired rows.
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::Duration;

use rusqlite::types::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::collections::{
    MAX_PARAMS, codec_context, count_live, delete_all, insert_rows, query_error,
};
use crate::core::clock::{expires_at, live_predicate, now_millis};
use crate::core::codec::{decode, encode};
use crate::core::error::Error;
use crate::core::hash::key_hash;
use crate::core::iter::{Entries, IterErrorSlot, Order, PageQuery, RawRow};
use crate::core::store::Store;
use crate::core::table::{TableKind, normalized_table_name};

/// Rows per upsert statement: four parameters per row under the 999 limit.
pub(crate) const ADD_CHUNK_ROWS: usize = 249;

const UPSERT_TAIL: &str = "ON CONFLICT(key_hash) DO UPDATE SET
        expires_at = excluded.expires_at,
        updated_at = excluded.updated_at";

pub struct Set<T> {
    store: Store,
    table: String,
    errors: IterErrorSlot,
    _types: PhantomData<fn() -> T>,
}

impl<T> Set<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, name: &str) -> Result<Self, Error> {
        let table = normalized_table_name(TableKind::Set, name);
        store.ensure_table(TableKind::Set, &table)?;
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

    pub fn add<Q>(&self, value: &Q) -> Result<(), Error>
    where
        T: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        self.upsert("set.add", value, Duration::ZERO)
    }

    pub fn add_ex<Q>(&self, value: &Q, ttl: Duration) -> Result<(), Error>
    where
        T: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        self.upsert("set.add_ex", value, ttl)
    }

    fn upsert<Q: Serialize + ?Sized>(&self, op: &str, value: &Q, ttl: Duration) -> Result<(), Error> {
        let row = member_row(op, value, expires_at(ttl), now_millis())?;
        let conn = self.store.conn()?;
        insert_rows(&conn, &self.upsert_head(), UPSERT_TAIL, &[row])
            .map_err(|err| query_error(op, "add value", &self.table, err))?;
        Ok(())
    }

    pub fn madd(&self, values: impl IntoIterator<Item = T>) -> Result<(), Error> {
        self.upsert_many("set.madd", values, Duration::ZERO)
    }

    pub fn madd_ex(&self, values: impl IntoIterator<Item = T>, ttl: Duration) -> Result<(), Error> {
        self.upsert_many("set.madd_ex", values, ttl)
    }

    fn upsert_many(
        &self,
        op: &str,
        values: impl IntoIterator<Item = T>,
        ttl: Duration,
    ) -> Result<(), Error> {
        let mut values = values.into_iter().peekable();
        if values.peek().is_none() {
            return Ok(());
        }

        let head = self.upsert_head();
        self.store.transaction(op, |tx| {
            let expires = expires_at(ttl);
            let now = now_millis();
            let mut chunk = Vec::with_capacity(ADD_CHUNK_ROWS);
            for value in values {
                chunk.push(member_row(op, &value, expires, now)?);
                if chunk.len() == ADD_CHUNK_ROWS {
                    insert_rows(tx, &head, UPSERT_TAIL, &chunk)
                        .map_err(|err| query_error(op, "batch insert", &self.table, err))?;
                    chunk.clear();
                }
            }
            insert_rows(tx, &head, UPSERT_TAIL, &chunk)
                .map_err(|err| query_error(op, "batch insert", &self.table, err))?;
            Ok(())
        })
    }

    pub fn has<Q>(&self, value: &Q) -> Result<bool, Error>
    where
        T: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        let enc = encode(value).map_err(|err| codec_context("set.has", "encode value", err))?;
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE key_hash = ?1 AND {live})",
            table = self.table,
            live = live_predicate(2),
        );
        conn.query_row(&sql, rusqlite::params![key_hash(&enc), now_millis()], |row| {
            row.get(0)
        })
        .map_err(|err| query_error("set.has", "has value", &self.table, err))
    }

    /// Membership for every requested value, `false` for absent or expired ones.
    pub fn mhas<'a, I>(&self, values: I) -> Result<HashMap<T, bool>, Error>
    where
        T: Eq + Hash + Clone + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let mut requested = Vec::new();
        for value in values {
            let enc = encode(value).map_err(|err| codec_context("set.mhas", "encode value", err))?;
            requested.push((key_hash(&enc), value.clone()));
        }

        let conn = self.store.conn()?;
        let now = now_millis();
        let mut present = HashSet::new();
        for chunk in requested.chunks(MAX_PARAMS - 1) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key_hash FROM {table}
                    WHERE key_hash IN ({placeholders})
                    AND (expires_at = 0 OR expires_at > ?)",
                table = self.table,
            );
            let mut args: Vec<Value> = chunk
                .iter()
                .map(|(hash, _)| Value::Text(hash.clone()))
                .collect();
            args.push(Value::Integer(now));

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|err| query_error("set.mhas", "prepare", &self.table, err))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|err| query_error("set.mhas", "query values", &self.table, err))?;
            for row in rows {
                present.insert(
                    row.map_err(|err| query_error("set.mhas", "read value", &self.table, err))?,
                );
            }
        }

        Ok(requested
            .into_iter()
            .map(|(hash, value)| (value, present.contains(&hash)))
            .collect())
    }

    pub fn delete<Q>(&self, value: &Q) -> Result<(), Error>
    where
        T: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        let enc = encode(value).map_err(|err| codec_context("set.delete", "encode value", err))?;
        let conn = self.store.conn()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE key_hash = ?1", self.table),
            [key_hash(&enc)],
        )
        .map_err(|err| query_error("set.delete", "delete value", &self.table, err))?;
        Ok(())
    }

    /// Live members, most recently added first.
    pub fn entries(&self) -> Entries<T> {
        Entries::new(
            &self.store,
            PageQuery {
                table: self.table.clone(),
                order: Order::RecentFirst,
                with_key: false,
                op: "set.entries",
            },
            decode_member::<T>,
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
            .map_err(|err| query_error("set.size", "count", &self.table, err))
    }

    pub fn clear(&self) -> Result<(), Error> {
        let conn = self.store.conn()?;
        delete_all(&conn, &self.table)
            .map_err(|err| query_error("set.clear", "clear values", &self.table, err))?;
        Ok(())
    }

    fn upsert_head(&self) -> String {
        format!(
            "INSERT INTO {} (key_hash, value, expires_at, updated_at)",
            self.table
        )
    }
}

fn member_row<Q: Serialize + ?Sized>(
    op: &str,
    value: &Q,
    expires: i64,
    now: i64,
) -> Result<Vec<Value>, Error> {
    let enc = encode(value).map_err(|err| codec_context(op, "encode value", err))?;
    Ok(vec![
        Value::Text(key_hash(&enc)),
        Value::Blob(enc),
        Value::Integer(expires),
        Value::Integer(now),
    ])
}

fn decode_member<T: DeserializeOwned>(raw: RawRow) -> Result<T, Error> {
    decode(&raw.value).map_err(|err| err.with_message("decode value"))
}

#[cfg(test)]
mod tests {
    use super::{ADD_CHUNK_ROWS, Set};
    use crate::core::options::StoreOptions;
    use crate::core::store::Store;
    use std::time::Duration;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        let options = StoreOptions::new().with_sweep_interval(Duration::from_secs(3600));
        Store::open_with(dir.path().join("set.sqlite"), options).expect("open")
    }

    #[test]
    fn add_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let tags: Set<String> = Set::new(&store, "tags").expect("set");
        tags.add("rust").expect("add");
        tags.add("rust").expect("add again");
        tags.add("sqlite").expect("add");
        assert_eq!(tags.size().expect("size"), 2);
        assert!(tags.has("rust").expect("has"));
        assert!(!tags.has("go").expect("has"));
    }

    #[test]
    fn re_adding_refreshes_expiry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let seen: Set<u64> = Set::new(&store, "seen").expect("set");
        seen.add_ex(&7, Duration::from_millis(30)).expect("add_ex");
        seen.add(&7).expect("persist");
        std::thread::sleep(Duration::from_millis(60));
        assert!(seen.has(&7).expect("has"));
    }

    #[test]
    fn madd_and_mhas_across_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let ids: Set<u32> = Set::new(&store, "ids").expect("set");
        let total = (ADD_CHUNK_ROWS * 3) as u32;
        ids.madd(0..total).expect("madd");
        assert_eq!(ids.size().expect("size"), total as usize);

        let wanted = [1u32, total - 1, total + 5];
        let found = ids.mhas(wanted.iter()).expect("mhas");
        assert_eq!(found.len(), 3);
        assert_eq!(found[&1], true);
        assert_eq!(found[&(total - 1)], true);
        assert_eq!(found[&(total + 5)], false);
    }

    #[test]
    fn entries_skip_expired_members() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let set: Set<String> = Set::new(&store, "mixed").expect("set");
        set.madd_ex(vec!["short".to_string()], Duration::from_millis(20))
            .expect("madd_ex");
        set.add("long").expect("add");
        std::thread::sleep(Duration::from_millis(50));
        let members: Vec<String> = set.entries().collect();
        assert!(set.iter_error().is_none());
        assert_eq!(members, vec!["long".to_string()]);
    }

    #[test]
    fn delete_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let set: Set<String> = Set::new(&store, "gone").expect("set");
        set.madd(["a".to_string(), "b".to_string()]).expect("madd");
        set.delete("a").expect("delete");
        set.delete("zzz").expect("absent delete");
        assert_eq!(set.values().collect::<Vec<_>>(), vec!["b".to_string()]);
        set.clear().expect("clear");
        assert_eq!(set.size().expect("size"), 0);
    }
}
