//! Purpose: Persistent key/value map keyed by the content hash of the encoded key.
//! Exports: `Map`.
//! Role: Base for `Cache`; owns one `map_*` (or `cache_*`) table.
//! Invariants: Reads never see expired rows; absent and expired keys both read as `None`.
//! Invariants: Batch writes commit all chunks together or nothing.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::time::Duration;

use rusqlite::OptionalExtension;
use rusqlite::types::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::collections::{
    MAX_PARAMS, codec_context, count_live, delete_all, insert_rows, query_error,
};
use crate::core::clock::{expires_at, live_predicate, now_millis};
use crate::core::codec::{decode, encode};
use crate::core::error::{Error, ErrorKind};
use crate::core::hash::key_hash;
use crate::core::iter::{Entries, IterErrorSlot, Order, PageQuery, RawRow};
use crate::core::store::Store;
use crate::core::table::{TableKind, normalized_table_name};

/// Rows per upsert statement: five parameters per row under the 999 limit.
pub(crate) const SET_CHUNK_ROWS: usize = 199;

const UPSERT_HEAD: &str = "INSERT INTO {table} (key_hash, key, value, expires_at, updated_at)";
const UPSERT_TAIL: &str = "ON CONFLICT(key_hash) DO UPDATE SET
        value = excluded.value,
        expires_at = excluded.expires_at,
        updated_at = excluded.updated_at";

/// A persistent map. Keys and values may be any serde type; the borrowed
/// forms accepted by lookups must serialize exactly like the owned key.
pub struct Map<K, V> {
    store: Store,
    table: String,
    errors: IterErrorSlot,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Map<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, name: &str) -> Result<Self, Error> {
        Self::open_kind(store, TableKind::Map, name)
    }

    pub(crate) fn open_kind(store: &Store, kind: TableKind, name: &str) -> Result<Self, Error> {
        let table = normalized_table_name(kind, name);
        store.ensure_table(kind, &table)?;
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

    pub fn set<Q, W>(&self, key: &Q, value: &W) -> Result<(), Error>
    where
        K: Borrow<Q>,
        V: Borrow<W>,
        Q: Serialize + ?Sized,
        W: Serialize + ?Sized,
    {
        self.upsert("map.set", key, value, Duration::ZERO)
    }

    /// Like `set`, expiring `ttl` from now. A zero ttl never expires.
    pub fn set_ex<Q, W>(&self, key: &Q, value: &W, ttl: Duration) -> Result<(), Error>
    where
        K: Borrow<Q>,
        V: Borrow<W>,
        Q: Serialize + ?Sized,
        W: Serialize + ?Sized,
    {
        self.upsert("map.set_ex", key, value, ttl)
    }

    pub(crate) fn upsert<Q, W>(&self, op: &str, key: &Q, value: &W, ttl: Duration) -> Result<(), Error>
    where
        Q: Serialize + ?Sized,
        W: Serialize + ?Sized,
    {
        let enc_key = encode(key).map_err(|err| codec_context(op, "encode key", err))?;
        let enc_value = encode(value).map_err(|err| codec_context(op, "encode value", err))?;
        let row = vec![
            Value::Text(key_hash(&enc_key)),
            Value::Blob(enc_key),
            Value::Blob(enc_value),
            Value::Integer(expires_at(ttl)),
            Value::Integer(now_millis()),
        ];
        let conn = self.store.conn()?;
        insert_rows(&conn, &self.upsert_head(), UPSERT_TAIL, &[row])
            .map_err(|err| query_error(op, "upsert", &self.table, err))?;
        Ok(())
    }

    pub fn mset(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<(), Error> {
        self.upsert_many("map.mset", pairs, Duration::ZERO)
    }

    pub fn mset_ex(&self, pairs: impl IntoIterator<Item = (K, V)>, ttl: Duration) -> Result<(), Error> {
        self.upsert_many("map.mset_ex", pairs, ttl)
    }

    pub(crate) fn upsert_many(
        &self,
        op: &str,
        pairs: impl IntoIterator<Item = (K, V)>,
        ttl: Duration,
    ) -> Result<(), Error> {
        let mut pairs = pairs.into_iter().peekable();
        if pairs.peek().is_none() {
            return Ok(());
        }

        let head = self.upsert_head();
        self.store.transaction(op, |tx| {
            let expires = expires_at(ttl);
            let now = now_millis();
            let mut chunk = Vec::with_capacity(SET_CHUNK_ROWS);
            for (key, value) in pairs {
                let enc_key = encode(&key).map_err(|err| codec_context(op, "encode key", err))?;
                let enc_value =
                    encode(&value).map_err(|err| codec_context(op, "encode value", err))?;
                chunk.push(vec![
                    Value::Text(key_hash(&enc_key)),
                    Value::Blob(enc_key),
                    Value::Blob(enc_value),
                    Value::Integer(expires),
                    Value::Integer(now),
                ]);
                if chunk.len() == SET_CHUNK_ROWS {
                    insert_rows(tx, &head, UPSERT_TAIL, &chunk)
                        .map_err(|err| query_error(op, "batch upsert", &self.table, err))?;
                    chunk.clear();
                }
            }
            insert_rows(tx, &head, UPSERT_TAIL, &chunk)
                .map_err(|err| query_error(op, "batch upsert", &self.table, err))?;
            Ok(())
        })
    }

    pub fn get<Q>(&self, key: &Q) -> Result<Option<V>, Error>
    where
        K: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        let hash = self.hash_of("map.get", key)?;
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT value FROM {table} WHERE key_hash = ?1 AND {live} LIMIT 1",
            table = self.table,
            live = live_predicate(2),
        );
        let found: Option<Vec<u8>> = conn
            .query_row(&sql, rusqlite::params![hash, now_millis()], |row| row.get(0))
            .optional()
            .map_err(|err| query_error("map.get", "get value", &self.table, err))?;
        match found {
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(|err| codec_context("map.get", "decode value", err)),
            None => Ok(None),
        }
    }

    /// Values for the requested keys; absent or expired keys are left out.
    pub fn mget<'a, I>(&self, keys: I) -> Result<HashMap<K, V>, Error>
    where
        K: Eq + Hash + 'a,
        I: IntoIterator<Item = &'a K>,
    {
        let mut hashes = Vec::new();
        for key in keys {
            hashes.push(self.hash_of("map.mget", key)?);
        }

        let conn = self.store.conn()?;
        let now = now_millis();
        let mut out = HashMap::with_capacity(hashes.len());
        for chunk in hashes.chunks(MAX_PARAMS - 1) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT key, value FROM {table}
                    WHERE key_hash IN ({placeholders})
                    AND (expires_at = 0 OR expires_at > ?)",
                table = self.table,
            );
            let mut args: Vec<Value> = chunk.iter().cloned().map(Value::Text).collect();
            args.push(Value::Integer(now));

            let mut stmt = conn
                .prepare(&sql)
                .map_err(|err| query_error("map.mget", "prepare", &self.table, err))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(|err| query_error("map.mget", "query key/values", &self.table, err))?;
            for row in rows {
                let (enc_key, enc_value) =
                    row.map_err(|err| query_error("map.mget", "read key/value", &self.table, err))?;
                let key = decode(&enc_key).map_err(|err| codec_context("map.mget", "decode key", err))?;
                let value =
                    decode(&enc_value).map_err(|err| codec_context("map.mget", "decode value", err))?;
                out.insert(key, value);
            }
        }
        Ok(out)
    }

    pub fn has<Q>(&self, key: &Q) -> Result<bool, Error>
    where
        K: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        let hash = self.hash_of("map.has", key)?;
        let conn = self.store.conn()?;
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {table} WHERE key_hash = ?1 AND {live})",
            table = self.table,
            live = live_predicate(2),
        );
        conn.query_row(&sql, rusqlite::params![hash, now_millis()], |row| row.get(0))
            .map_err(|err| query_error("map.has", "has key", &self.table, err))
    }

    /// Removes the key; removing an absent key is not an error.
    pub fn delete<Q>(&self, key: &Q) -> Result<(), Error>
    where
        K: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        let hash = self.hash_of("map.delete", key)?;
        let conn = self.store.conn()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE key_hash = ?1", self.table),
            [hash],
        )
        .map_err(|err| query_error("map.delete", "delete key", &self.table, err))?;
        Ok(())
    }

    /// Live entries, most recently written first. Failures end the iteration
    /// early and are reported by `iter_error`.
    pub fn entries(&self) -> Entries<(K, V)> {
        Entries::new(
            &self.store,
            PageQuery {
                table: self.table.clone(),
                order: Order::RecentFirst,
                with_key: true,
                op: "map.entries",
            },
            decode_entry::<K, V>,
            &self.errors,
        )
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + use<K, V> {
        self.entries().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = V> + use<K, V> {
        self.entries().map(|(_, value)| value)
    }

    /// Error that ended the most recent `entries`/`keys`/`values` iteration.
    /// Starting a new iteration clears it; reading it takes it.
    pub fn iter_error(&self) -> Option<Error> {
        self.errors.take()
    }

    pub fn size(&self) -> Result<usize, Error> {
        let conn = self.store.conn()?;
        count_live(&conn, &self.table, now_millis())
            .map_err(|err| query_error("map.size", "count", &self.table, err))
    }

    pub fn clear(&self) -> Result<(), Error> {
        let conn = self.store.conn()?;
        delete_all(&conn, &self.table)
            .map_err(|err| query_error("map.clear", "clear key/values", &self.table, err))?;
        Ok(())
    }

    fn upsert_head(&self) -> String {
        UPSERT_HEAD.replace("{table}", &self.table)
    }

    fn hash_of<Q: Serialize + ?Sized>(&self, op: &str, key: &Q) -> Result<String, Error> {
        let enc_key = encode(key).map_err(|err| codec_context(op, "encode key", err))?;
        Ok(key_hash(&enc_key))
    }
}

fn decode_entry<K: DeserializeOwned, V: DeserializeOwned>(raw: RawRow) -> Result<(K, V), Error> {
    let enc_key = raw.key.ok_or_else(|| {
        Error::new(ErrorKind::Internal).with_message("entry row is missing its key")
    })?;
    let key = decode(&enc_key).map_err(|err| err.with_message("decode key"))?;
    let value = decode(&raw.value).map_err(|err| err.with_message("decode value"))?;
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::{Map, SET_CHUNK_ROWS};
    use crate::core::error::ErrorKind;
    use crate::core::options::StoreOptions;
    use crate::core::store::Store;
    use std::collections::HashMap;
    use std::time::Duration;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        let options = StoreOptions::new()
            .with_sweep_interval(Duration::from_secs(3600))
            .with_iter_page_size(3);
        Store::open_with(dir.path().join("map.sqlite"), options).expect("open")
    }

    #[test]
    fn get_of_unwritten_key_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<String, String> = Map::new(&store, "prefs").expect("map");
        assert_eq!(map.get("missing").expect("get"), None);
        assert!(!map.has("missing").expect("has"));
    }

    #[test]
    fn set_overwrites_value_and_recency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<String, u32> = Map::new(&store, "counts").expect("map");
        map.set("a", &1).expect("a");
        map.set("b", &2).expect("b");
        map.set("a", &3).expect("a again");

        assert_eq!(map.get("a").expect("get"), Some(3));
        assert_eq!(map.size().expect("size"), 2);
        let keys: Vec<String> = map.keys().collect();
        assert!(map.iter_error().is_none());
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&"a".to_string()) && keys.contains(&"b".to_string()));
    }

    #[test]
    fn set_ex_expires_lazily_without_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<String, String> = Map::new(&store, "sessions").expect("map");
        map.set_ex("token", "abc", Duration::from_millis(40)).expect("set_ex");
        assert_eq!(map.get("token").expect("get"), Some("abc".to_string()));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(map.get("token").expect("get"), None);
        assert!(!map.has("token").expect("has"));
        assert_eq!(map.size().expect("size"), 0);
    }

    #[test]
    fn mset_spans_multiple_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<u32, String> = Map::new(&store, "bulk").expect("map");
        let total = SET_CHUNK_ROWS * 2 + 7;
        map.mset((0..total as u32).map(|i| (i, format!("v{i}"))))
            .expect("mset");
        assert_eq!(map.size().expect("size"), total);

        let wanted = [0u32, 250, 404, 9999];
        let got = map.mget(wanted.iter()).expect("mget");
        assert_eq!(got.len(), 3);
        assert_eq!(got.get(&250), Some(&"v250".to_string()));
        assert!(!got.contains_key(&9999));
    }

    #[test]
    fn mset_rolls_back_on_encode_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<String, HashMap<Vec<u8>, u8>> = Map::new(&store, "bad").expect("map");
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1u8);
        let pairs = vec![
            ("ok".to_string(), HashMap::new()),
            ("broken".to_string(), bad),
        ];
        let err = map.mset(pairs).expect_err("encode must fail");
        assert_eq!(err.kind(), ErrorKind::Codec);
        assert_eq!(err.message(), Some("map.mset: encode value"));
        assert_eq!(map.size().expect("size"), 0);
    }

    #[test]
    fn entries_page_through_all_rows_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<u32, u32> = Map::new(&store, "paged").expect("map");
        for i in 0..10u32 {
            map.set(&i, &(i * 10)).expect("set");
        }
        let entries: Vec<(u32, u32)> = map.entries().collect();
        assert!(map.iter_error().is_none());
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0], (9, 90));
        assert_eq!(entries[9], (0, 0));
    }

    #[test]
    fn decode_failure_is_deferred_to_iter_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let writer: Map<String, String> = Map::new(&store, "mixed").expect("writer");
        writer.set("a", "not a number").expect("set");
        let reader: Map<String, u64> = Map::new(&store, "mixed").expect("reader");

        let collected: Vec<(String, u64)> = reader.entries().collect();
        assert!(collected.is_empty());
        let err = reader.iter_error().expect("deferred error");
        assert_eq!(err.kind(), ErrorKind::Codec);
        assert_eq!(err.table(), Some("map_mixed"));

        // A new iteration starts from a clean slot.
        let _ = reader.values().count();
        assert!(reader.iter_error().is_some());
        writer.clear().expect("clear");
        let _ = reader.values().count();
        assert!(reader.iter_error().is_none());
    }

    #[test]
    fn delete_of_absent_key_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<String, String> = Map::new(&store, "d").expect("map");
        map.delete("nothing").expect("delete");
        map.set("k", "v").expect("set");
        map.delete("k").expect("delete");
        assert!(!map.has("k").expect("has"));
    }

    #[test]
    fn operations_after_close_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let map: Map<String, String> = Map::new(&store, "closing").expect("map");
        store.close().expect("close");
        let err = map.set("k", "v").expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::StoreClosed);
        assert_eq!(map.entries().count(), 0);
        assert_eq!(
            map.iter_error().expect("closed iteration").kind(),
            ErrorKind::StoreClosed
        );
    }
}
