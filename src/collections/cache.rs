//! Purpose: Persistent key-value cache whose writes expire after a fixed TTL.
//! Exports: `Cache`.
//! Role: A `Map` over a `cache_*` table with the TTL applied to every write.
//! Invariants: A zero TTL behaves exactly like `Map`.
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::collections::map::Map;
use crate::core::error::Error;
use crate::core::iter::Entries;
use crate::core::store::Store;
use crate::core::table::TableKind;

pub struct Cache<K, V> {
    map: Map<K, V>,
    ttl: Duration,
}

impl<K, V> Cache<K, V>
where
    K: Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, name: &str, ttl: Duration) -> Result<Self, Error> {
        Ok(Self {
            map: Map::open_kind(store, TableKind::Cache, name)?,
            ttl,
        })
    }

    pub fn table_name(&self) -> &str {
        self.map.table_name()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set<Q, W>(&self, key: &Q, value: &W) -> Result<(), Error>
    where
        K: Borrow<Q>,
        V: Borrow<W>,
        Q: Serialize + ?Sized,
        W: Serialize + ?Sized,
    {
        self.map.upsert("cache.set", key, value, self.ttl)
    }

    pub fn mset(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Result<(), Error> {
        self.map.upsert_many("cache.mset", pairs, self.ttl)
    }

    pub fn get<Q>(&self, key: &Q) -> Result<Option<V>, Error>
    where
        K: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        self.map.get(key)
    }

    /// Like `get`, but a hit is written back with a fresh TTL. This costs one
    /// extra write per hit; with a zero TTL nothing is written.
    pub fn get_ex<Q>(&self, key: &Q) -> Result<Option<V>, Error>
    where
        K: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        let value = self.map.get(key)?;
        if let Some(value) = &value {
            if !self.ttl.is_zero() {
                self.map.upsert("cache.get_ex", key, value, self.ttl)?;
            }
        }
        Ok(value)
    }

    pub fn mget<'a, I>(&self, keys: I) -> Result<HashMap<K, V>, Error>
    where
        K: Eq + Hash + 'a,
        I: IntoIterator<Item = &'a K>,
    {
        self.map.mget(keys)
    }

    /// Like `mget`, refreshing the TTL of every hit in one transaction.
    pub fn mget_ex<'a, I>(&self, keys: I) -> Result<HashMap<K, V>, Error>
    where
        K: Eq + Hash + Clone + 'a,
        V: Clone,
        I: IntoIterator<Item = &'a K>,
    {
        let found = self.map.mget(keys)?;
        if !self.ttl.is_zero() {
            let refreshed = found
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()));
            self.map.upsert_many("cache.mget_ex", refreshed, self.ttl)?;
        }
        Ok(found)
    }

    pub fn has<Q>(&self, key: &Q) -> Result<bool, Error>
    where
        K: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        self.map.has(key)
    }

    pub fn delete<Q>(&self, key: &Q) -> Result<(), Error>
    where
        K: Borrow<Q>,
        Q: Serialize + ?Sized,
    {
        self.map.delete(key)
    }

    pub fn entries(&self) -> Entries<(K, V)> {
        self.map.entries()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + use<K, V> {
        self.map.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = V> + use<K, V> {
        self.map.values()
    }

    pub fn iter_error(&self) -> Option<Error> {
        self.map.iter_error()
    }

    pub fn size(&self) -> Result<usize, Error> {
        self.map.size()
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.map.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::Cache;
    use crate::core::options::StoreOptions;
    use crate::core::store::Store;
    use std::time::Duration;

    fn open_store(dir: &tempfile::TempDir) -> Store {
        let options = StoreOptions::new().with_sweep_interval(Duration::from_secs(3600));
        Store::open_with(dir.path().join("cache.sqlite"), options).expect("open")
    }

    #[test]
    fn table_is_prefixed_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let cache: Cache<String, String> =
            Cache::new(&store, "Sessions", Duration::from_secs(60)).expect("cache");
        assert_eq!(cache.table_name(), "cache_sessions");
    }

    #[test]
    fn writes_expire_after_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let cache: Cache<String, u32> =
            Cache::new(&store, "short", Duration::from_millis(40)).expect("cache");
        cache.set("a", &1).expect("set");
        cache
            .mset(vec![("b".to_string(), 2), ("c".to_string(), 3)])
            .expect("mset");
        assert_eq!(cache.size().expect("size"), 3);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get("a").expect("get"), None);
        assert_eq!(cache.size().expect("size"), 0);
    }

    #[test]
    fn get_ex_extends_lifetime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let cache: Cache<String, u32> =
            Cache::new(&store, "sliding", Duration::from_millis(150)).expect("cache");
        cache.set("hot", &1).expect("set");
        cache.set("cold", &2).expect("set");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(cache.get_ex("hot").expect("get_ex"), Some(1));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(cache.get("hot").expect("get"), Some(1));
        assert_eq!(cache.get("cold").expect("get"), None);
    }

    #[test]
    fn mget_ex_refreshes_only_hits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let cache: Cache<String, u32> =
            Cache::new(&store, "multi", Duration::from_millis(150)).expect("cache");
        cache.set("a", &1).expect("set");
        cache.set("b", &2).expect("set");
        std::thread::sleep(Duration::from_millis(100));
        let wanted = ["a".to_string(), "missing".to_string()];
        let found = cache.mget_ex(wanted.iter()).expect("mget_ex");
        assert_eq!(found.len(), 1);
        std::thread::sleep(Duration::from_millis(100));
        assert!(cache.has("a").expect("has"));
        assert!(!cache.has("b").expect("has"));
    }

    #[test]
    fn zero_ttl_never_expires() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        let cache: Cache<String, String> = Cache::new(&store, "forever", Duration::ZERO).expect("cache");
        cache.set("k", "v").expect("set");
        assert_eq!(cache.get_ex("k").expect("get_ex"), Some("v".to_string()));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["k".to_string()]);
    }
}
