//! Purpose: Persistent LIFO stack of serde values.
//! Exports: `Stack`.
use std::marker::PhantomData;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::collections::codec_context;
use crate::collections::ordered::{Discipline, OrderedTable};
use crate::collections::queue::{decode_taken, decode_value};
use crate::core::clock::expires_at;
use crate::core::codec::encode;
use crate::core::error::Error;
use crate::core::iter::Entries;
use crate::core::store::Store;

pub struct Stack<T> {
    inner: OrderedTable,
    _types: PhantomData<fn() -> T>,
}

impl<T> Stack<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, name: &str) -> Result<Self, Error> {
        Ok(Self {
            inner: OrderedTable::open(store, Discipline::Lifo, name)?,
            _types: PhantomData,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table
    }

    pub fn push(&self, value: &T) -> Result<(), Error> {
        self.insert("stack.push", value, Duration::ZERO)
    }

    pub fn push_ex(&self, value: &T, ttl: Duration) -> Result<(), Error> {
        self.insert("stack.push_ex", value, ttl)
    }

    fn insert(&self, op: &str, value: &T, ttl: Duration) -> Result<(), Error> {
        let enc = encode(value).map_err(|err| codec_context(op, "encode value", err))?;
        self.inner.insert(op, &enc, 0, expires_at(ttl))
    }

    /// Removes and returns the newest live value.
    pub fn pop(&self) -> Result<Option<T>, Error> {
        decode_taken("stack.pop", self.inner.take("stack.pop")?)
    }

    pub fn peek(&self) -> Result<Option<T>, Error> {
        decode_taken("stack.peek", self.inner.peek("stack.peek")?)
    }

    /// Live values from top to bottom.
    pub fn entries(&self) -> Entries<T> {
        Entries::new(
            &self.inner.store,
            self.inner.page_query("stack.entries"),
            decode_value::<T>,
            &self.inner.errors,
        )
    }

    pub fn values(&self) -> Entries<T> {
        self.entries()
    }

    pub fn iter_error(&self) -> Option<Error> {
        self.inner.errors.take()
    }

    pub fn size(&self) -> Result<usize, Error> {
        self.inner.size("stack.size")
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.inner.clear("stack.clear")
    }
}

#[cfg(test)]
mod tests {
    use super::Stack;
    use crate::core::options::StoreOptions;
    use crate::core::store::Store;
    use std::time::Duration;

    #[test]
    fn pops_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = StoreOptions::new().with_sweep_interval(Duration::from_secs(3600));
        let store = Store::open_with(dir.path().join("stack.sqlite"), options).expect("open");
        let undo: Stack<String> = Stack::new(&store, "undo").expect("stack");
        for step in ["a", "b", "c"] {
            undo.push(&step.to_string()).expect("push");
        }
        assert_eq!(undo.values().collect::<Vec<_>>(), vec!["c", "b", "a"]);
        assert_eq!(undo.pop().expect("pop"), Some("c".to_string()));
        assert_eq!(undo.peek().expect("peek"), Some("b".to_string()));
        assert_eq!(undo.size().expect("size"), 2);
        undo.clear().expect("clear");
        assert_eq!(undo.pop().expect("pop empty"), None);
    }
}
