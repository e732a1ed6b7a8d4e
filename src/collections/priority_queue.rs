//! Purpose: Persistent priority queue of serde values.
//! Exports: `PriorityQueue`.
//! Invariants: Higher priority dequeues first; equal priorities dequeue in insertion order.
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

pub struct PriorityQueue<T> {
    inner: OrderedTable,
    _types: PhantomData<fn() -> T>,
}

impl<T> PriorityQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, name: &str) -> Result<Self, Error> {
        Ok(Self {
            inner: OrderedTable::open(store, Discipline::Priority, name)?,
            _types: PhantomData,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table
    }

    pub fn enqueue(&self, value: &T, priority: i64) -> Result<(), Error> {
        self.insert("pqueue.enqueue", value, priority, Duration::ZERO)
    }

    pub fn enqueue_ex(&self, value: &T, priority: i64, ttl: Duration) -> Result<(), Error> {
        self.insert("pqueue.enqueue_ex", value, priority, ttl)
    }

    fn insert(&self, op: &str, value: &T, priority: i64, ttl: Duration) -> Result<(), Error> {
        let enc = encode(value).map_err(|err| codec_context(op, "encode value", err))?;
        self.inner.insert(op, &enc, priority, expires_at(ttl))
    }

    pub fn dequeue(&self) -> Result<Option<T>, Error> {
        decode_taken("pqueue.dequeue", self.inner.take("pqueue.dequeue")?)
    }

    pub fn peek(&self) -> Result<Option<T>, Error> {
        decode_taken("pqueue.peek", self.inner.peek("pqueue.peek")?)
    }

    pub fn entries(&self) -> Entries<T> {
        Entries::new(
            &self.inner.store,
            self.inner.page_query("pqueue.entries"),
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
        self.inner.size("pqueue.size")
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.inner.clear("pqueue.clear")
    }
}
