//! Purpose: Persistent FIFO queue of serde values.
//! Exports: `Queue`.
//! Role: Typed face over an `ordered` table consumed oldest first.
use std::marker::PhantomData;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::collections::codec_context;
use crate::collections::ordered::{Discipline, OrderedTable};
use crate::core::clock::expires_at;
use crate::core::codec::{decode, encode};
use crate::core::error::Error;
use crate::core::iter::{Entries, RawRow};
use crate::core::store::Store;

pub struct Queue<T> {
    inner: OrderedTable,
    _types: PhantomData<fn() -> T>,
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: &Store, name: &str) -> Result<Self, Error> {
        Ok(Self {
            inner: OrderedTable::open(store, Discipline::Fifo, name)?,
            _types: PhantomData,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.inner.table
    }

    pub fn enqueue(&self, value: &T) -> Result<(), Error> {
        self.insert("queue.enqueue", value, Duration::ZERO)
    }

    pub fn enqueue_ex(&self, value: &T, ttl: Duration) -> Result<(), Error> {
        self.insert("queue.enqueue_ex", value, ttl)
    }

    fn insert(&self, op: &str, value: &T, ttl: Duration) -> Result<(), Error> {
        let enc = encode(value).map_err(|err| codec_context(op, "encode value", err))?;
        self.inner.insert(op, &enc, 0, expires_at(ttl))
    }

    /// Removes and returns the oldest live value.
    pub fn dequeue(&self) -> Result<Option<T>, Error> {
        decode_taken("queue.dequeue", self.inner.take("queue.dequeue")?)
    }

    pub fn peek(&self) -> Result<Option<T>, Error> {
        decode_taken("queue.peek", self.inner.peek("queue.peek")?)
    }

    /// Live values in dequeue order, without consuming them.
    pub fn entries(&self) -> Entries<T> {
        Entries::new(
            &self.inner.store,
            self.inner.page_query("queue.entries"),
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
        self.inner.size("queue.size")
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.inner.clear("queue.clear")
    }
}

/// Decodes a value removed from or read at the head of an ordered table.
pub(crate) fn decode_taken<T: DeserializeOwned>(
    op: &str,
    raw: Option<Vec<u8>>,
) -> Result<Option<T>, Error> {
    raw.map(|raw| decode(&raw).map_err(|err| codec_context(op, "decode value", err)))
        .transpose()
}

pub(crate) fn decode_value<T: DeserializeOwned>(raw: RawRow) -> Result<T, Error> {
    decode(&raw.value).map_err(|err| err.with_message("decode value"))
}
