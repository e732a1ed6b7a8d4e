//! Purpose: Library crate behind the `stowage` CLI: typed collections persisted in SQLite.
//! Exports: `api` (store handle, collections, LRU cache, errors).
//! Role: Everything public goes through `api`; storage internals stay private.
//! Invariants: Each collection owns exactly one table named from its kind and user name.
//! Invariants: Reads never return expired rows, whether or not the sweep has run yet.
pub mod api;
mod collections;
mod core;
mod lru;
