//! Purpose: Define the public Rust API boundary for stowage.
//! Exports: Store handle, typed collections, the in-memory LRU cache and the error model.
//! Role: Additive-only surface; hides SQL, codec and sweep internals.
//! Invariants: This module is the only public path to collection types.

pub use crate::collections::cache::Cache;
pub use crate::collections::list::List;
pub use crate::collections::map::Map;
pub use crate::collections::priority_queue::PriorityQueue;
pub use crate::collections::queue::Queue;
pub use crate::collections::set::Set;
pub use crate::collections::stack::Stack;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::iter::Entries;
pub use crate::core::options::StoreOptions;
pub use crate::core::store::{Store, SweepReport};
pub use crate::core::table::{TableKind, normalized_table_name};
pub use crate::lru::LruCache;
