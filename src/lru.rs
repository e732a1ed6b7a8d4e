//! Purpose: Bounded in-memory LRU cache with per-entry expiry.
//! Exports: `LruCache`.
//! Role: Independent of the SQLite store; shares only the expiry arithmetic and sweeper thread.
//! Invariants: The key index and the recency list always hold exactly the same nodes.
//! Invariants: Entry count never exceeds `max_size` after a `set` returns.
//! Notes: Nodes live in an index arena; freed slots are recycled through a free list.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::clock::{expires_at_from, is_live, now_millis};
use crate::core::error::{Error, ErrorKind};
use crate::core::sweep::Sweeper;

struct Node<K, V> {
    key: K,
    value: V,
    expires_at: i64,
    prev: Option<usize>,
    next: Option<usize>,
}

struct State<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl<K, V> State<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|node| (node.prev, node.next)) else {
            return;
        };
        match prev {
            Some(prev) => {
                if let Some(node) = self.node_mut(prev) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(node) = self.node_mut(next) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => {
                if let Some(node) = self.node_mut(head) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert_front(&mut self, key: K, value: V, expires_at: i64) {
        let node = Node {
            key: key.clone(),
            value,
            expires_at,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    fn remove(&mut self, idx: usize) -> Option<Node<K, V>> {
        self.unlink(idx);
        let node = self.nodes.get_mut(idx)?.take()?;
        self.index.remove(&node.key);
        self.free.push(idx);
        Some(node)
    }

    fn live_index(&mut self, key: &K, now: i64) -> Option<usize> {
        let idx = *self.index.get(key)?;
        let expires_at = self.node(idx)?.expires_at;
        if is_live(expires_at, now) {
            Some(idx)
        } else {
            self.remove(idx);
            None
        }
    }

    /// Walks tail to head removing expired nodes.
    fn evict_expired(&mut self, now: i64) -> usize {
        let mut evicted = 0;
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            let Some(node) = self.node(idx) else {
                break;
            };
            cursor = node.prev;
            if !is_live(node.expires_at, now) {
                self.remove(idx);
                evicted += 1;
            }
        }
        evicted
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }
}

pub struct LruCache<K, V> {
    state: Arc<Mutex<State<K, V>>>,
    max_size: usize,
    ttl: Duration,
    cleanup: Mutex<Option<Sweeper>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Creates a cache holding at most `max_size` entries. `ttl` applies to
    /// every `set`; zero means entries only leave by eviction or delete.
    pub fn new(max_size: usize, ttl: Duration) -> Result<Self, Error> {
        if max_size == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("lru max size must be positive"));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(State::new())),
            max_size,
            ttl,
            cleanup: Mutex::new(None),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = expires_at_from(now_millis(), ttl);
        let mut state = self.lock();
        if let Some(&idx) = state.index.get(&key) {
            if let Some(node) = state.node_mut(idx) {
                node.value = value;
                node.expires_at = expires_at;
            }
            state.touch(idx);
            return;
        }
        state.insert_front(key, value, expires_at);
        if state.index.len() > self.max_size {
            if let Some(tail) = state.tail {
                state.remove(tail);
            }
        }
    }

    /// Returns the value and marks it most recently used. Expired entries are
    /// evicted on the way.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let idx = state.live_index(key, now_millis())?;
        state.touch(idx);
        state.node(idx).map(|node| node.value.clone())
    }

    /// Like `get` without changing recency.
    pub fn peek(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let idx = state.live_index(key, now_millis())?;
        state.node(idx).map(|node| node.value.clone())
    }

    pub fn has(&self, key: &K) -> bool {
        let state = self.lock();
        state
            .index
            .get(key)
            .and_then(|&idx| state.node(idx))
            .is_some_and(|node| is_live(node.expires_at, now_millis()))
    }

    pub fn delete(&self, key: &K) -> bool {
        let mut state = self.lock();
        match state.index.get(key).copied() {
            Some(idx) => state.remove(idx).is_some(),
            None => false,
        }
    }

    /// Entries currently held, including expired ones not yet evicted.
    pub fn size(&self) -> usize {
        self.lock().index.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Live keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        let state = self.lock();
        let now = now_millis();
        let mut keys = Vec::with_capacity(state.index.len());
        let mut cursor = state.head;
        while let Some(node) = cursor.and_then(|idx| state.node(idx)) {
            if is_live(node.expires_at, now) {
                keys.push(node.key.clone());
            }
            cursor = node.next;
        }
        keys
    }

    /// Evicts every expired entry now and returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.lock().evict_expired(now_millis())
    }

    /// Starts a background thread evicting expired entries every `interval`.
    /// Calling it again while running is a no-op.
    pub fn start_cleanup(&self, interval: Duration) -> Result<(), Error> {
        let mut cleanup = self.cleanup.lock().unwrap_or_else(PoisonError::into_inner);
        if cleanup.is_some() {
            return Ok(());
        }
        let state = Arc::clone(&self.state);
        let sweeper = Sweeper::spawn("stowage-lru-sweep", interval, move || {
            let evicted = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .evict_expired(now_millis());
            if evicted > 0 {
                tracing::debug!(evicted, "lru sweep");
            }
        })?;
        *cleanup = Some(sweeper);
        Ok(())
    }

    /// Stops the cleanup thread and waits for it to exit. No-op when not running.
    pub fn stop_cleanup(&self) {
        let sweeper = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Drop for LruCache<K, V> {
    fn drop(&mut self) {
        let sweeper = self
            .cleanup
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop();
        }
    }
}
