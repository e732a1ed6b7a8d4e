//! Purpose: Tunables for a `Store` handle.
//! Exports: `StoreOptions`.
//! Role: Builder-style configuration consumed once by `Store::open_with`.
//! Invariants: Defaults match the documented sweep cadence (1s, batches of 1000) and pool bound (4).
use std::time::Duration;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreOptions {
    /// Delay between two sweep passes.
    pub sweep_interval: Duration,
    /// Rows deleted per statement while sweeping one table.
    pub sweep_batch_size: usize,
    /// Upper bound on pooled SQLite connections.
    pub max_connections: u32,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// Page cache per connection, in KiB.
    pub cache_size_kib: u32,
    /// Rows fetched per round trip by `entries()` iterators.
    pub iter_page_size: usize,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            sweep_batch_size: 1000,
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            cache_size_kib: 20_000,
            iter_page_size: 256,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_batch_size(mut self, batch_size: usize) -> Self {
        self.sweep_batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_cache_size_kib(mut self, kib: u32) -> Self {
        self.cache_size_kib = kib;
        self
    }

    pub fn with_iter_page_size(mut self, page_size: usize) -> Self {
        self.iter_page_size = page_size.max(1);
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new()
    }
}
