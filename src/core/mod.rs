// Store handle, row layout, expiry and the shared plumbing every collection uses.
pub mod clock;
pub mod codec;
pub mod error;
pub mod hash;
pub mod iter;
pub mod options;
pub mod store;
pub mod sweep;
pub mod table;
pub mod tx;
