//! Named response caches for the offline worker.
//!
//! This module provides the cache store the worker owns:
//! - Named caches of request identity -> response snapshot
//! - An explicit insertion-order index per cache, used for eviction
//! - A persistent SQLite backend and an in-memory backend

mod memory;
mod storage;
mod traits;

pub use memory::MemoryStorage;
pub use storage::SqliteStorage;
pub use traits::{CacheStorage, CachedResponse};
