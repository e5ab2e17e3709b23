//! Durable storage: the append-only record log, the per-file worker task
//! that serializes operations on it, and the on-disk query result cache.

pub mod log;
pub mod query_cache;
pub mod worker;
