//! GoatDB core: an embedded, distributed, version-controlled document
//! database. Every peer replicates the full dataset; concurrent edits
//! reconcile through a Git-like commit graph with a deterministic
//! three-way merge, peers exchange deltas through a bloom-filter sync
//! protocol, and queries update incrementally off commit ages.

pub mod config;
pub mod errors;
pub mod hash;
pub mod internal;
pub mod query;
pub mod repo;
pub mod storage;
pub mod sync;
pub mod trust;
