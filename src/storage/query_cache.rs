//! On-disk query result cache.
//!
//! A query persists its sorted result rows plus the age boundary it has
//! processed up to, keyed by a digest of the query's definition. On reopen
//! the cache is only honored when the stored `cache_key` matches and every
//! referenced head commit is still known; anything else invalidates the
//! document and forces a clean rescan. Writes are atomic (temp file +
//! rename) so a crash never leaves a half-written cache.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{QueryError, StorageError};
use crate::hash::{CommitId, ContentHash};

/// Format version of the cache document.
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub key: String,
    pub head_id: CommitId,
    pub sort_key: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCacheDoc {
    pub version: u32,
    pub cache_key: ContentHash,
    pub last_processed_age: u64,
    pub results: Vec<CacheRow>,
}

impl QueryCacheDoc {
    pub fn new(cache_key: ContentHash, last_processed_age: u64, results: Vec<CacheRow>) -> Self {
        QueryCacheDoc {
            version: CACHE_VERSION,
            cache_key,
            last_processed_age,
            results,
        }
    }

    /// Load and validate a cache document against the expected key.
    pub fn load(path: &Path, expected_key: &ContentHash) -> Result<Self, QueryError> {
        let bytes = std::fs::read(path)
            .map_err(|e| QueryError::CacheInvalid(format!("unreadable: {e}")))?;
        let doc: QueryCacheDoc = serde_json::from_slice(&bytes)
            .map_err(|e| QueryError::CacheInvalid(format!("undecodable: {e}")))?;
        if doc.version != CACHE_VERSION {
            return Err(QueryError::CacheInvalid(format!(
                "version {} != {CACHE_VERSION}",
                doc.version
            )));
        }
        if doc.cache_key != *expected_key {
            return Err(QueryError::CacheInvalid("cache_key mismatch".to_string()));
        }
        Ok(doc)
    }

    /// Atomically persist the document.
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| StorageError::io(path, std::io::Error::other(e)))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
        Ok(())
    }
}
