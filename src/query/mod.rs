//! The incremental query engine.
//!
//! A query is a predicate (plus optional sort key) over one repository's
//! materialized values. The engine rides on commit ages: the first run
//! scans every key in age order, and each refresh only re-evaluates keys
//! touched by commits newer than `last_processed_age`, so an update costs
//! O(new commits). Results are kept sorted by sort key with a
//! lexicographic key tie-break, and can be persisted to an on-disk cache
//! keyed by a digest of the query definition; a cache that references a
//! head the repository no longer knows is rejected and triggers a clean
//! rescan.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use crate::errors::{DbError, QueryError};
use crate::hash::{CommitId, ContentHash};
use crate::internal::item::Item;
use crate::internal::value::{Value, canonical, cmp_values};
use crate::repo::Repository;
use crate::storage::query_cache::{CacheRow, QueryCacheDoc};

/// Caller-supplied evaluation context; bumping `version` invalidates any
/// persisted cache.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub version: u64,
    pub params: BTreeMap<String, Value>,
}

pub type Predicate = Box<dyn Fn(&Item, &QueryContext) -> bool + Send + Sync>;
pub type SortKeyFn = Box<dyn Fn(&Item) -> Value + Send + Sync>;

/// Definition of a query. The `*_source` strings stand in for the closures
/// in the cache key, so persisted results survive restarts only for the
/// same definition text.
pub struct QueryDef {
    /// Restrict matches to items of this schema namespace.
    pub namespace: Option<String>,
    pub predicate: Predicate,
    pub predicate_source: String,
    pub sort_key: Option<SortKeyFn>,
    pub sort_source: String,
    pub ctx: QueryContext,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    ResultsChanged,
}

struct Row {
    sort_value: Value,
    key: String,
    head: CommitId,
}

pub struct Query {
    def: QueryDef,
    rows: Vec<Row>,
    last_processed_age: u64,
    cancelled: Arc<AtomicBool>,
    events: broadcast::Sender<QueryEvent>,
}

impl Query {
    pub fn new(def: QueryDef) -> Self {
        let (events, _) = broadcast::channel(16);
        Query {
            def,
            rows: Vec::new(),
            last_processed_age: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Digest identifying this query definition:
    /// `hash(predicate_source ⊕ sort_source ⊕ ctx_version)`.
    pub fn cache_key(&self) -> ContentHash {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.def.predicate_source.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.def.sort_source.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&self.def.ctx.version.to_le_bytes());
        ContentHash::compute(&bytes)
    }

    pub fn last_processed_age(&self) -> u64 {
        self.last_processed_age
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.events.subscribe()
    }

    /// Cooperative cancellation: evaluation in flight stops at the next
    /// commit boundary without emitting further events.
    pub fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Matching `(key, head)` pairs in sort order, truncated to `limit`.
    pub fn results(&self) -> Vec<(String, CommitId)> {
        let rows = self.rows.iter().map(|r| (r.key.clone(), r.head));
        match self.def.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }

    /// Process commits newer than `last_processed_age` and update results.
    /// Returns true when the result set changed.
    pub async fn refresh(&mut self, repo: &mut Repository) -> Result<bool, DbError> {
        // Collect the touched keys first; evaluation below needs the
        // repository mutably for merge-on-read.
        let mut touched: Vec<(u64, String)> = repo
            .graph()
            .commits_since(self.last_processed_age)
            .iter()
            .map(|c| (c.age.unwrap_or(0), c.key.clone()))
            .collect();
        if touched.is_empty() {
            return Ok(false);
        }
        touched.sort();
        let mut keys: Vec<String> = Vec::new();
        let mut max_age = self.last_processed_age;
        for (age, key) in touched {
            max_age = max_age.max(age);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let mut changed = false;
        for key in keys {
            if self.is_closed() {
                return Err(QueryError::Cancelled.into());
            }
            let value = repo.value_for_key(&key).await?;
            let matched = match &value {
                Some((item, _)) => {
                    !item.is_deleted()
                        && self
                            .def
                            .namespace
                            .as_deref()
                            .is_none_or(|ns| item.schema().namespace == ns)
                        && (self.def.predicate)(item, &self.def.ctx)
                }
                None => false,
            };
            changed |= self.remove_row(&key);
            if matched {
                let (item, head) = value.expect("matched implies value");
                let sort_value = self
                    .def
                    .sort_key
                    .as_ref()
                    .map(|f| f(&item))
                    .unwrap_or(Value::Null);
                self.insert_row(Row {
                    sort_value,
                    key,
                    head,
                });
                changed = true;
            }
        }
        // Merge-on-read above may have appended merge commits; their keys
        // were just evaluated, so the boundary advances past them too.
        self.last_processed_age = repo.graph().max_age().max(max_age);

        if changed && !self.is_closed() {
            let _ = self.events.send(QueryEvent::ResultsChanged);
        }
        Ok(changed)
    }

    fn remove_row(&mut self, key: &str) -> bool {
        let before = self.rows.len();
        self.rows.retain(|row| row.key != key);
        self.rows.len() != before
    }

    fn insert_row(&mut self, row: Row) {
        let at = self
            .rows
            .binary_search_by(|probe| {
                cmp_values(&probe.sort_value, &row.sort_value)
                    .then_with(|| probe.key.cmp(&row.key))
            })
            .unwrap_or_else(|idx| idx);
        self.rows.insert(at, row);
    }

    /// Persist results and the age boundary.
    pub fn save_cache(&self, path: &std::path::Path) -> Result<(), DbError> {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                Ok(CacheRow {
                    key: row.key.clone(),
                    head_id: row.head,
                    sort_key: canonical::to_canonical_json(&row.sort_value)
                        .map_err(DbError::Schema)?,
                })
            })
            .collect::<Result<Vec<_>, DbError>>()?;
        QueryCacheDoc::new(self.cache_key(), self.last_processed_age, rows)
            .save(path)
            .map_err(DbError::Storage)
    }

    /// Resume from a persisted cache. The document must carry this query's
    /// cache key, an age boundary the repository has reached, and only head
    /// ids the repository knows; otherwise `CacheInvalid` forces a rescan from
    /// scratch.
    pub fn load_cache(
        &mut self,
        path: &std::path::Path,
        repo: &Repository,
    ) -> Result<(), QueryError> {
        let doc = QueryCacheDoc::load(path, &self.cache_key())?;
        if doc.last_processed_age > repo.graph().max_age() {
            return Err(QueryError::CacheInvalid(
                "age boundary beyond repository".to_string(),
            ));
        }
        let mut rows = Vec::with_capacity(doc.results.len());
        for cached in &doc.results {
            if !repo.graph().contains(&cached.head_id) {
                return Err(QueryError::CacheInvalid(format!(
                    "unknown head {}",
                    cached.head_id
                )));
            }
            let sort_value = canonical::from_canonical_json(&cached.sort_key)
                .map_err(|e| QueryError::CacheInvalid(e.to_string()))?;
            rows.push(Row {
                sort_value,
                key: cached.key.clone(),
                head: cached.head_id,
            });
        }
        self.rows.clear();
        for row in rows {
            self.insert_row(row);
        }
        self.last_processed_age = doc.last_processed_age;
        Ok(())
    }
}
