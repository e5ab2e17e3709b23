//! The repository engine.
//!
//! A repository owns its commit log, its graph, and a materialized-value
//! cache, and runs as one cooperative task: all mutation flows through
//! `&mut self` in insertion order. Opening replays the log into the graph
//! (ages follow log order), local writes and sync deliveries both funnel
//! through [`Repository::persist_commits`], and a key with multiple leaves
//! gets a deterministic synthetic merge on first read.
//!
//! Lifecycle: `Loading → Ready ⇄ Flushing → Closing → Closed`. Writes
//! outside `Ready` are rejected with `DbError::RepoState`. A durability
//! failure after an in-memory admission emits `DurabilityFailed` and
//! degrades the repository to read-only pending operator action.

pub mod events;

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use tokio::sync::broadcast;

use crate::config::{Context, RepoOptions};
use crate::errors::{DbError, GraphError, SyncError};
use crate::hash::CommitId;
use crate::internal::commit::{Commit, CommitContents};
use crate::internal::graph::CommitGraph;
use crate::internal::item::Item;
use crate::internal::merge::{self, MergeFallback};
use crate::storage::log::{LogCursor, RecordLog};
use crate::storage::worker::LogWorker;
use crate::sync::{SyncMessage, round};
use crate::trust::now_ms;

pub use events::RepoEvent;

/// Key prefix whose documents represent users; commits under it raise
/// `UserChanged`.
pub const USERS_PREFIX: &str = "/sys/users/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Loading,
    Ready,
    Flushing,
    Closing,
    Closed,
}

/// Aggregate counters used by tests and the sync scheduler's logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoStats {
    pub commits: usize,
    pub keys: usize,
    pub shallow_edges: usize,
    pub log_records: u64,
}

pub struct Repository {
    path: PathBuf,
    options: RepoOptions,
    ctx: Context,
    graph: CommitGraph,
    worker: LogWorker,
    state: RepoState,
    degraded: bool,
    events: events::EventBus,
    materialized: AHashMap<String, (Item, CommitId)>,
    log_records: u64,
    /// Sync accuracy hint: forced to 1 after a local write, drifts back to
    /// the configured idle value as rounds complete.
    cycles_hint: u32,
    merge_fallbacks: Vec<MergeFallback>,
}

impl Repository {
    /// Open the repository at `path`, replaying the commit log. A torn
    /// trailing record is truncated away; a corrupt middle record surfaces
    /// as `StorageError::Corruption` for the operator to resolve.
    pub async fn open(
        path: impl Into<PathBuf>,
        options: RepoOptions,
        ctx: Context,
    ) -> Result<Self, DbError> {
        let path = path.into();
        let mut log = RecordLog::open(&path)?;
        let mut graph = CommitGraph::new();
        let mut log_records = 0u64;

        let mut cursor: LogCursor<Commit> = log.cursor()?;
        loop {
            let (batch, done) = cursor.next_batch(options.scan_batch)?;
            for commit in batch {
                log_records += 1;
                match graph.add(commit) {
                    Ok(_) => {}
                    Err(GraphError::Cycle(id)) => {
                        tracing::warn!("skipping cyclic commit {id} during replay");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if done {
                break;
            }
        }
        if let Some(offset) = cursor.partial_tail() {
            log.truncate_to(offset)?;
        }
        drop(cursor);

        let default_cycles = options.default_cycles;
        let worker = LogWorker::spawn(log, options.log_queue_depth);
        Ok(Repository {
            path,
            options,
            ctx,
            graph,
            worker,
            state: RepoState::Ready,
            degraded: false,
            events: events::EventBus::new(256),
            materialized: AHashMap::new(),
            log_records,
            cycles_hint: default_cycles,
            merge_fallbacks: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> RepoState {
        self.state
    }

    pub fn stats(&self) -> RepoStats {
        RepoStats {
            commits: self.graph.len(),
            keys: self.graph.keys().len(),
            shallow_edges: self.graph.shallow_edges().len(),
            log_records: self.log_records,
        }
    }

    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    /// Merge fallbacks recorded so far; diagnostics, not errors.
    pub fn merge_fallbacks(&self) -> &[MergeFallback] {
        &self.merge_fallbacks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
        self.events.subscribe()
    }

    fn ensure_writable(&self) -> Result<(), DbError> {
        if self.degraded {
            return Err(DbError::RepoState("degraded"));
        }
        match self.state {
            RepoState::Ready => Ok(()),
            RepoState::Loading => Err(DbError::RepoState("loading")),
            RepoState::Flushing => Err(DbError::RepoState("flushing")),
            RepoState::Closing => Err(DbError::RepoState("closing")),
            RepoState::Closed => Err(DbError::RepoState("closed")),
        }
    }

    /// Bulk insertion path shared by local writes and sync delivery.
    ///
    /// Idempotent by commit id; unsigned or invalid commits are rejected
    /// without touching graph or log. Returns the count of newly accepted
    /// commits. Commits referencing unknown parents are accepted and the
    /// parents recorded as shallow edges for the next sync round.
    pub async fn persist_commits(
        &mut self,
        commits: Vec<Commit>,
        from_sync: bool,
    ) -> Result<usize, DbError> {
        self.ensure_writable()?;
        let now = now_ms();
        let mut accepted: Vec<Commit> = Vec::new();

        for commit in commits {
            if let Err(e) = self.ctx.trust.verify_commit(&commit, now) {
                tracing::warn!("rejecting commit {}: {e}", commit.id);
                continue;
            }
            let prev_head = self.effective_head(&commit.key);
            match self.graph.add(commit.clone()) {
                Ok(true) => {
                    self.materialized.remove(&commit.key);
                    let event = if from_sync {
                        RepoEvent::NewCommitSync {
                            id: commit.id,
                            key: commit.key.clone(),
                        }
                    } else {
                        RepoEvent::NewCommit {
                            id: commit.id,
                            key: commit.key.clone(),
                        }
                    };
                    self.events.emit(event);
                    self.events.emit(RepoEvent::DocumentChanged {
                        key: commit.key.clone(),
                        prev_head,
                        new_head: commit.id,
                    });
                    if let Some(user_id) = commit.key.strip_prefix(USERS_PREFIX) {
                        self.events.emit(RepoEvent::UserChanged {
                            user_id: user_id.to_string(),
                        });
                    }
                    accepted.push(commit);
                }
                Ok(false) => {}
                Err(GraphError::Cycle(id)) => {
                    tracing::warn!("rejecting cyclic commit {id}");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !accepted.is_empty() {
            if !from_sync {
                self.cycles_hint = 1;
            }
            let lines: Vec<serde_json::Value> = accepted
                .iter()
                .map(|c| serde_json::to_value(c).expect("commit serializes"))
                .collect();
            let count = lines.len() as u64;
            if let Err(e) = self.worker.append(lines).await {
                tracing::error!("durability failure on {}: {e}", self.path.display());
                self.degraded = true;
                self.events.emit(RepoEvent::DurabilityFailed {
                    detail: e.to_string(),
                });
            } else {
                self.log_records += count;
            }
        }
        Ok(accepted.len())
    }

    /// The single "effective" head for a key. With one leaf that leaf's id;
    /// with several, a deterministic synthetic merge is created, persisted,
    /// and returned.
    pub async fn head_for_key(&mut self, key: &str) -> Result<Option<CommitId>, DbError> {
        loop {
            let leaves = self.graph.leaves(key);
            match leaves.len() {
                0 => return Ok(None),
                1 => return Ok(Some(leaves[0])),
                _ => {
                    let outcome =
                        merge::merge_leaves(&self.graph, &self.ctx.schemas, key, &leaves)?;
                    if !outcome.fallbacks.is_empty() {
                        self.merge_fallbacks.extend(outcome.fallbacks.iter().cloned());
                    }
                    let merge_id = outcome.commit.id;
                    let accepted = self.persist_commits(vec![outcome.commit], false).await?;
                    if accepted == 0 {
                        // The merge already existed; its insertion settled
                        // the head set.
                        return Ok(Some(merge_id));
                    }
                    self.materialized
                        .insert(key.to_string(), (outcome.item, merge_id));
                }
            }
        }
    }

    /// Materialized value and effective head for a key, or none.
    pub async fn value_for_key(
        &mut self,
        key: &str,
    ) -> Result<Option<(Item, CommitId)>, DbError> {
        let Some(head) = self.head_for_key(key).await? else {
            return Ok(None);
        };
        if let Some((item, cached_head)) = self.materialized.get(key) {
            if *cached_head == head {
                return Ok(Some((item.clone(), head)));
            }
        }
        let item = merge::materialize(&self.graph, &self.ctx.schemas, &head)?;
        self.materialized
            .insert(key.to_string(), (item.clone(), head));
        Ok(Some((item, head)))
    }

    /// Record a new value for a key under the local session.
    ///
    /// `expected_head` becomes the commit's parent. A stale expected head is
    /// not an error: the write is admitted as a concurrent branch and a
    /// later merge reconciles it. Never fails on contention.
    pub async fn set_value_for_key(
        &mut self,
        key: &str,
        item: &Item,
        expected_head: Option<CommitId>,
    ) -> Result<CommitId, DbError> {
        self.ensure_writable()?;
        let parents: Vec<CommitId> = expected_head.into_iter().collect();
        let contents = self.contents_for(item, expected_head)?;
        let mut commit = Commit::new(
            key,
            self.ctx.trust.local().session_id(),
            now_ms(),
            self.ctx.build.version.clone(),
            parents,
            contents,
        );
        self.ctx.trust.sign_commit(&mut commit);
        let id = commit.id;
        self.persist_commits(vec![commit], false).await?;
        Ok(id)
    }

    /// Snapshot, or a delta against the expected head when that encodes
    /// smaller.
    fn contents_for(
        &self,
        item: &Item,
        expected_head: Option<CommitId>,
    ) -> Result<CommitContents, DbError> {
        let snapshot = CommitContents::Snapshot(item.to_snapshot().map_err(DbError::Schema)?);
        let Some(base_id) = expected_head else {
            return Ok(snapshot);
        };
        let Ok(base_item) = merge::materialize(&self.graph, &self.ctx.schemas, &base_id) else {
            return Ok(snapshot);
        };
        let ops = base_item.diff(item).map_err(DbError::Schema)?;
        let delta = CommitContents::Delta { base: base_id, ops };
        let snapshot_len = serde_json::to_vec(&snapshot).map(|b| b.len()).unwrap_or(0);
        let delta_len = serde_json::to_vec(&delta)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        Ok(if delta_len < snapshot_len {
            delta
        } else {
            snapshot
        })
    }

    /// Commits visible to `session_id`: its own rows, rows by sessions with
    /// the same owner, and everything for root-owned sessions. Merge
    /// commits follow their winning writer's visibility.
    pub fn commits(&self, session_id: &str) -> Vec<&Commit> {
        let viewer = self.ctx.trust.session(session_id);
        let viewer_owner = viewer.as_ref().and_then(|s| s.owner.clone());
        let is_root = viewer.as_ref().is_some_and(|s| s.is_root());
        let mut visible: Vec<&Commit> = self
            .graph
            .commits_by_age()
            .into_iter()
            .filter(|commit| {
                if is_root || commit.session == session_id {
                    return true;
                }
                match (&viewer_owner, self.ctx.trust.session(&commit.session)) {
                    (Some(owner), Some(author)) => author.owner.as_deref() == Some(owner),
                    _ => false,
                }
            })
            .collect();
        visible.sort_by_key(|c| c.age.unwrap_or(0));
        visible
    }

    pub fn num_commits(&self, session_id: &str) -> usize {
        self.commits(session_id).len()
    }

    /// Drain pending appends and sync the log to stable storage.
    pub async fn flush(&mut self) -> Result<(), DbError> {
        self.ensure_writable()?;
        self.state = RepoState::Flushing;
        let result = self.worker.flush().await;
        self.state = RepoState::Ready;
        result?;
        Ok(())
    }

    /// Flush, release the log, and reject all further operations.
    /// Idempotent.
    pub async fn close(&mut self) -> Result<(), DbError> {
        if self.state == RepoState::Closed {
            return Ok(());
        }
        self.state = RepoState::Closing;
        let result = self.worker.close().await;
        self.state = RepoState::Closed;
        result?;
        Ok(())
    }

    fn effective_head(&self, key: &str) -> Option<CommitId> {
        self.materialized.get(key).map(|(_, head)| *head).or_else(|| {
            let leaves = self.graph.leaves(key);
            leaves
                .iter()
                .max_by_key(|id| {
                    self.graph
                        .get(id)
                        .map(|c| c.tie_break_key())
                        .unwrap_or((i64::MIN, **id))
                })
                .copied()
        })
    }

    // --- sync integration -------------------------------------------------

    /// Build this repository's half of a sync round.
    pub fn build_sync_message(&self) -> SyncMessage {
        SyncMessage {
            filter: round::filter_of(&self.graph, self.cycles_hint),
            size: self.graph.len() as u64,
            cycles: self.cycles_hint,
            build_version: self.ctx.build.version.clone(),
            commits: Vec::new(),
        }
    }

    /// Local commits the peer's filter does not contain, bounded by the
    /// configured payload cap.
    pub fn missing_for_filter(&self, peer_filter: &crate::sync::BloomFilter) -> Vec<Commit> {
        round::missing_for_peer(&self.graph, peer_filter, self.options.sync_payload_byte_cap)
    }

    /// Process a peer's message: admit its commits, then answer with our
    /// filter and whatever the peer's filter says it is missing.
    pub async fn handle_sync_message(
        &mut self,
        msg: SyncMessage,
    ) -> Result<(SyncMessage, usize), DbError> {
        self.check_version_skew(&msg.build_version)?;
        let accepted = self.persist_commits(msg.commits.clone(), true).await?;
        let missing = round::missing_for_peer(
            &self.graph,
            &msg.filter,
            self.options.sync_payload_byte_cap,
        );
        let mut reply = self.build_sync_message();
        reply.commits = missing;
        // This round satisfied the post-write accuracy boost.
        self.cycles_hint = self.options.default_cycles;
        Ok((reply, accepted))
    }

    /// Admit the commits from a peer's reply.
    pub async fn apply_sync_reply(&mut self, reply: SyncMessage) -> Result<usize, DbError> {
        self.check_version_skew(&reply.build_version)?;
        self.persist_commits(reply.commits, true).await
    }

    fn check_version_skew(&self, remote: &str) -> Result<(), DbError> {
        let major = |v: &str| {
            v.split('.')
                .next()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0)
        };
        let local_major = major(&self.ctx.build.version);
        let remote_major = major(remote);
        if local_major != remote_major {
            return Err(SyncError::VersionSkew {
                local: local_major,
                remote: remote_major,
            }
            .into());
        }
        Ok(())
    }
}
