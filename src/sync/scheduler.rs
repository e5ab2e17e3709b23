//! Sync scheduling: per-(peer, repository) backoff, single-round-in-flight
//! limiting, and wake-up coalescing.
//!
//! The scheduler drives rounds through a [`SyncTransport`] implementation;
//! transports are injected as trait objects so HTTP, in-process test
//! loopbacks, and anything else plug in the same way.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{DbError, SyncError};
use crate::repo::Repository;
use crate::sync::{SyncBatchItem, SyncBatchRequest, SyncBatchResponse};

/// Transport seam for batch sync exchanges.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn exchange(
        &self,
        peer: &str,
        request: SyncBatchRequest,
    ) -> Result<SyncBatchResponse, SyncError>;
}

/// Exponential backoff with a cap; attempts reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            attempt: 0,
            base,
            max,
        }
    }

    /// Delay before the next try at the current attempt count.
    pub fn delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn note_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}

#[derive(Default)]
struct PeerState {
    backoff: Option<Backoff>,
    in_flight: bool,
    pending_wake: bool,
    /// The peer's filter from its last reply. A commit accepted in round N
    /// is absent from this filter and therefore included in the request of
    /// round N + 1.
    last_remote_filter: Option<crate::sync::BloomFilter>,
}

/// Coordinates rounds for many (peer, repository) pairs.
#[derive(Default)]
pub struct SyncScheduler {
    states: HashMap<(String, String), PeerState>,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&mut self, peer: &str, repo_path: &str) -> &mut PeerState {
        self.states
            .entry((peer.to_string(), repo_path.to_string()))
            .or_default()
    }

    /// Ask for a round soon; multiple wake-ups before the round runs
    /// coalesce into one.
    pub fn request_wake(&mut self, peer: &str, repo_path: &str) {
        self.state(peer, repo_path).pending_wake = true;
    }

    /// Take (and clear) the pending-wake flag.
    pub fn take_wake(&mut self, peer: &str, repo_path: &str) -> bool {
        std::mem::take(&mut self.state(peer, repo_path).pending_wake)
    }

    /// Current retry delay for the pair; zero when healthy.
    pub fn retry_delay(&mut self, peer: &str, repo_path: &str) -> Duration {
        self.state(peer, repo_path)
            .backoff
            .as_ref()
            .map(Backoff::delay)
            .unwrap_or(Duration::ZERO)
    }

    /// Run one sync round for a repository against a peer.
    ///
    /// Enforces the 1-round-in-flight limit per pair: a call while a round
    /// is outstanding records a wake-up and returns without exchanging.
    /// Transport failures advance the pair's backoff; a completed exchange
    /// resets it. Returns the number of newly accepted commits.
    pub async fn run_round(
        &mut self,
        repo: &mut Repository,
        peer: &str,
        transport: &dyn SyncTransport,
    ) -> Result<usize, DbError> {
        let repo_path = repo.path().display().to_string();
        let remote_filter = {
            let state = self.state(peer, &repo_path);
            if state.in_flight {
                state.pending_wake = true;
                return Ok(0);
            }
            state.in_flight = true;
            state.pending_wake = false;
            state.last_remote_filter.clone()
        };

        let mut msg = repo.build_sync_message();
        if let Some(filter) = &remote_filter {
            msg.commits = repo.missing_for_filter(filter);
        }
        let request = vec![SyncBatchItem {
            path: repo_path.clone(),
            msg,
        }];
        let outcome = transport.exchange(peer, request).await;

        let result = match outcome {
            Err(e) => {
                let state = self.state(peer, &repo_path);
                state
                    .backoff
                    .get_or_insert_with(Backoff::default)
                    .note_failure();
                tracing::warn!(
                    "sync round with {peer} failed (attempt {}): {e}",
                    state.backoff.as_ref().map(Backoff::attempt).unwrap_or(0)
                );
                Err(e.into())
            }
            Ok(replies) => {
                if let Some(backoff) = self.state(peer, &repo_path).backoff.as_mut() {
                    backoff.reset();
                }
                let mut accepted = 0;
                for reply in replies {
                    if reply.path == repo_path {
                        self.state(peer, &repo_path).last_remote_filter =
                            Some(reply.res.filter.clone());
                        accepted += repo.apply_sync_reply(reply.res).await?;
                    } else {
                        tracing::warn!("ignoring sync reply for unknown path {}", reply.path);
                    }
                }
                Ok(accepted)
            }
        };

        self.state(peer, &repo_path).in_flight = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;
    use crate::config::{Context, RepoOptions};
    use crate::internal::schema::{FieldSpec, Schema, SchemaRegistry};
    use crate::internal::value::{Value, ValueKind};
    use crate::sync::SyncBatchReply;
    use crate::trust::{LocalIdentity, TrustPool, now_ms};

    const HOUR: i64 = 3_600_000;

    fn shared_context() -> (Context, Context) {
        let schemas = Arc::new(SchemaRegistry::new());
        schemas
            .register(Schema::new("task", 1).field("text", FieldSpec::new(ValueKind::Str)))
            .unwrap();
        let id_a = LocalIdentity::generate(None, HOUR, now_ms()).unwrap();
        let id_b = LocalIdentity::generate(None, HOUR, now_ms()).unwrap();
        let pool_a = TrustPool::new(id_a);
        let pool_b = TrustPool::new(id_b);
        // Each peer knows the other's session.
        pool_a.register_session(pool_b.local().session().clone());
        pool_b.register_session(pool_a.local().session().clone());
        (
            Context::new(schemas.clone(), Arc::new(pool_a)),
            Context::new(schemas, Arc::new(pool_b)),
        )
    }

    async fn repo_at(dir: &tempfile::TempDir, name: &str, ctx: &Context) -> Repository {
        Repository::open(dir.path().join(name), RepoOptions::default(), ctx.clone())
            .await
            .unwrap()
    }

    fn task(ctx: &Context, text: &str) -> crate::internal::item::Item {
        let schema = ctx.schemas.get("task", 1).unwrap();
        let mut item = crate::internal::item::Item::new(schema);
        item.set("text", Value::Str(text.to_string())).unwrap();
        item
    }

    /// Loopback transport answering from a shared peer repository.
    struct Loopback {
        remote: Arc<Mutex<Repository>>,
    }

    #[async_trait]
    impl SyncTransport for Loopback {
        async fn exchange(
            &self,
            _peer: &str,
            request: SyncBatchRequest,
        ) -> Result<SyncBatchResponse, SyncError> {
            let mut remote = self.remote.lock().await;
            let mut replies = Vec::new();
            for item in request {
                let (res, _) = remote
                    .handle_sync_message(item.msg)
                    .await
                    .map_err(|e| SyncError::Transport(e.to_string()))?;
                replies.push(SyncBatchReply {
                    path: item.path,
                    res,
                });
            }
            Ok(replies)
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl SyncTransport for FailingTransport {
        async fn exchange(
            &self,
            _peer: &str,
            _request: SyncBatchRequest,
        ) -> Result<SyncBatchResponse, SyncError> {
            Err(SyncError::Transport("connection refused".to_string()))
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(), Duration::from_millis(100));
        backoff.note_failure();
        assert_eq!(backoff.delay(), Duration::from_millis(200));
        backoff.note_failure();
        assert_eq!(backoff.delay(), Duration::from_millis(400));
        for _ in 0..10 {
            backoff.note_failure();
        }
        assert_eq!(backoff.delay(), Duration::from_secs(1));
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_millis(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rounds_converge_two_peers() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx_a, ctx_b) = shared_context();
        let mut local = repo_at(&dir, "a.log", &ctx_a).await;
        let mut remote = repo_at(&dir, "b.log", &ctx_b).await;

        for i in 0..20 {
            local
                .set_value_for_key(&format!("/t/{i}"), &task(&ctx_a, &format!("t{i}")), None)
                .await
                .unwrap();
        }
        remote
            .set_value_for_key("/t/remote", &task(&ctx_b, "r"), None)
            .await
            .unwrap();

        let remote = Arc::new(Mutex::new(remote));
        let transport = Loopback {
            remote: remote.clone(),
        };
        let mut scheduler = SyncScheduler::new();

        for _ in 0..4 {
            scheduler
                .run_round(&mut local, "peer-b", &transport)
                .await
                .unwrap();
        }

        let remote = remote.lock().await;
        assert_eq!(remote.stats().commits, 21);
        assert_eq!(local.stats().commits, 21);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transport_failure_advances_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx_a, _) = shared_context();
        let mut local = repo_at(&dir, "a.log", &ctx_a).await;
        let mut scheduler = SyncScheduler::new();
        let path = local.path().display().to_string();

        assert!(scheduler
            .run_round(&mut local, "peer-b", &FailingTransport)
            .await
            .is_err());
        let first = scheduler.retry_delay("peer-b", &path);
        assert!(first > Duration::ZERO);

        assert!(scheduler
            .run_round(&mut local, "peer-b", &FailingTransport)
            .await
            .is_err());
        assert!(scheduler.retry_delay("peer-b", &path) > first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wake_requests_coalesce() {
        let mut scheduler = SyncScheduler::new();
        scheduler.request_wake("p", "/r");
        scheduler.request_wake("p", "/r");
        assert!(scheduler.take_wake("p", "/r"));
        assert!(!scheduler.take_wake("p", "/r"));
    }
}
