//! Repository event stream.
//!
//! Listeners observe events strictly in insertion order within one
//! repository; the bus is a `tokio` broadcast channel, so a slow listener
//! can lag and miss events but never sees them reordered.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::hash::CommitId;

#[derive(Debug, Clone, PartialEq)]
pub enum RepoEvent {
    /// A locally-authored commit was accepted.
    NewCommit { id: CommitId, key: String },
    /// A commit delivered by sync was accepted.
    NewCommitSync { id: CommitId, key: String },
    /// The effective head for a key moved.
    DocumentChanged {
        key: String,
        prev_head: Option<CommitId>,
        new_head: CommitId,
    },
    /// A commit under the user-registry prefix changed a user document.
    UserChanged { user_id: String },
    /// An admitted write later failed to reach stable storage; the
    /// repository is degraded to read-only pending operator action.
    DurabilityFailed { detail: String },
}

/// Broadcast fan-out for one repository's events.
pub struct EventBus {
    tx: broadcast::Sender<RepoEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepoEvent> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<RepoEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Emit an event; a send with no live listeners is not an error.
    pub fn emit(&self, event: RepoEvent) {
        let _ = self.tx.send(event);
    }
}
