//! The probabilistic delta-sync protocol.
//!
//! Peers exchange [`SyncMessage`]s per repository: each side sends a bloom
//! filter over every commit id it holds, and replies with the commits the
//! other side is probably missing. Rounds are stateless; a false negative
//! at the filter's error rate simply survives to the next round, and the
//! cycle counter tunes the next filter's accuracy. Batch envelopes carry
//! one message per repository path and a signature over a canonical request
//! summary.

pub mod bloom;
pub mod round;
pub mod scheduler;

use serde::{Deserialize, Serialize};

use crate::internal::commit::Commit;

pub use bloom::BloomFilter;
pub use round::{fpr_for_cycles, missing_for_peer};
pub use scheduler::{Backoff, SyncScheduler, SyncTransport};

/// One repository's half of a sync round.
///
/// Decoding ignores unknown fields, so peers may extend the format without
/// breaking older builds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Membership filter over every commit id the sender holds.
    pub filter: BloomFilter,
    /// The sender's commit count; the receiver sizes its reply filter off
    /// this.
    pub size: u64,
    /// Accuracy schedule position; see [`fpr_for_cycles`].
    pub cycles: u32,
    /// Sender's build version, for skew detection.
    pub build_version: String,
    /// Commits the sender believes the receiver is missing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<Commit>,
}

/// One element of a batch sync request: `{path, msg}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatchItem {
    pub path: String,
    pub msg: SyncMessage,
}

/// One element of a batch sync response: `{path, res}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatchReply {
    pub path: String,
    pub res: SyncMessage,
}

/// A batch request is an array of per-repository items.
pub type SyncBatchRequest = Vec<SyncBatchItem>;

/// A batch response is an array of per-repository replies.
pub type SyncBatchResponse = Vec<SyncBatchReply>;

/// Canonical request summary signed into the transport header: the path
/// set, a timestamp, and a nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub paths: Vec<String>,
    pub timestamp: i64,
    pub nonce: String,
}

impl RequestSummary {
    pub fn of(request: &SyncBatchRequest, timestamp: i64, nonce: String) -> Self {
        let mut paths: Vec<String> = request.iter().map(|item| item.path.clone()).collect();
        paths.sort();
        paths.dedup();
        RequestSummary {
            paths,
            timestamp,
            nonce,
        }
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        crate::hash::canonical_json_bytes(self).expect("summary serializes")
    }

    /// Sign this summary under the local session; the result travels as
    /// the request's signature header.
    pub fn sign(&self, pool: &crate::trust::TrustPool) -> crate::internal::commit::SignatureEnvelope {
        pool.sign(&self.canonical_bytes(), self.timestamp)
    }

    /// Verify a request's signature header against the claimed session.
    pub fn verify(
        &self,
        pool: &crate::trust::TrustPool,
        session_id: &str,
        envelope: &crate::internal::commit::SignatureEnvelope,
        now_ms: i64,
    ) -> Result<(), crate::errors::AuthError> {
        pool.verify(session_id, envelope, &self.canonical_bytes(), now_ms)
    }
}
