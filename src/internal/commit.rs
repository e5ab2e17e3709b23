//! The commit record.
//!
//! A commit is an immutable, signed description of a new value for one key:
//! content-addressed id, key, signing session, timestamp, build version,
//! 0–2 parent ids, and contents that are either a full snapshot or a delta
//! against a base parent. The id is the SHA-256 of the canonical JSON
//! payload: every field except `id`, `sig`, and the local `age`, which is
//! assigned on first local observation and never transmitted.
//!
//! The serde renames below are the on-disk and wire field names: one commit
//! per log line as `{id, k, s, ts, bv, p, c, sig}`.

use serde::{Deserialize, Serialize};

use crate::hash::{CommitId, ContentHash, canonicalize_json};
use crate::internal::item::{ChangeSet, ItemSnapshot};

/// Snapshot or delta payload of a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommitContents {
    /// Full document snapshot.
    #[serde(rename = "d")]
    Snapshot(ItemSnapshot),
    /// Change set against the materialized value at `base`, which must be
    /// one of the commit's parents.
    #[serde(rename = "delta")]
    Delta { base: CommitId, ops: ChangeSet },
}

/// Signature envelope bound to the canonical commit payload. The session id
/// lives on the commit itself (`s`); the envelope carries the signature
/// bytes plus the timestamp and nonce that were mixed into the signed
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    /// Base64 Ed25519 signature bytes.
    #[serde(rename = "sig")]
    pub signature: String,
    #[serde(rename = "ts")]
    pub timestamp: i64,
    /// Base64 random nonce.
    #[serde(rename = "n")]
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "s")]
    pub session: String,
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(rename = "bv")]
    pub build_version: String,
    #[serde(rename = "p")]
    pub parents: Vec<CommitId>,
    #[serde(rename = "c")]
    pub contents: CommitContents,
    #[serde(
        rename = "sig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub signature: Option<SignatureEnvelope>,
    /// Local insertion age; assigned by the graph, never serialized.
    #[serde(skip)]
    pub age: Option<u64>,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Commit {}

impl Commit {
    /// Build a commit, computing its content-addressed id. The result is
    /// unsigned; the trust pool attaches the envelope.
    pub fn new(
        key: impl Into<String>,
        session: impl Into<String>,
        timestamp: i64,
        build_version: impl Into<String>,
        parents: Vec<CommitId>,
        contents: CommitContents,
    ) -> Commit {
        let mut commit = Commit {
            id: ContentHash::new([0u8; 32]),
            key: key.into(),
            session: session.into(),
            timestamp,
            build_version: build_version.into(),
            parents,
            contents,
            signature: None,
            age: None,
        };
        commit.id = commit.compute_id();
        commit
    }

    /// Canonical JSON payload: every field except `id`, `sig`, and `age`.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let mut payload = serde_json::json!({
            "k": self.key,
            "s": self.session,
            "ts": self.timestamp,
            "bv": self.build_version,
            "p": self.parents,
            "c": self.contents,
        });
        canonicalize_json(&mut payload);
        serde_json::to_vec(&payload).expect("commit payload serializes")
    }

    /// Hash of the canonical payload.
    pub fn compute_id(&self) -> CommitId {
        ContentHash::compute(&self.payload_bytes())
    }

    /// Id integrity: `id == hash(canonical(commit \ {id, sig, age}))`.
    pub fn verify_id(&self) -> bool {
        self.compute_id() == self.id
    }

    /// Merge commits have two parents.
    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }

    /// The ordering key used everywhere a tie must break: timestamp
    /// ascending, then commit id ascending.
    pub fn tie_break_key(&self) -> (i64, CommitId) {
        (self.timestamp, self.id)
    }
}
