//! Error types for the GoatDB core.
//!
//! This module defines the per-domain error enumerations used across storage,
//! schema validation, graph maintenance, synchronization, authentication and
//! queries, plus the top-level [`DbError`] that unifies them. It integrates
//! with `thiserror` to provide rich `Display` implementations and error
//! source chaining where applicable.
//!
//! Notes:
//! - Merge fallback is not an error: a merge that had to tie-break a field
//!   still succeeds and reports the fallback as a diagnostic on the result.
//! - `GraphError::UnknownParent` is recoverable; the repository records a
//!   shallow edge and requests the parent in the next sync round.

use std::path::PathBuf;

use thiserror::Error;

/// Failures from the append-only record log and the settings store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file, tagged with its path.
    #[error("io failure on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A complete record in the middle of the log failed to decode. The scan
    /// stops here; the caller may truncate at `offset` with explicit intent.
    #[error("corrupt record in `{path}` at byte {offset}")]
    Corruption { path: PathBuf, offset: u64 },

    /// The trailing record is incomplete (torn write). Discarded on scan.
    #[error("partial trailing record in `{path}` at byte {offset}")]
    PartialTail { path: PathBuf, offset: u64 },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Schema registration and type-checking failures. Never silently coerces.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// No schema registered under `(namespace, version)`.
    #[error("unknown schema `{namespace}` version {version}")]
    Unknown { namespace: String, version: u32 },

    /// A schema with the same `(namespace, version)` but different fields
    /// was already registered.
    #[error("conflicting definition for schema `{namespace}` version {version}")]
    VersionConflict { namespace: String, version: u32 },

    /// A value does not match the declared field type.
    #[error("field `{field}` expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// A required field is missing and the schema declares no default.
    #[error("required field `{0}` is missing and has no default")]
    MissingField(String),
}

/// Commit graph insertion and traversal failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Inserting the commit would close a cycle. Fatal for that commit.
    #[error("commit {0} would introduce a cycle")]
    Cycle(String),

    /// A parent id is not present locally. Recorded as a shallow edge.
    #[error("unknown parent commit {0}")]
    UnknownParent(String),
}

/// Scheduler-level sync failures; all of them trigger backoff.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport could not deliver or receive a batch.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A received message failed to decode.
    #[error("sync decode failure: {0}")]
    Decode(#[from] serde_json::Error),

    /// The peer speaks an incompatible protocol version.
    #[error("protocol version skew: local {local}, remote {remote}")]
    VersionSkew { local: u32, remote: u32 },
}

/// Signature and session failures. A commit or request carrying one of these
/// is rejected without touching repository state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The signature does not verify against the session's public key.
    #[error("signature verification failed")]
    BadSignature,

    /// The signing session has expired.
    #[error("session {0} has expired")]
    ExpiredSession(String),

    /// The session id resolves to no known public key.
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The commit carries no signature at all.
    #[error("commit is unsigned")]
    Unsigned,
}

/// Query engine failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The query was cancelled cooperatively. Expected, not a defect.
    #[error("query cancelled")]
    Cancelled,

    /// A persisted result cache failed validation and must be rebuilt.
    #[error("query cache invalid: {0}")]
    CacheInvalid(String),
}

/// Unified error for the GoatDB core library.
///
/// Wraps the per-domain enumerations so `?` works across module boundaries,
/// plus the repository lifecycle rejection.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Query(#[from] QueryError),

    /// Writes are rejected while the repository is loading or closing.
    #[error("repository is {0} and cannot accept this operation")]
    RepoState(&'static str),
}
