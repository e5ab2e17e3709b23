//! Configuration: repository options, build identity, the shared context
//! threaded through every repository operation, and the local settings
//! store that persists the peer's session key material.

use std::path::PathBuf;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};

use crate::errors::{AuthError, StorageError};
use crate::internal::schema::SchemaRegistry;
use crate::trust::{LocalIdentity, Session, TrustPool};

/// Build identity carried in sync messages for skew detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    pub protocol_version: u32,
}

impl Default for BuildInfo {
    fn default() -> Self {
        BuildInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoOptions {
    /// Byte cap on a single sync round's commit payload.
    pub sync_payload_byte_cap: usize,
    /// Bound on the log worker's inbound append queue.
    pub log_queue_depth: usize,
    /// Records per replay scan batch.
    pub scan_batch: usize,
    /// Cycle counter a repository idles at between local writes.
    pub default_cycles: u32,
}

impl Default for RepoOptions {
    fn default() -> Self {
        Self {
            sync_payload_byte_cap: 4 * 1024 * 1024,
            log_queue_depth: 64,
            scan_batch: 256,
            default_cycles: 3,
        }
    }
}

/// Shared context passed into every repository operation: the schema
/// registry, the trust pool, and the build identity. Registrations happen
/// at init and are fenced before any repository opens.
#[derive(Clone)]
pub struct Context {
    pub schemas: Arc<SchemaRegistry>,
    pub trust: Arc<TrustPool>,
    pub build: BuildInfo,
}

impl Context {
    pub fn new(schemas: Arc<SchemaRegistry>, trust: Arc<TrustPool>) -> Self {
        Context {
            schemas,
            trust,
            build: BuildInfo::default(),
        }
    }
}

/// Persisted peer identity: `{session_id, private_key, public_key,
/// expiration}`. Private key bytes are PKCS#8, base64; they never travel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsDoc {
    pub session_id: String,
    pub private_key: String,
    pub public_key: String,
    pub expiration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Local settings file with atomic rewrite.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SettingsStore { path: path.into() }
    }

    pub fn load(&self) -> Result<Option<SettingsDoc>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::io(&self.path, std::io::Error::other(e)))?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    pub fn save(&self, doc: &SettingsDoc) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io(&self.path, e))?;
            }
        }
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| StorageError::io(&self.path, std::io::Error::other(e)))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }

    /// Load the stored identity, or generate and persist a fresh one.
    pub fn load_or_generate(
        &self,
        owner: Option<String>,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<LocalIdentity, StorageError> {
        if let Some(doc) = self.load()? {
            if doc.expiration > now_ms {
                let pkcs8 = B64
                    .decode(&doc.private_key)
                    .map_err(|e| StorageError::io(&self.path, std::io::Error::other(e)))?;
                let public_key = B64
                    .decode(&doc.public_key)
                    .map_err(|e| StorageError::io(&self.path, std::io::Error::other(e)))?;
                let session = Session {
                    id: doc.session_id,
                    owner: doc.owner,
                    expiration: doc.expiration,
                    public_key,
                };
                return LocalIdentity::from_pkcs8(session, pkcs8)
                    .map_err(|e| StorageError::io(&self.path, auth_io(e)));
            }
            tracing::warn!("stored session expired; generating a fresh identity");
        }
        let identity = LocalIdentity::generate(owner, ttl_ms, now_ms)
            .map_err(|e| StorageError::io(&self.path, auth_io(e)))?;
        self.save(&SettingsDoc {
            session_id: identity.session().id.clone(),
            private_key: B64.encode(identity.pkcs8()),
            public_key: B64.encode(&identity.session().public_key),
            expiration: identity.session().expiration,
            owner: identity.session().owner.clone(),
        })?;
        Ok(identity)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

fn auth_io(e: AuthError) -> std::io::Error {
    std::io::Error::other(e)
}
