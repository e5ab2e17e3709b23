//! Sessions, commit signing, and verification.
//!
//! A session is an Ed25519 key pair plus an id and expiration; the public
//! half is shared, the private half never leaves the trust pool. Commits
//! are signed over their canonical payload mixed with the envelope's
//! timestamp and nonce. Synthetic merge commits are the one exception:
//! they are unsigned by construction (every peer must reproduce them
//! byte-identically) and their integrity rides on the content address.
//! Root sessions may additionally mint short-lived login tokens for the
//! out-of-scope HTTP surface.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use dashmap::DashMap;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{ED25519, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use serde::{Deserialize, Serialize};

use crate::errors::AuthError;
use crate::internal::commit::{Commit, SignatureEnvelope};

/// Owner name whose sessions may sign login tokens.
pub const ROOT_OWNER: &str = "root";

/// Milliseconds since the Unix epoch, the trust pool's clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The shared (public) half of a session identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Expiration, ms since epoch.
    pub expiration: i64,
    /// Raw Ed25519 public key bytes.
    pub public_key: Vec<u8>,
}

impl Session {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration <= now_ms
    }

    pub fn is_root(&self) -> bool {
        self.owner.as_deref() == Some(ROOT_OWNER)
    }
}

/// A session together with its private key material.
pub struct LocalIdentity {
    session: Session,
    pkcs8: Vec<u8>,
    key_pair: Ed25519KeyPair,
}

impl LocalIdentity {
    /// Generate a fresh identity valid for `ttl_ms` from `now_ms`.
    pub fn generate(
        owner: Option<String>,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<Self, AuthError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| AuthError::BadSignature)?;
        let key_pair =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| AuthError::BadSignature)?;
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            expiration: now_ms + ttl_ms,
            public_key: key_pair.public_key().as_ref().to_vec(),
        };
        Ok(LocalIdentity {
            session,
            pkcs8: pkcs8.as_ref().to_vec(),
            key_pair,
        })
    }

    /// Rehydrate an identity from persisted settings.
    pub fn from_pkcs8(session: Session, pkcs8: Vec<u8>) -> Result<Self, AuthError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(&pkcs8).map_err(|_| AuthError::BadSignature)?;
        Ok(LocalIdentity {
            session,
            pkcs8,
            key_pair,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// PKCS#8 private key bytes, for the local settings store only.
    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }
}

/// Root-signed short-lived login token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginToken {
    pub session_id: String,
    pub expiration: i64,
    /// Base64 signature by a root session.
    pub signature: String,
}

/// Shared, read-mostly pool of known sessions plus the local signing
/// identity.
pub struct TrustPool {
    local: LocalIdentity,
    sessions: DashMap<String, Session>,
    rng: SystemRandom,
}

impl TrustPool {
    pub fn new(local: LocalIdentity) -> Self {
        let sessions = DashMap::new();
        sessions.insert(local.session.id.clone(), local.session.clone());
        TrustPool {
            local,
            sessions,
            rng: SystemRandom::new(),
        }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    /// Learn a peer session's public half. Re-registration with identical
    /// data is a no-op.
    pub fn register_session(&self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    fn nonce(&self) -> String {
        let mut bytes = [0u8; 16];
        self.rng.fill(&mut bytes).expect("system rng");
        B64.encode(bytes)
    }

    /// Sign a canonical payload under the local session.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> SignatureEnvelope {
        let nonce = self.nonce();
        let message = signed_message(payload, timestamp, &nonce);
        let signature = self.local.key_pair.sign(&message);
        SignatureEnvelope {
            signature: B64.encode(signature.as_ref()),
            timestamp,
            nonce,
        }
    }

    /// Attach a signature to a commit authored by the local session.
    pub fn sign_commit(&self, commit: &mut Commit) {
        let envelope = self.sign(&commit.payload_bytes(), commit.timestamp);
        commit.signature = Some(envelope);
    }

    /// Verify an envelope against a payload and the signing session.
    pub fn verify(
        &self,
        session_id: &str,
        envelope: &SignatureEnvelope,
        payload: &[u8],
        now_ms: i64,
    ) -> Result<(), AuthError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| AuthError::UnknownSession(session_id.to_string()))?;
        if session.is_expired(now_ms) {
            return Err(AuthError::ExpiredSession(session_id.to_string()));
        }
        let signature = B64
            .decode(&envelope.signature)
            .map_err(|_| AuthError::BadSignature)?;
        let message = signed_message(payload, envelope.timestamp, &envelope.nonce);
        UnparsedPublicKey::new(&ED25519, &session.public_key)
            .verify(&message, &signature)
            .map_err(|_| AuthError::BadSignature)
    }

    /// Admission check for a commit arriving at `persist_commits`.
    ///
    /// Signed commits must verify under a known, unexpired session.
    /// Synthetic merge commits carry no signature and are admitted when
    /// their content address verifies, since both merging peers reproduce the
    /// identical commit, so a forged variant changes the id.
    pub fn verify_commit(&self, commit: &Commit, now_ms: i64) -> Result<(), AuthError> {
        if !commit.verify_id() {
            return Err(AuthError::BadSignature);
        }
        match &commit.signature {
            Some(envelope) => self.verify(
                &commit.session,
                envelope,
                &commit.payload_bytes(),
                now_ms,
            ),
            None if commit.is_merge() => Ok(()),
            None => Err(AuthError::Unsigned),
        }
    }

    /// Mint a login token. Only root sessions may sign these.
    pub fn issue_login_token(
        &self,
        for_session: &str,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Result<LoginToken, AuthError> {
        if !self.local.session.is_root() {
            return Err(AuthError::UnknownSession(
                "login tokens require a root session".to_string(),
            ));
        }
        let expiration = now_ms + ttl_ms;
        let message = token_message(for_session, expiration);
        let signature = self.local.key_pair.sign(&message);
        Ok(LoginToken {
            session_id: for_session.to_string(),
            expiration,
            signature: B64.encode(signature.as_ref()),
        })
    }

    /// Verify a login token against any known root session.
    pub fn verify_login_token(&self, token: &LoginToken, now_ms: i64) -> Result<(), AuthError> {
        if token.expiration <= now_ms {
            return Err(AuthError::ExpiredSession(token.session_id.clone()));
        }
        let signature = B64
            .decode(&token.signature)
            .map_err(|_| AuthError::BadSignature)?;
        let message = token_message(&token.session_id, token.expiration);
        let verified = self.sessions.iter().any(|entry| {
            entry.is_root()
                && !entry.is_expired(now_ms)
                && UnparsedPublicKey::new(&ED25519, &entry.public_key)
                    .verify(&message, &signature)
                    .is_ok()
        });
        if verified {
            Ok(())
        } else {
            Err(AuthError::BadSignature)
        }
    }
}

fn signed_message(payload: &[u8], timestamp: i64, nonce: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload.len() + 8 + nonce.len());
    message.extend_from_slice(payload);
    message.extend_from_slice(&timestamp.to_le_bytes());
    message.extend_from_slice(nonce.as_bytes());
    message
}

fn token_message(session_id: &str, expiration: i64) -> Vec<u8> {
    let mut message = Vec::new();
    message.extend_from_slice(b"goatdb-login-token");
    message.extend_from_slice(session_id.as_bytes());
    message.extend_from_slice(&expiration.to_le_bytes());
    message
}
