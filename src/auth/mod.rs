//! # Reconnection Authentication Module
//!
//! Produces and verifies the cryptographically authenticated artefacts
//! that bind a peer's identity to time and to a position in a monotone
//! sequence.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    VERIFICATION PIPELINE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  announcement ──► trust store ──► timestamp ──► sequence ──► nonce     │
//! │                   (pinned key?)   (±6 min)      (strictly    (unseen   │
//! │                                                  higher?)     ≤1 h?)   │
//! │                                        │                                │
//! │                                        ▼                                │
//! │                                   signature check                       │
//! │                                        │                                │
//! │                       valid ◄──────────┴──────────► invalid(reason)    │
//! │                         │                                               │
//! │                         └── record nonce, persist last sequence        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Negative outcomes are values ([`Verification::Invalid`]), not errors:
//! the caller drops the artefact and counts it. The one hard error is a
//! TOFU pin violation during identity exchange.
//!
//! The sequence check runs before the nonce check: a verbatim replay is
//! reported as `sequence_number_not_incremented`, and the nonce cache
//! only catches forgeries that bump the sequence while reusing a nonce.

mod announcement;
mod trust;

pub use announcement::{
    AnnounceReason, Announcement, ConnectionHint, IdentityExchange, RelayEnvelope, RelayPayload,
    RELAY_ENVELOPE_TYPE,
};
pub use trust::{PinOutcome, TrustStore, TrustedPeer};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, warn};

use crate::crypto::canonical::{fingerprint, sha256_canonical_hex, to_canonical_bytes};
use crate::crypto::{kdf, verify, PublicKey, Signature};
use crate::error::{Error, Result, VerifyFailure};
use crate::identity::IdentityManager;
use crate::storage::{keys, Kv};

use announcement::{IdentitySigningPayload, RelaySigningPayload};

/// Tunables for the authentication layer
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Acceptance window around `now` for announcement timestamps (ms):
    /// five minutes plus one minute of clock drift
    pub timestamp_window_ms: i64,
    /// How long a nonce stays in the replay cache (ms)
    pub nonce_ttl_ms: i64,
    /// LRU bound on the nonce cache
    pub nonce_capacity: usize,
    /// Maximum relay nesting depth
    pub relay_max_depth: usize,
    /// Maximum relay age (ms)
    pub relay_max_age_ms: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timestamp_window_ms: 6 * 60 * 1000,
            nonce_ttl_ms: 60 * 60 * 1000,
            nonce_capacity: 10_000,
            relay_max_depth: 3,
            relay_max_age_ms: 5 * 60 * 1000,
        }
    }
}

/// Outcome of a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The artefact is authentic and fresh
    Valid,
    /// The artefact was rejected for the tagged reason
    Invalid(VerifyFailure),
}

impl Verification {
    /// Whether the artefact verified
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid)
    }
}

/// Result of a successful identity exchange
#[derive(Debug)]
pub struct IdentityOutcome {
    /// The remote peer's id
    pub peer_id: String,
    /// The remote peer's display name
    pub display_name: String,
    /// The remote peer's public keys
    pub public_key: PublicKey,
    /// The derived per-peer shared secret
    pub shared_secret: [u8; 32],
    /// Whether the key was freshly pinned or already known
    pub pin: PinOutcome,
}

/// Optional fields merged into a fresh announcement
#[derive(Debug, Clone, Default)]
pub struct AnnouncementDraft {
    /// Live peers to advertise
    pub connected_peers: Vec<String>,
    /// Relay hints
    pub connection_hint: Option<ConnectionHint>,
    /// Diagnostic challenge (ip-change only)
    pub challenge: Option<String>,
}

/// Bounded nonce replay cache (insertion-ordered LRU with TTL)
struct NonceCache {
    entries: HashMap<String, i64>,
    order: VecDeque<String>,
}

impl NonceCache {
    fn new() -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new() }
    }

    fn contains(&self, nonce: &str, now_ms: i64, ttl_ms: i64) -> bool {
        self.entries
            .get(nonce)
            .map(|&seen| now_ms - seen <= ttl_ms)
            .unwrap_or(false)
    }

    fn insert(&mut self, nonce: String, now_ms: i64, ttl_ms: i64, capacity: usize) {
        // Drop expired entries from the front, then enforce the LRU cap.
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map(|&seen| now_ms - seen > ttl_ms)
                .unwrap_or(true);
            if expired || self.order.len() >= capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            } else {
                break;
            }
        }
        if self.entries.insert(nonce.clone(), now_ms).is_none() {
            self.order.push_back(nonce);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The authentication layer (M2)
pub struct ReconnectAuth {
    identity: Arc<IdentityManager>,
    trust: TrustStore,
    kv: Arc<dyn Kv>,
    config: AuthConfig,
    nonces: Mutex<NonceCache>,
    // Held across the persistence write so two in-flight verifications
    // cannot both accept the same sequence number.
    last_seqs: tokio::sync::Mutex<HashMap<String, u64>>,
    sessions: RwLock<HashMap<String, [u8; 32]>>,
}

impl ReconnectAuth {
    /// Load the authentication layer, restoring the sequence tracker
    pub async fn load(
        identity: Arc<IdentityManager>,
        trust: TrustStore,
        kv: Arc<dyn Kv>,
        config: AuthConfig,
    ) -> Result<Self> {
        let last_seqs = match kv.get(keys::SEQUENCE_TRACKER).await? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| Error::StorageCorrupted(format!("Sequence tracker: {}", e)))?,
            None => HashMap::new(),
        };
        Ok(Self {
            identity,
            trust,
            kv,
            config,
            nonces: Mutex::new(NonceCache::new()),
            last_seqs: tokio::sync::Mutex::new(last_seqs),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// The trust store
    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    // ------------------------------------------------------------------
    // Identity exchange
    // ------------------------------------------------------------------

    /// Build the signed identity message sent first on a fresh channel
    pub fn identity_exchange_message(&self) -> Result<IdentityExchange> {
        let identity = self.identity.identity();
        let public = identity.public_keys();
        let sign_pubkey = hex::encode(&public.signing);
        let dh_pubkey = hex::encode(&public.ecdh);
        let timestamp = crate::time::now_timestamp_millis();

        let payload = IdentitySigningPayload {
            peer_id: identity.peer_id(),
            sign_pubkey: &sign_pubkey,
            dh_pubkey: &dh_pubkey,
            timestamp,
        };
        let signature = identity.sign(&to_canonical_bytes(&payload)?);

        Ok(IdentityExchange {
            peer_id: identity.peer_id().to_string(),
            display_name: identity.display_name().to_string(),
            sign_pubkey,
            dh_pubkey,
            algorithm: identity.algorithm(),
            timestamp,
            signature: signature.to_base64(),
        })
    }

    /// Verify a received identity exchange and pin the key
    ///
    /// On a TOFU conflict this returns [`Error::KeyMismatch`] without
    /// mutating any state; the orchestrator surfaces it to the operator.
    pub async fn handle_identity_exchange(&self, msg: &IdentityExchange) -> Result<IdentityOutcome> {
        let sign_pubkey = hex::decode(&msg.sign_pubkey)
            .map_err(|e| Error::InvalidKey(format!("sign_pubkey hex: {}", e)))?;
        let dh_pubkey = hex::decode(&msg.dh_pubkey)
            .map_err(|e| Error::InvalidKey(format!("dh_pubkey hex: {}", e)))?;

        let payload = IdentitySigningPayload {
            peer_id: &msg.peer_id,
            sign_pubkey: &msg.sign_pubkey,
            dh_pubkey: &msg.dh_pubkey,
            timestamp: msg.timestamp,
        };
        let signature = Signature::from_base64(&msg.signature)?;
        verify(msg.algorithm, &sign_pubkey, &to_canonical_bytes(&payload)?, &signature)
            .map_err(|_| Error::Verification(VerifyFailure::InvalidSignature))?;

        let pin = self.trust.pin(&msg.peer_id, &sign_pubkey, msg.algorithm).await?;

        let raw = self
            .identity
            .identity()
            .keypair()
            .ecdh
            .diffie_hellman(&dh_pubkey)?;
        let shared = kdf::derive_shared_key(&raw, self.identity.peer_id(), &msg.peer_id)?;
        let shared_secret: [u8; 32] = *shared.as_bytes();
        self.sessions
            .write()
            .insert(msg.peer_id.clone(), shared_secret);

        debug!(peer_id = %msg.peer_id, ?pin, "Identity exchange verified");
        Ok(IdentityOutcome {
            peer_id: msg.peer_id.clone(),
            display_name: msg.display_name.clone(),
            public_key: PublicKey::new(sign_pubkey, dh_pubkey, msg.algorithm),
            shared_secret,
            pin,
        })
    }

    /// The derived session secret for a peer, if an exchange happened
    pub fn session_secret(&self, peer_id: &str) -> Option<[u8; 32]> {
        self.sessions.read().get(peer_id).copied()
    }

    // ------------------------------------------------------------------
    // Announcements
    // ------------------------------------------------------------------

    /// Build and sign a fresh announcement
    ///
    /// Increments and persists the outbound sequence counter first, so a
    /// crash after emission can never reuse the number.
    pub async fn create_announcement(
        &self,
        reason: AnnounceReason,
        draft: AnnouncementDraft,
    ) -> Result<Announcement> {
        use base64::Engine;

        let sequence_num = self.identity.next_sequence().await?;
        let mut nonce_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let mut announcement = Announcement {
            peer_id: self.identity.peer_id().to_string(),
            display_name: self.identity.display_name().to_string(),
            timestamp: crate::time::now_timestamp_millis(),
            nonce: base64::engine::general_purpose::STANDARD.encode(nonce_bytes),
            sequence_num,
            reason,
            connected_peers: draft.connected_peers,
            connection_hint: draft.connection_hint,
            challenge: draft.challenge,
            signature: None,
            algorithm: None,
        };

        let bytes = to_canonical_bytes(&announcement.signing_payload())?;
        let signature = self.identity.identity().sign(&bytes);
        announcement.signature = Some(signature.to_base64());
        announcement.algorithm = Some(self.identity.identity().algorithm());
        Ok(announcement)
    }

    /// Verify an announcement against the trust store, clock, sequence
    /// tracker, nonce cache, and pinned key, in that order
    pub async fn verify_announcement(&self, announcement: &Announcement) -> Result<Verification> {
        let Some(trusted) = self.trust.get(&announcement.peer_id) else {
            return Ok(Verification::Invalid(VerifyFailure::UnknownPeer));
        };

        let now = crate::time::now_timestamp_millis();
        if (now - announcement.timestamp).abs() > self.config.timestamp_window_ms {
            return Ok(Verification::Invalid(VerifyFailure::TimestampOutOfRange));
        }

        let mut last_seqs = self.last_seqs.lock().await;
        if let Some(&last) = last_seqs.get(&announcement.peer_id) {
            if announcement.sequence_num <= last {
                return Ok(Verification::Invalid(VerifyFailure::SequenceNotIncremented));
            }
        }

        if self
            .nonces
            .lock()
            .contains(&announcement.nonce, now, self.config.nonce_ttl_ms)
        {
            return Ok(Verification::Invalid(VerifyFailure::NonceReused));
        }

        let (Some(signature), Some(algorithm)) =
            (&announcement.signature, announcement.algorithm)
        else {
            return Ok(Verification::Invalid(VerifyFailure::InvalidSignature));
        };
        if algorithm != trusted.algorithm {
            return Ok(Verification::Invalid(VerifyFailure::InvalidSignature));
        }
        let Ok(signature) = Signature::from_base64(signature) else {
            return Ok(Verification::Invalid(VerifyFailure::InvalidSignature));
        };
        let bytes = to_canonical_bytes(&announcement.signing_payload())?;
        if verify(algorithm, &trusted.signing_public_key, &bytes, &signature).is_err() {
            return Ok(Verification::Invalid(VerifyFailure::InvalidSignature));
        }

        // Accepted: record the nonce and durably advance the sequence.
        self.nonces.lock().insert(
            announcement.nonce.clone(),
            now,
            self.config.nonce_ttl_ms,
            self.config.nonce_capacity,
        );
        last_seqs.insert(announcement.peer_id.clone(), announcement.sequence_num);
        let bytes = bincode::serialize(&*last_seqs)?;
        if let Err(e) = self.kv.put(keys::SEQUENCE_TRACKER, bytes).await {
            // Non-fatal: the in-memory tracker still guards this session.
            warn!("Failed to persist sequence tracker: {}", e);
        }
        Ok(Verification::Valid)
    }

    // ------------------------------------------------------------------
    // Relay envelopes
    // ------------------------------------------------------------------

    /// Wrap a payload in a counter-signed relay envelope
    pub fn create_relay(&self, payload: RelayPayload) -> Result<RelayEnvelope> {
        let relay_timestamp = crate::time::now_timestamp_millis();
        let original_hash = sha256_canonical_hex(&payload)?;
        let signing = RelaySigningPayload {
            envelope_type: RELAY_ENVELOPE_TYPE,
            relayed_by: self.identity.peer_id(),
            relay_timestamp,
            original_hash: &original_hash,
        };
        let signature = self.identity.identity().sign(&to_canonical_bytes(&signing)?);

        Ok(RelayEnvelope {
            envelope_type: RELAY_ENVELOPE_TYPE.to_string(),
            relayed_by: self.identity.peer_id().to_string(),
            relay_timestamp,
            original_hash,
            relay_signature: signature.to_base64(),
            original: payload,
        })
    }

    /// Verify a relay chain and the announcement at its core
    pub async fn verify_relay(&self, envelope: &RelayEnvelope) -> Result<Verification> {
        self.verify_relay_at(envelope, 0).await
    }

    async fn verify_relay_at(&self, envelope: &RelayEnvelope, depth: usize) -> Result<Verification> {
        if depth >= self.config.relay_max_depth {
            return Ok(Verification::Invalid(VerifyFailure::RelayChainTooLong));
        }

        let Some(relayer) = self.trust.get(&envelope.relayed_by) else {
            return Ok(Verification::Invalid(VerifyFailure::UntrustedRelay));
        };

        let signing = RelaySigningPayload {
            envelope_type: RELAY_ENVELOPE_TYPE,
            relayed_by: &envelope.relayed_by,
            relay_timestamp: envelope.relay_timestamp,
            original_hash: &envelope.original_hash,
        };
        let Ok(signature) = Signature::from_base64(&envelope.relay_signature) else {
            return Ok(Verification::Invalid(VerifyFailure::InvalidRelaySignature));
        };
        let bytes = to_canonical_bytes(&signing)?;
        if verify(relayer.algorithm, &relayer.signing_public_key, &bytes, &signature).is_err() {
            return Ok(Verification::Invalid(VerifyFailure::InvalidRelaySignature));
        }

        // The signature only covers the hash; the hash must cover the payload.
        if sha256_canonical_hex(&envelope.original)? != envelope.original_hash {
            return Ok(Verification::Invalid(VerifyFailure::InvalidRelaySignature));
        }

        let now = crate::time::now_timestamp_millis();
        if now - envelope.relay_timestamp > self.config.relay_max_age_ms {
            return Ok(Verification::Invalid(VerifyFailure::RelayTooOld));
        }
        if envelope.relay_timestamp < envelope.original.timestamp() {
            return Ok(Verification::Invalid(VerifyFailure::RelayBeforeOriginal));
        }

        match &envelope.original {
            RelayPayload::Relay(inner) => Box::pin(self.verify_relay_at(inner, depth + 1)).await,
            RelayPayload::Announcement(announcement) => self.verify_announcement(announcement).await,
        }
    }

    // ------------------------------------------------------------------
    // Fingerprints
    // ------------------------------------------------------------------

    /// This node's key fingerprint for out-of-band comparison
    pub fn own_fingerprint(&self) -> Result<String> {
        fingerprint(&self.identity.identity().public_keys())
    }

    /// A pinned peer's key fingerprint
    pub fn peer_fingerprint(&self, peer_id: &str) -> Option<String> {
        let trusted = self.trust.get(peer_id)?;
        fingerprint(&serde_json::json!({
            "algorithm": trusted.algorithm.as_str(),
            "signing_public_key": hex::encode(&trusted.signing_public_key),
        }))
        .ok()
    }

    #[cfg(test)]
    fn nonce_count(&self) -> usize {
        self.nonces.lock().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
