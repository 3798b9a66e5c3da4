//! # Identity Module
//!
//! The node identity: who this process is on the mesh.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         NODE IDENTITY                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  peer_id          opaque 128-bit hex string, fixed for the node's life │
//! │  display_name     human-readable, shown to other participants          │
//! │  signing keys     Ed25519, signs announcements and exchanges           │
//! │  ECDH keys        P-256, derives per-peer shared secrets               │
//! │  sequence counter monotone u64, persisted after every increment        │
//! │                                                                         │
//! │  Created on first run; reloaded on every later start. The key blob is  │
//! │  sealed with AES-256-GCM under the storage master key before it        │
//! │  touches the KV store. The sequence counter lives in its own key so    │
//! │  bumping it does not re-encrypt the identity.                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The persisted counter is what makes replayed announcements detectable
//! across restarts: a replay carries a sequence number at or below the one
//! the verifier last accepted.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crypto::{
    open_blob, seal_blob, sign, EncryptionKey, KeyPair, PublicKey, Signature, SignatureAlgorithm,
};
use crate::error::{Error, Result};
use crate::storage::{keys, Kv};

/// Immutable per-process identity
pub struct NodeIdentity {
    /// Opaque unique id (32 hex chars, 128 bits of entropy)
    peer_id: String,
    /// Human-readable name
    display_name: String,
    /// Signing + key-agreement key material
    keypair: KeyPair,
    /// Creation timestamp (seconds)
    created_at: i64,
}

/// Serialized form of the identity, sealed before storage
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    peer_id: String,
    display_name: String,
    signing_secret: [u8; 32],
    ecdh_secret: Vec<u8>,
    created_at: i64,
}

impl NodeIdentity {
    /// Generate a fresh identity
    fn generate(display_name: String) -> Self {
        use rand::RngCore;
        let mut id_bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut id_bytes);

        Self {
            peer_id: hex::encode(id_bytes),
            display_name,
            keypair: KeyPair::generate(),
            created_at: crate::time::now_timestamp(),
        }
    }

    /// The node's peer id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// The node's display name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// When this identity was created (seconds)
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// The key material
    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    /// The shareable public halves
    pub fn public_keys(&self) -> PublicKey {
        self.keypair.public_keys()
    }

    /// The algorithm local signatures are produced with
    pub fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    /// Sign bytes with the node's signing key
    pub fn sign(&self, message: &[u8]) -> Signature {
        sign(&self.keypair.signing, message)
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Loads, persists, and hands out the node identity
///
/// Also the single owner of the outbound sequence counter: the counter is
/// persisted after every increment so a restart can never reuse a value.
pub struct IdentityManager {
    kv: Arc<dyn Kv>,
    storage_key: EncryptionKey,
    identity: NodeIdentity,
    sequence: Mutex<u64>,
}

impl IdentityManager {
    /// Load the identity from the KV store, creating one on first run
    pub async fn load_or_create(
        kv: Arc<dyn Kv>,
        storage_key: EncryptionKey,
        display_name: &str,
    ) -> Result<Self> {
        let identity = match kv.get(keys::IDENTITY).await? {
            Some(blob) => {
                let plain = open_blob(&storage_key, &blob, keys::IDENTITY.as_bytes())?;
                let stored: StoredIdentity = bincode::deserialize(&plain)
                    .map_err(|e| Error::StorageCorrupted(format!("Identity blob: {}", e)))?;
                let keypair =
                    KeyPair::from_secret_bytes(&stored.signing_secret, &stored.ecdh_secret)?;
                tracing::info!(peer_id = %stored.peer_id, "Loaded existing identity");
                NodeIdentity {
                    peer_id: stored.peer_id,
                    display_name: stored.display_name,
                    keypair,
                    created_at: stored.created_at,
                }
            }
            None => {
                let identity = NodeIdentity::generate(display_name.to_string());
                let stored = StoredIdentity {
                    peer_id: identity.peer_id.clone(),
                    display_name: identity.display_name.clone(),
                    signing_secret: identity.keypair.signing.secret_bytes(),
                    ecdh_secret: identity.keypair.ecdh.secret_bytes().to_vec(),
                    created_at: identity.created_at,
                };
                let plain = bincode::serialize(&stored)?;
                let blob = seal_blob(&storage_key, &plain, keys::IDENTITY.as_bytes())?;
                kv.put(keys::IDENTITY, blob).await?;
                tracing::info!(peer_id = %identity.peer_id, "Created new identity");
                identity
            }
        };

        let sequence = match kv.get(keys::IDENTITY_SEQUENCE).await? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| Error::StorageCorrupted("Sequence counter".into()))?;
                u64::from_le_bytes(arr)
            }
            None => 0,
        };

        Ok(Self { kv, storage_key, identity, sequence: Mutex::new(sequence) })
    }

    /// The identity itself
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// The node's peer id
    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    /// The node's display name
    pub fn display_name(&self) -> &str {
        self.identity.display_name()
    }

    /// The last issued sequence number
    pub async fn current_sequence(&self) -> u64 {
        *self.sequence.lock().await
    }

    /// Increment the sequence counter and persist it
    ///
    /// The lock is held across the KV write so two in-flight calls can
    /// never hand out the same value. If the write fails the counter
    /// stays unchanged and a later retry cannot go backwards.
    pub async fn next_sequence(&self) -> Result<u64> {
        let mut guard = self.sequence.lock().await;
        let next = *guard + 1;
        self.kv
            .put(keys::IDENTITY_SEQUENCE, next.to_le_bytes().to_vec())
            .await?;
        *guard = next;
        Ok(next)
    }

    /// Persist an updated display name (key material is unchanged)
    pub async fn set_display_name(&mut self, name: String) -> Result<()> {
        self.identity.display_name = name;
        let stored = StoredIdentity {
            peer_id: self.identity.peer_id.clone(),
            display_name: self.identity.display_name.clone(),
            signing_secret: self.identity.keypair.signing.secret_bytes(),
            ecdh_secret: self.identity.keypair.ecdh.secret_bytes().to_vec(),
            created_at: self.identity.created_at,
        };
        let plain = bincode::serialize(&stored)?;
        let blob = seal_blob(&self.storage_key, &plain, keys::IDENTITY.as_bytes())?;
        self.kv.put(keys::IDENTITY, blob).await?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
