//! Trust-on-first-use key store.
//!
//! The first identity exchange with a peer pins its signing key and
//! algorithm. From then on, a different key under the same peer id is a
//! hard security error, never a silent update. The pinned map is sealed
//! under the storage master key at rest.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{open_blob, seal_blob, EncryptionKey, SignatureAlgorithm};
use crate::error::{Error, Result};
use crate::storage::{keys, Kv};

/// A pinned peer key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// The peer's id
    pub peer_id: String,
    /// The pinned signing public key
    pub signing_public_key: Vec<u8>,
    /// Algorithm the key belongs to
    pub algorithm: SignatureAlgorithm,
    /// When the key was pinned (ms)
    pub first_seen: i64,
    /// Last time an artefact verified under this key (ms)
    pub last_seen: i64,
}

/// Outcome of [`TrustStore::pin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// First sighting; the key is now pinned
    Pinned,
    /// Key matches the existing pin
    AlreadyTrusted,
}

/// The TOFU store (single owner of `tether.auth.trusted`)
pub struct TrustStore {
    kv: Arc<dyn Kv>,
    storage_key: EncryptionKey,
    peers: RwLock<HashMap<String, TrustedPeer>>,
}

impl TrustStore {
    /// Load the pinned map from storage
    pub async fn load(kv: Arc<dyn Kv>, storage_key: EncryptionKey) -> Result<Self> {
        let peers = match kv.get(keys::TRUST_STORE).await? {
            Some(blob) => {
                let plain = open_blob(&storage_key, &blob, keys::TRUST_STORE.as_bytes())?;
                bincode::deserialize(&plain)
                    .map_err(|e| Error::StorageCorrupted(format!("Trust store: {}", e)))?
            }
            None => HashMap::new(),
        };
        Ok(Self { kv, storage_key, peers: RwLock::new(peers) })
    }

    /// Pin a key, or confirm it matches the existing pin
    ///
    /// A mismatch returns [`Error::KeyMismatch`] and mutates nothing; the
    /// caller surfaces it to the operator.
    pub async fn pin(
        &self,
        peer_id: &str,
        signing_public_key: &[u8],
        algorithm: SignatureAlgorithm,
    ) -> Result<PinOutcome> {
        let now = crate::time::now_timestamp_millis();
        let outcome = {
            let mut peers = self.peers.write();
            match peers.get_mut(peer_id) {
                Some(existing) => {
                    if existing.signing_public_key != signing_public_key
                        || existing.algorithm != algorithm
                    {
                        warn!(peer_id, "TOFU violation: presented key differs from pin");
                        return Err(Error::KeyMismatch { peer_id: peer_id.to_string() });
                    }
                    existing.last_seen = now;
                    PinOutcome::AlreadyTrusted
                }
                None => {
                    peers.insert(
                        peer_id.to_string(),
                        TrustedPeer {
                            peer_id: peer_id.to_string(),
                            signing_public_key: signing_public_key.to_vec(),
                            algorithm,
                            first_seen: now,
                            last_seen: now,
                        },
                    );
                    info!(peer_id, algorithm = %algorithm, "Pinned new peer key");
                    PinOutcome::Pinned
                }
            }
        };
        self.persist().await?;
        Ok(outcome)
    }

    /// The pinned entry for a peer
    pub fn get(&self, peer_id: &str) -> Option<TrustedPeer> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Whether a peer is pinned
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Number of pinned peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are pinned
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Remove a pin (explicit operator action, e.g. after a key rotation
    /// the user has confirmed out of band)
    pub async fn unpin(&self, peer_id: &str) -> Result<bool> {
        let removed = self.peers.write().remove(peer_id).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<()> {
        let plain = {
            let peers = self.peers.read();
            bincode::serialize(&*peers)?
        };
        let blob = seal_blob(&self.storage_key, &plain, keys::TRUST_STORE.as_bytes())?;
        self.kv.put(keys::TRUST_STORE, blob).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{load_or_init_storage_key, MemoryKv};

    async fn fresh() -> (Arc<MemoryKv>, TrustStore) {
        let kv = Arc::new(MemoryKv::new());
        let key = load_or_init_storage_key(kv.as_ref()).await.unwrap();
        let store = TrustStore::load(kv.clone(), key).await.unwrap();
        (kv, store)
    }

    #[tokio::test]
    async fn test_first_pin_then_trusted() {
        let (_, store) = fresh().await;

        let outcome = store
            .pin("peer-a", &[1; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        assert_eq!(outcome, PinOutcome::Pinned);

        let outcome = store
            .pin("peer-a", &[1; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        assert_eq!(outcome, PinOutcome::AlreadyTrusted);
    }

    #[tokio::test]
    async fn test_key_mismatch_is_hard_error_and_mutates_nothing() {
        let (_, store) = fresh().await;
        store
            .pin("peer-a", &[1; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap();

        let err = store
            .pin("peer-a", &[2; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyMismatch { ref peer_id } if peer_id == "peer-a"));

        // The pin is untouched
        assert_eq!(store.get("peer-a").unwrap().signing_public_key, vec![1; 32]);
    }

    #[tokio::test]
    async fn test_algorithm_change_is_also_a_mismatch() {
        let (_, store) = fresh().await;
        store
            .pin("peer-a", &[1; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap();

        let err = store
            .pin("peer-a", &[1; 32], SignatureAlgorithm::EcdsaP256)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyMismatch { .. }));
    }

    #[tokio::test]
    async fn test_pins_survive_reload() {
        let (kv, store) = fresh().await;
        store
            .pin("peer-a", &[1; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        drop(store);

        let key = load_or_init_storage_key(kv.as_ref()).await.unwrap();
        let reloaded = TrustStore::load(kv, key).await.unwrap();

        assert!(reloaded.contains("peer-a"));
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_store_is_sealed_at_rest() {
        let (kv, store) = fresh().await;
        store
            .pin("peer-a", &[0xCD; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap();

        let raw = kv.get(keys::TRUST_STORE).await.unwrap().unwrap();
        assert!(!raw.windows(32).any(|w| w == [0xCD; 32]));
    }

    #[tokio::test]
    async fn test_unpin() {
        let (_, store) = fresh().await;
        store
            .pin("peer-a", &[1; 32], SignatureAlgorithm::Ed25519)
            .await
            .unwrap();

        assert!(store.unpin("peer-a").await.unwrap());
        assert!(!store.contains("peer-a"));
        assert!(!store.unpin("peer-a").await.unwrap());
    }
}
