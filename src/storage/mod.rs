//! # Storage Module
//!
//! The core does not own a database. It talks to an opaque, string-keyed,
//! byte-valued **KV store** supplied by the host application: SQLite on
//! desktop, IndexedDB in a browser shell, a `HashMap` in tests. The [`Kv`]
//! trait is the entire contract: atomic `put`/`get`/`delete`.
//!
//! ## Key Schema
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         KV KEY SCHEMA                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  tether.peers.index          ordered list of known peer ids            │
//! │  tether.peers.record.<id>    one serialized PeerRecord per peer        │
//! │  tether.peers.metadata       {last_cleanup, total_peers, statistics}   │
//! │  tether.storage.entropy      32 bytes of local entropy (master-key     │
//! │                              input; the derived key never persists)    │
//! │  tether.storage.schema       textual schema version                    │
//! │  tether.identity.keys        encrypted NodeIdentity blob               │
//! │  tether.identity.sequence    persisted outbound sequence counter       │
//! │  tether.auth.trusted         encrypted TrustedPeer map                 │
//! │  tether.auth.sequences       peer_id → last accepted sequence number   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sensitive values (identity keys, trust store, per-peer shared secrets)
//! are sealed with AES-256-GCM under a master key derived from
//! `tether.storage.entropy` via HKDF; everything else is stored in the
//! clear. KV failures are reported but degrade gracefully; callers fall
//! back to in-memory state.

mod memory;

pub use memory::MemoryKv;

use async_trait::async_trait;

use crate::crypto::{kdf, EncryptionKey};
use crate::error::{Error, Result};

/// Key names under the fixed `tether.` prefix
pub mod keys {
    /// Ordered list of known peer ids
    pub const PEER_INDEX: &str = "tether.peers.index";

    /// Prefix for per-peer records; append the peer id
    pub const PEER_RECORD_PREFIX: &str = "tether.peers.record.";

    /// Store metadata: last cleanup, totals, statistics
    pub const PEER_METADATA: &str = "tether.peers.metadata";

    /// Local entropy the storage master key is derived from
    pub const STORAGE_ENTROPY: &str = "tether.storage.entropy";

    /// Textual schema version identifier
    pub const SCHEMA_VERSION: &str = "tether.storage.schema";

    /// Encrypted NodeIdentity blob
    pub const IDENTITY: &str = "tether.identity.keys";

    /// Persisted outbound announcement sequence counter
    pub const IDENTITY_SEQUENCE: &str = "tether.identity.sequence";

    /// Encrypted TrustedPeer map
    pub const TRUST_STORE: &str = "tether.auth.trusted";

    /// Per-peer last accepted announcement sequence numbers
    pub const SEQUENCE_TRACKER: &str = "tether.auth.sequences";

    /// Persisted manual-pairing secret, when the host app configured one
    pub const PAIRING_SECRET: &str = "tether.pairing.secret";

    /// Build the record key for a peer
    pub fn peer_record(peer_id: &str) -> String {
        format!("{}{}", PEER_RECORD_PREFIX, peer_id)
    }
}

/// Current storage schema version
pub const SCHEMA_VERSION: &str = "tether-v1";

/// The persistent key-value collaborator
///
/// Implementations must make each operation individually atomic; there is
/// no cross-key transaction. Keys are opaque UTF-8 strings, values opaque
/// bytes.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Store a value under a key, replacing any previous value
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value under a key, or `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove a key; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Load the storage master key, creating the backing entropy on first run
///
/// The 32 bytes of entropy are persisted; the AES key itself is derived on
/// every start and never written anywhere.
pub async fn load_or_init_storage_key(kv: &dyn Kv) -> Result<EncryptionKey> {
    let entropy: [u8; 32] = match kv.get(keys::STORAGE_ENTROPY).await? {
        Some(bytes) => bytes
            .try_into()
            .map_err(|_| Error::StorageCorrupted("Storage entropy must be 32 bytes".into()))?,
        None => {
            use rand::RngCore;
            let mut entropy = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut entropy);
            kv.put(keys::STORAGE_ENTROPY, entropy.to_vec()).await?;
            kv.put(keys::SCHEMA_VERSION, SCHEMA_VERSION.as_bytes().to_vec())
                .await?;
            tracing::info!("Initialized storage entropy and schema {}", SCHEMA_VERSION);
            entropy
        }
    };
    kdf::derive_storage_key(&entropy)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{open_blob, seal_blob};

    #[tokio::test]
    async fn test_storage_key_stable_across_loads() {
        let kv = MemoryKv::new();

        let key1 = load_or_init_storage_key(&kv).await.unwrap();
        let key2 = load_or_init_storage_key(&kv).await.unwrap();

        // Both derivations must open each other's blobs
        let blob = seal_blob(&key1, b"pinned keys", b"aad").unwrap();
        assert_eq!(open_blob(&key2, &blob, b"aad").unwrap(), b"pinned keys");
    }

    #[tokio::test]
    async fn test_first_run_writes_schema_version() {
        let kv = MemoryKv::new();
        load_or_init_storage_key(&kv).await.unwrap();

        let version = kv.get(keys::SCHEMA_VERSION).await.unwrap().unwrap();
        assert_eq!(version, SCHEMA_VERSION.as_bytes());
    }

    #[tokio::test]
    async fn test_corrupt_entropy_is_reported() {
        let kv = MemoryKv::new();
        kv.put(keys::STORAGE_ENTROPY, vec![1, 2, 3]).await.unwrap();

        assert!(load_or_init_storage_key(&kv).await.is_err());
    }

    #[test]
    fn test_peer_record_key() {
        assert_eq!(keys::peer_record("abc"), "tether.peers.record.abc");
    }
}
