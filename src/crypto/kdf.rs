//! # Key Derivation Module
//!
//! HKDF-SHA256 derivations. Two keys come out of this module:
//!
//! - the **storage master key**, derived from 32 bytes of local entropy
//!   persisted next to the store (the entropy, not the key, is what sits
//!   in the KV), and
//! - **per-peer shared keys**, derived from the raw ECDH output agreed
//!   during identity exchange.
//!
//! | Principle | Implementation |
//! |-----------|----------------|
//! | Domain separation | Distinct `info` strings per purpose |
//! | No raw DH use | ECDH output always passes through HKDF |

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::encryption::{EncryptionKey, KEY_SIZE};
use crate::error::{Error, Result};

/// Derive the storage master key from persisted local entropy
pub fn derive_storage_key(entropy: &[u8; 32]) -> Result<EncryptionKey> {
    derive(entropy, None, b"tether-storage-v1")
}

/// Derive a per-peer shared key from raw ECDH output
///
/// The two peer ids are mixed into the salt in lexicographic order so
/// both sides derive the same key.
pub fn derive_shared_key(
    dh_output: &[u8; 32],
    peer_a: &str,
    peer_b: &str,
) -> Result<EncryptionKey> {
    let (lo, hi) = if peer_a <= peer_b { (peer_a, peer_b) } else { (peer_b, peer_a) };
    let salt = format!("{}:{}", lo, hi);
    derive(dh_output, Some(salt.as_bytes()), b"tether-peer-secret-v1")
}

fn derive(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<EncryptionKey> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut key)
        .map_err(|_| Error::KeyDerivationFailed("HKDF expansion failed".into()))?;
    Ok(EncryptionKey::from_bytes(key))
}

// ============================================================================
// TESTS
// ============================================================================
