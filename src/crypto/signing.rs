//! # Digital Signatures Module
//!
//! Signature creation and verification for authenticated artefacts.
//!
//! Local signing always uses Ed25519. Verification dispatches on the
//! algorithm pinned in the trust store, so announcements from peers whose
//! platform only offers ECDSA-P256 still verify.
//!
//! ## Security Properties
//!
//! | Property | Description |
//! |----------|-------------|
//! | Authenticity | Verifies the artefact came from the claimed sender |
//! | Integrity | Detects any modification to the signed bytes |
//! | Non-repudiation | Sender cannot deny having signed the artefact |
//! | Public Verification | Anyone with the public key can verify |

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier, VerifyingKey};
use p256::ecdsa::signature::Verifier as P256Verifier;
use serde::{Deserialize, Serialize};

use crate::crypto::{SignatureAlgorithm, SigningKeyPair};
use crate::error::{Error, Result};

/// Size of a signature in bytes
///
/// Both Ed25519 and fixed-size ECDSA-P256 (r ‖ s) signatures are 64 bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// A detached signature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (must be exactly 64 bytes)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(Error::InvalidKey(format!(
                "Signature must be {} bytes, got {}",
                SIGNATURE_SIZE,
                slice.len()
            )));
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Encode as base64 for the wire
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Decode from base64
    pub fn from_base64(s: &str) -> Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| Error::InvalidKey(format!("Invalid signature base64: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Sign a message with the local Ed25519 key
///
/// Ed25519 signatures are deterministic: signing the same message with the
/// same key always produces the same signature.
pub fn sign(keypair: &SigningKeyPair, message: &[u8]) -> Signature {
    let sig = keypair.signing_key().sign(message);
    Signature(sig.to_bytes())
}

/// Verify a signature under the given algorithm
///
/// ## Parameters
///
/// - `algorithm`: the algorithm pinned for the signer
/// - `public_key`: 32 bytes (Ed25519) or SEC1 bytes (ECDSA-P256)
/// - `message`: the signed bytes
/// - `signature`: the detached signature
///
/// ## Returns
///
/// `Ok(())` if valid, `Err(VerificationFailed)` if invalid
pub fn verify(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let bytes: &[u8; 32] = public_key
                .try_into()
                .map_err(|_| Error::InvalidKey("Ed25519 public key must be 32 bytes".into()))?;
            let verifying_key = VerifyingKey::from_bytes(bytes)
                .map_err(|e| Error::InvalidKey(format!("Invalid public key: {}", e)))?;
            let sig = Ed25519Signature::from_bytes(&signature.0);
            verifying_key
                .verify(message, &sig)
                .map_err(|_| Error::VerificationFailed)
        }
        SignatureAlgorithm::EcdsaP256 => {
            let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|e| Error::InvalidKey(format!("Invalid P-256 public key: {}", e)))?;
            let sig = p256::ecdsa::Signature::from_slice(&signature.0)
                .map_err(|_| Error::VerificationFailed)?;
            verifying_key
                .verify(message, &sig)
                .map_err(|_| Error::VerificationFailed)
        }
    }
}

/// Serde helper for signature bytes
mod signature_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
