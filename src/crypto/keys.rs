//! # Key Management
//!
//! Key generation and management for node identities.
//!
//! ## Key Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SigningKeyPair (Ed25519)                                       │   │
//! │  │  ─────────────────────────                                       │   │
//! │  │                                                                  │   │
//! │  │  Purpose:                                                       │   │
//! │  │  • Signing announcements, identity exchanges, relay envelopes   │   │
//! │  │  • Private key: 32 bytes (secret)                               │   │
//! │  │  • Public key: 32 bytes (pinned by peers on first use)          │   │
//! │  │                                                                  │   │
//! │  │  Verification additionally accepts ECDSA-P256 so that peers     │   │
//! │  │  on platforms without Ed25519 support remain interoperable.     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  EcdhKeyPair (P-256)                                            │   │
//! │  │  ────────────────────                                            │   │
//! │  │                                                                  │   │
//! │  │  Purpose:                                                       │   │
//! │  │  • Key agreement during identity exchange                       │   │
//! │  │  • Deriving per-peer shared secrets                             │   │
//! │  │  • Public key: 33 bytes (SEC1 compressed)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  KeyPair combines both; it is the key material behind a NodeIdentity.  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use ed25519_dalek::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Signature algorithm negotiated during identity exchange
///
/// Every signed artefact names the algorithm it was produced with, and the
/// trust store pins it alongside the public key. We always sign with
/// Ed25519; ECDSA-P256 exists for verifying peers that cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// Ed25519 (default, always used for local signing)
    #[serde(rename = "ed25519")]
    Ed25519,
    /// ECDSA over NIST P-256 (verification fallback)
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
}

impl SignatureAlgorithm {
    /// The stable wire name of this algorithm
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::EcdsaP256 => "ecdsa-p256",
        }
    }

    /// Parse a wire name; unknown names are a configuration error
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ed25519" => Ok(SignatureAlgorithm::Ed25519),
            "ecdsa-p256" => Ok(SignatureAlgorithm::EcdsaP256),
            other => Err(Error::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combined keypair containing both signing and key-agreement keys
///
/// ## Security
///
/// - Private keys are zeroized when this struct is dropped
/// - Public keys can be safely shared with anyone
#[derive(ZeroizeOnDrop)]
pub struct KeyPair {
    /// Ed25519 keypair for signing
    pub signing: SigningKeyPair,
    /// P-256 keypair for key agreement
    pub ecdh: EcdhKeyPair,
}

impl KeyPair {
    /// Generate a new random keypair
    ///
    /// Uses the operating system's secure random number generator.
    pub fn generate() -> Self {
        Self {
            signing: SigningKeyPair::generate(),
            ecdh: EcdhKeyPair::generate(),
        }
    }

    /// Restore a keypair from stored secret bytes
    pub fn from_secret_bytes(signing: &[u8; 32], ecdh: &[u8]) -> Result<Self> {
        Ok(Self {
            signing: SigningKeyPair::from_bytes(signing)?,
            ecdh: EcdhKeyPair::from_bytes(ecdh)?,
        })
    }

    /// Get the public halves for sharing with others
    pub fn public_keys(&self) -> PublicKey {
        PublicKey {
            signing: self.signing.public_bytes().to_vec(),
            ecdh: self.ecdh.public_bytes(),
            algorithm: SignatureAlgorithm::Ed25519,
        }
    }
}

/// Ed25519 signing keypair
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    /// Private signing key (secret)
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        Self { secret }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret = SigningKey::from_bytes(bytes);
        Ok(Self { secret })
    }

    /// Get the secret key bytes (for encrypted storage only)
    ///
    /// ## Security Warning
    ///
    /// Only use this for secure storage. Never log or transmit these bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    /// Get the verifying key for signature verification
    pub fn verifying_key(&self) -> VerifyingKey {
        self.secret.verifying_key()
    }

    /// Get reference to the signing key
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }
}

/// P-256 keypair for ECDH key agreement
#[derive(ZeroizeOnDrop)]
pub struct EcdhKeyPair {
    /// Private scalar (secret)
    #[zeroize(skip)] // p256::SecretKey zeroizes on drop
    secret: p256::SecretKey,
    /// Public point (derived from secret)
    #[zeroize(skip)]
    public: p256::PublicKey,
}

impl EcdhKeyPair {
    /// Generate a new random key-agreement keypair
    pub fn generate() -> Self {
        let secret = p256::SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Create from raw secret scalar bytes (32 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = p256::SecretKey::from_slice(bytes)
            .map_err(|e| Error::InvalidKey(format!("Invalid P-256 secret key: {}", e)))?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// Get the secret scalar bytes (for encrypted storage only)
    ///
    /// ## Security Warning
    ///
    /// Only use this for secure storage. Never log or transmit these bytes.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes().into()
    }

    /// Get the public key as SEC1 compressed bytes (33 bytes)
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Perform Diffie-Hellman key agreement
    ///
    /// Both parties compute the same 32-byte secret:
    /// - Alice: alice_secret × bob_public
    /// - Bob: bob_secret × alice_public
    ///
    /// The raw output must go through HKDF before use as a cipher key;
    /// see [`crate::crypto::kdf::derive_shared_key`].
    pub fn diffie_hellman(&self, their_public_sec1: &[u8]) -> Result<[u8; 32]> {
        let their_public = p256::PublicKey::from_sec1_bytes(their_public_sec1)
            .map_err(|e| Error::InvalidKey(format!("Invalid P-256 public key: {}", e)))?;
        let shared = p256::ecdh::diffie_hellman(
            self.secret.to_nonzero_scalar(),
            their_public.as_affine(),
        );
        let bytes: [u8; 32] = (*shared.raw_secret_bytes()).into();
        Ok(bytes)
    }
}

/// Public keys that can be safely shared with others
///
/// This contains only public information and can be serialized,
/// transmitted, and stored without security concerns. The signing key is
/// 32 bytes for Ed25519 and 33 bytes (SEC1 compressed) for ECDSA-P256.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKey {
    /// Public signing key for signature verification
    #[serde(with = "hex_vec")]
    pub signing: Vec<u8>,

    /// P-256 public key for key agreement (SEC1 compressed, 33 bytes)
    #[serde(with = "hex_vec")]
    pub ecdh: Vec<u8>,

    /// Algorithm the signing key belongs to
    pub algorithm: SignatureAlgorithm,
}

impl PublicKey {
    /// Create a PublicKey from raw parts
    pub fn new(signing: Vec<u8>, ecdh: Vec<u8>, algorithm: SignatureAlgorithm) -> Self {
        Self { signing, ecdh, algorithm }
    }

    /// Get the Ed25519 verifying key, if this key uses Ed25519
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let bytes: &[u8; 32] = self
            .signing
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidKey("Ed25519 public key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(bytes)
            .map_err(|e| Error::InvalidKey(format!("Invalid signing public key: {}", e)))
    }

    /// Render the SHA-256 key fingerprint as decimal digit groups
    /// for out-of-band comparison. See [`crate::crypto::canonical`].
    pub fn fingerprint(&self) -> Result<String> {
        crate::crypto::canonical::fingerprint(self)
    }
}

/// Serde helper for serializing byte vectors as hex
mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// TESTS
// ============================================================================
