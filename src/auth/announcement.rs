//! Announcement and identity-exchange wire types.
//!
//! All of these are signed over their **canonical JSON** with the
//! signature-bearing fields stripped first; see
//! [`crate::crypto::canonical`]. Optional fields are omitted (not null)
//! when absent so the signed bytes stay stable.

use serde::{Deserialize, Serialize};

use crate::crypto::SignatureAlgorithm;

/// Why an announcement was emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceReason {
    /// Node came back and wants its mesh links restored
    Rejoin,
    /// Node's network path changed (LTE↔Wi-Fi, NAT rebind)
    IpChange,
    /// Periodic heartbeat
    Periodic,
    /// First announcement after a successful cold start
    ColdStartRecovery,
}

impl AnnounceReason {
    /// The stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceReason::Rejoin => "rejoin",
            AnnounceReason::IpChange => "ip_change",
            AnnounceReason::Periodic => "periodic",
            AnnounceReason::ColdStartRecovery => "cold_start_recovery",
        }
    }
}

/// Hints that help receivers pick a relay toward the announcer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHint {
    /// The announcer's best-scored live peer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_relay: Option<String>,
    /// A sample of the announcer's live peers
    #[serde(default)]
    pub connected_peers_sample: Vec<String>,
}

/// A signed, sequenced, nonced presence artefact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// The announcing peer
    pub peer_id: String,
    /// The announcer's display name
    pub display_name: String,
    /// Emission time (ms)
    pub timestamp: i64,
    /// 32 random bytes, base64; replay guard inside the timestamp window
    pub nonce: String,
    /// Strictly increasing per announcer
    pub sequence_num: u64,
    /// Why this announcement exists
    pub reason: AnnounceReason,
    /// The announcer's current live peers
    #[serde(default)]
    pub connected_peers: Vec<String>,
    /// Relay hints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_hint: Option<ConnectionHint>,
    /// Opaque diagnostic binding, ip-change announcements only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
    /// Detached signature (base64), absent while unsigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Algorithm the signature was produced with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<SignatureAlgorithm>,
}

impl Announcement {
    /// The announcement with signature-bearing fields stripped: the
    /// value whose canonical bytes are signed and verified
    pub fn signing_payload(&self) -> Announcement {
        let mut payload = self.clone();
        payload.signature = None;
        payload.algorithm = None;
        payload
    }
}

/// An announcement wrapped and counter-signed by a relaying peer
///
/// Relays may nest (a relay of a relay), at most three deep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Constant `"announcement_relay"`, bound into the relay signature
    #[serde(rename = "type")]
    pub envelope_type: String,
    /// The relaying peer
    pub relayed_by: String,
    /// When the relay happened (ms)
    pub relay_timestamp: i64,
    /// SHA-256 (hex) of the canonical bytes of the wrapped payload
    pub original_hash: String,
    /// The relaying peer's signature (base64)
    pub relay_signature: String,
    /// The wrapped announcement or inner relay
    pub original: RelayPayload,
}

/// What a relay envelope wraps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayPayload {
    /// Another relay layer
    Relay(Box<RelayEnvelope>),
    /// The original announcement
    Announcement(Box<Announcement>),
}

impl RelayPayload {
    /// Walk to the innermost announcement
    pub fn innermost(&self) -> &Announcement {
        match self {
            RelayPayload::Announcement(announcement) => announcement,
            RelayPayload::Relay(relay) => relay.original.innermost(),
        }
    }

    /// The emission timestamp of the wrapped payload
    pub fn timestamp(&self) -> i64 {
        match self {
            RelayPayload::Announcement(announcement) => announcement.timestamp,
            RelayPayload::Relay(relay) => relay.relay_timestamp,
        }
    }
}

/// Wire name for relay envelopes
pub const RELAY_ENVELOPE_TYPE: &str = "announcement_relay";

/// The fields a relay signature covers
#[derive(Serialize)]
pub(crate) struct RelaySigningPayload<'a> {
    #[serde(rename = "type")]
    pub envelope_type: &'a str,
    pub relayed_by: &'a str,
    pub relay_timestamp: i64,
    pub original_hash: &'a str,
}

/// First message on a fresh channel: who am I, under which keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityExchange {
    /// The sender's peer id
    pub peer_id: String,
    /// The sender's display name
    pub display_name: String,
    /// Signing public key (hex)
    pub sign_pubkey: String,
    /// P-256 key-agreement public key (hex, SEC1 compressed)
    pub dh_pubkey: String,
    /// Signature algorithm for `sign_pubkey`
    pub algorithm: SignatureAlgorithm,
    /// Emission time (ms)
    pub timestamp: i64,
    /// Signature over the canonical core fields (base64)
    pub signature: String,
}

/// The fields an identity-exchange signature covers
#[derive(Serialize)]
pub(crate) struct IdentitySigningPayload<'a> {
    pub peer_id: &'a str,
    pub sign_pubkey: &'a str,
    pub dh_pubkey: &'a str,
    pub timestamp: i64,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::canonical::to_canonical_bytes;

    fn announcement() -> Announcement {
        Announcement {
            peer_id: "aaa".into(),
            display_name: "Alice".into(),
            timestamp: 1_700_000_000_000,
            nonce: "bm9uY2U=".into(),
            sequence_num: 5,
            reason: AnnounceReason::Rejoin,
            connected_peers: vec!["bbb".into()],
            connection_hint: None,
            challenge: None,
            signature: Some("sig".into()),
            algorithm: Some(SignatureAlgorithm::Ed25519),
        }
    }

    #[test]
    fn test_signing_payload_strips_signature_fields() {
        let bytes = to_canonical_bytes(&announcement().signing_payload()).unwrap();
        let json = String::from_utf8(bytes).unwrap();

        assert!(!json.contains("signature"));
        assert!(!json.contains("algorithm"));
        assert!(json.contains("sequence_num"));
    }

    #[test]
    fn test_signing_payload_is_stable() {
        let a = announcement();
        let b1 = to_canonical_bytes(&a.signing_payload()).unwrap();
        let b2 = to_canonical_bytes(&a.signing_payload()).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn test_reason_wire_names() {
        assert_eq!(AnnounceReason::Rejoin.as_str(), "rejoin");
        assert_eq!(AnnounceReason::IpChange.as_str(), "ip_change");
        assert_eq!(
            serde_json::to_string(&AnnounceReason::ColdStartRecovery).unwrap(),
            "\"cold_start_recovery\""
        );
    }

    #[test]
    fn test_relay_payload_untagged_roundtrip() {
        let inner = RelayPayload::Announcement(Box::new(announcement()));
        let relay = RelayEnvelope {
            envelope_type: RELAY_ENVELOPE_TYPE.into(),
            relayed_by: "bbb".into(),
            relay_timestamp: 1_700_000_000_500,
            original_hash: "00".repeat(32),
            relay_signature: "rsig".into(),
            original: inner,
        };
        let nested = RelayPayload::Relay(Box::new(relay.clone()));

        let json = serde_json::to_string(&nested).unwrap();
        let restored: RelayPayload = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, nested);
        assert_eq!(restored.innermost().peer_id, "aaa");
    }

    #[test]
    fn test_announcement_roundtrip() {
        let a = announcement();
        let json = serde_json::to_string(&a).unwrap();
        let restored: Announcement = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, a);
    }
}
