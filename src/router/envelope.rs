//! Gossip envelope wire types.
//!
//! Every message on the mesh travels inside an [`Envelope`]: a
//! self-describing JSON record with routing metadata around an opaque,
//! type-specific payload. Invariants on receipt: `path[0] == sender_id`,
//! `path.len() == hop_count + 1`, all `path` elements unique, `msg_id`
//! globally unique.

use serde::{Deserialize, Serialize};

/// Typed envelope kinds carried over the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    /// Signed presence beacon
    PeerAnnouncement,
    /// Signed beacon after a network-path change
    IpChangeAnnouncement,
    /// Relay-mediated introduction of two peers
    PeerIntroduction,
    /// Latency probe
    Ping,
    /// Latency probe reply
    Pong,
    /// "Who is connected to X?"
    PathQuery,
    /// "I am connected to X"
    PathResponse,
    /// WebRTC offer relayed over the mesh
    ReconnectOffer,
    /// WebRTC answer relayed over the mesh
    ReconnectAnswer,
    /// Offer declined
    ReconnectRejection,
    /// Ask a peer for its topology view
    TopologyRequest,
    /// Topology view reply
    TopologyResponse,
    /// Opaque application chat payload
    Chat,
}

impl MsgType {
    /// The stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::PeerAnnouncement => "peer_announcement",
            MsgType::IpChangeAnnouncement => "ip_change_announcement",
            MsgType::PeerIntroduction => "peer_introduction",
            MsgType::Ping => "ping",
            MsgType::Pong => "pong",
            MsgType::PathQuery => "path_query",
            MsgType::PathResponse => "path_response",
            MsgType::ReconnectOffer => "reconnect_offer",
            MsgType::ReconnectAnswer => "reconnect_answer",
            MsgType::ReconnectRejection => "reconnect_rejection",
            MsgType::TopologyRequest => "topology_request",
            MsgType::TopologyResponse => "topology_response",
            MsgType::Chat => "chat",
        }
    }
}

/// How an envelope wants to travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingHint {
    /// Deliver at every node (subject to `target_peer_id`)
    Broadcast,
    /// Flood toward a specific target; intermediate nodes only forward
    Relay,
}

/// The gossip frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique message id
    pub msg_id: String,
    /// Payload type
    pub msg_type: MsgType,
    /// Originating peer
    pub sender_id: String,
    /// Originator's display name
    pub sender_name: String,
    /// Emission time (ms)
    pub timestamp: i64,
    /// Remaining hops the envelope may still travel
    pub ttl: u32,
    /// Hops travelled so far
    pub hop_count: u32,
    /// Peers the envelope has passed through, origin first
    pub path: Vec<String>,
    /// Deliver only at this peer, when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,
    /// Travel mode
    pub routing_hint: RoutingHint,
    /// Type-specific payload, opaque to the router
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Structural validation of a received envelope
    ///
    /// Shape failures are the caller's cue to drop silently (with a
    /// counter); they are never surfaced.
    pub fn validate_shape(&self) -> std::result::Result<(), &'static str> {
        if self.msg_id.is_empty() {
            return Err("empty msg_id");
        }
        if self.sender_id.is_empty() {
            return Err("empty sender_id");
        }
        if self.path.is_empty() {
            return Err("empty path");
        }
        if self.path[0] != self.sender_id {
            return Err("path does not start at sender");
        }
        if self.path.len() != self.hop_count as usize + 1 {
            return Err("path length does not match hop count");
        }
        Ok(())
    }

    /// Whether any peer appears twice in `path`
    pub fn has_loop(&self) -> bool {
        let mut seen = std::collections::HashSet::with_capacity(self.path.len());
        self.path.iter().any(|peer| !seen.insert(peer))
    }

    /// The copy of this envelope a forwarding node sends on
    pub fn forwarded_by(&self, self_id: &str) -> Envelope {
        let mut next = self.clone();
        next.ttl = next.ttl.saturating_sub(1);
        next.hop_count += 1;
        next.path.push(self_id.to_string());
        next
    }

    /// Serialize for the wire
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from the wire
    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Envelope> {
        serde_json::from_slice(bytes).map_err(|e| crate::error::Error::DeserializationError(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            msg_id: "aaa-1700000000000-0f0f".into(),
            msg_type: MsgType::Chat,
            sender_id: "aaa".into(),
            sender_name: "Alice".into(),
            timestamp: 1_700_000_000_000,
            ttl: 7,
            hop_count: 0,
            path: vec!["aaa".into()],
            target_peer_id: None,
            routing_hint: RoutingHint::Broadcast,
            payload: serde_json::json!({"text": "hello"}),
        }
    }

    #[test]
    fn test_valid_shape() {
        assert!(envelope().validate_shape().is_ok());
    }

    #[test]
    fn test_shape_rejects_bad_path() {
        let mut e = envelope();
        e.path.clear();
        assert!(e.validate_shape().is_err());

        let mut e = envelope();
        e.path = vec!["bbb".into()];
        assert!(e.validate_shape().is_err());

        let mut e = envelope();
        e.hop_count = 3;
        assert!(e.validate_shape().is_err());
    }

    #[test]
    fn test_loop_detection() {
        let mut e = envelope();
        e.path = vec!["aaa".into(), "bbb".into(), "ccc".into()];
        e.hop_count = 2;
        assert!(!e.has_loop());

        e.path = vec!["aaa".into(), "bbb".into(), "aaa".into()];
        assert!(e.has_loop());
    }

    #[test]
    fn test_forwarded_by() {
        let e = envelope();
        let f = e.forwarded_by("bbb");

        assert_eq!(f.ttl, 6);
        assert_eq!(f.hop_count, 1);
        assert_eq!(f.path, vec!["aaa".to_string(), "bbb".to_string()]);
        assert!(f.validate_shape().is_ok());
        // The original is untouched
        assert_eq!(e.ttl, 7);
    }

    #[test]
    fn test_ttl_never_underflows() {
        let mut e = envelope();
        e.ttl = 0;
        assert_eq!(e.forwarded_by("bbb").ttl, 0);
    }

    #[test]
    fn test_wire_roundtrip() {
        let e = envelope();
        let bytes = e.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(restored, e);
    }

    #[test]
    fn test_msg_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MsgType::PeerAnnouncement).unwrap(),
            "\"peer_announcement\""
        );
        assert_eq!(MsgType::PathQuery.as_str(), "path_query");
        assert_eq!(MsgType::ReconnectOffer.as_str(), "reconnect_offer");
        assert_eq!(
            serde_json::to_string(&RoutingHint::Relay).unwrap(),
            "\"relay\""
        );
    }

    #[test]
    fn test_absent_target_is_omitted() {
        let json = serde_json::to_string(&envelope()).unwrap();
        assert!(!json.contains("target_peer_id"));
    }
}
