//! # Transport Module
//!
//! The WebRTC collaborator interface and the live-peer registry.
//!
//! The core never touches ICE machinery. The host application supplies a
//! [`TransportFactory`]; every live peer is one [`PeerTransport`], a
//! reliable, bidirectional byte channel that emits events once the
//! candidate pair succeeds.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     TRANSPORT COLLABORATOR                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  TransportFactory::create(initiator, ice)  ──►  PeerTransport          │
//! │                                                                         │
//! │  PeerTransport                                                         │
//! │    signal(blob)      feed remote offer/answer/candidates in            │
//! │    send(bytes)       reliable channel send                             │
//! │    close()           tear down                                         │
//! │    subscribe()       Signal / Connect / Data / Close / Error events    │
//! │    stats()           candidate-pair class (host/srflx/relay) + RTT     │
//! │                                                                         │
//! │  PeerRegistry (single writer: the orchestrator)                        │
//! │    one PeerHandle per live peer, 1:1 with its transport                │
//! │    LivePeerView: the read-only slice the flood router sees             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

/// ICE candidate classes, as reported by candidate-pair statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Direct local address
    Host,
    /// Server-reflexive (STUN)
    Srflx,
    /// Relayed (TURN)
    Relay,
    /// Peer-reflexive
    Prflx,
}

impl ConnectionType {
    /// The stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Host => "host",
            ConnectionType::Srflx => "srflx",
            ConnectionType::Relay => "relay",
            ConnectionType::Prflx => "prflx",
        }
    }
}

/// Candidate-pair statistics from the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidatePairStats {
    /// Selected candidate class, when known
    pub connection_type: Option<ConnectionType>,
    /// Round-trip latency in milliseconds, when measured
    pub latency_ms: Option<u32>,
}

/// One STUN/TURN server entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` / `turn:`)
    pub urls: Vec<String>,
    /// TURN username, if required
    pub username: Option<String>,
    /// TURN credential, if required
    pub credential: Option<String>,
}

/// ICE configuration handed to the factory on every create
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN/TURN servers, in preference order
    pub servers: Vec<IceServer>,
}

/// Events emitted by a peer transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Local signalling blob to deliver to the remote side
    Signal(serde_json::Value),
    /// The candidate pair succeeded; the channel is usable
    Connect,
    /// Bytes arrived on the channel
    Data(Vec<u8>),
    /// The channel closed
    Close,
    /// The transport failed
    Error(String),
}

/// A reliable bidirectional byte channel to one peer
///
/// Held 1:1 per peer; nobody but the owning handle mutates it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Feed a remote signalling blob (offer/answer/candidates) in
    async fn signal(&self, blob: serde_json::Value) -> Result<()>;

    /// Send bytes over the channel
    async fn send(&self, data: Vec<u8>) -> Result<()>;

    /// Tear the connection down
    async fn close(&self);

    /// Subscribe to transport events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Query candidate-pair statistics
    async fn stats(&self) -> Option<CandidatePairStats>;
}

/// Creates transports; implemented by the host application
pub trait TransportFactory: Send + Sync {
    /// Create a transport
    ///
    /// `initiator` decides which side produces the offer.
    fn create(&self, initiator: bool, ice: &IceConfig) -> Result<Arc<dyn PeerTransport>>;
}

// ============================================================================
// LIVE PEER REGISTRY
// ============================================================================

/// A live, connected peer
#[derive(Clone)]
pub struct PeerHandle {
    /// The peer's id
    pub peer_id: String,
    /// The peer's display name
    pub display_name: String,
    /// The channel to the peer
    pub transport: Arc<dyn PeerTransport>,
    /// When the channel connected (ms)
    pub connected_at: i64,
    /// Last measured latency
    pub latency_ms: Option<u32>,
    /// Candidate class of the selected pair
    pub connection_type: Option<ConnectionType>,
    /// Transient handles (mid-handshake) are never flooded to
    pub transient: bool,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("peer_id", &self.peer_id)
            .field("display_name", &self.display_name)
            .field("connected_at", &self.connected_at)
            .field("latency_ms", &self.latency_ms)
            .field("connection_type", &self.connection_type)
            .field("transient", &self.transient)
            .finish_non_exhaustive()
    }
}

/// Read-only slice of the registry the flood router depends on
///
/// Keeping the router behind this trait breaks the cyclic wiring between
/// routing and peer management: the router can enumerate and send, nothing
/// more.
pub trait LivePeerView: Send + Sync {
    /// Ids of all non-transient live peers
    fn live_peer_ids(&self) -> Vec<String>;

    /// The channel to a live peer, if connected
    fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerTransport>>;

    /// Number of non-transient live peers
    fn live_count(&self) -> usize;
}

/// The in-memory registry of live peers
///
/// Written only from orchestrator callbacks and the transport event loop;
/// everyone else reads.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a handle
    pub fn insert(&self, handle: PeerHandle) {
        self.peers.write().insert(handle.peer_id.clone(), handle);
    }

    /// Remove a handle, returning it if present
    pub fn remove(&self, peer_id: &str) -> Option<PeerHandle> {
        self.peers.write().remove(peer_id)
    }

    /// Clone the handle for a peer
    pub fn get(&self, peer_id: &str) -> Option<PeerHandle> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Whether a non-transient channel to the peer exists
    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers
            .read()
            .get(peer_id)
            .map(|h| !h.transient)
            .unwrap_or(false)
    }

    /// Clone all non-transient handles
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers
            .read()
            .values()
            .filter(|h| !h.transient)
            .cloned()
            .collect()
    }

    /// Update stats on a live handle
    pub fn update_stats(&self, peer_id: &str, stats: CandidatePairStats) {
        if let Some(handle) = self.peers.write().get_mut(peer_id) {
            if stats.latency_ms.is_some() {
                handle.latency_ms = stats.latency_ms;
            }
            if stats.connection_type.is_some() {
                handle.connection_type = stats.connection_type;
            }
        }
    }
}

impl LivePeerView for PeerRegistry {
    fn live_peer_ids(&self) -> Vec<String> {
        self.peers
            .read()
            .values()
            .filter(|h| !h.transient)
            .map(|h| h.peer_id.clone())
            .collect()
    }

    fn channel(&self, peer_id: &str) -> Option<Arc<dyn PeerTransport>> {
        let peers = self.peers.read();
        let handle = peers.get(peer_id)?;
        if handle.transient {
            return None;
        }
        Some(handle.transport.clone())
    }

    fn live_count(&self) -> usize {
        self.peers.read().values().filter(|h| !h.transient).count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
