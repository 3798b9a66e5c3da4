//! Peer record types.
//!
//! One [`PeerRecord`] per known peer, owned exclusively by the
//! [`PeerStore`](crate::peers::PeerStore) on disk. The in-memory record
//! carries the shared secret in the clear; at rest the secret is sealed
//! under the storage master key and everything else is stored plainly.

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::transport::ConnectionType;

/// Current peer-record schema version
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// How long cached signalling stays usable, by candidate class (ms)
pub fn ice_cache_validity_ms(connection_type: Option<ConnectionType>) -> i64 {
    match connection_type {
        Some(ConnectionType::Host) => 10 * 60 * 1000,
        Some(ConnectionType::Srflx) => 5 * 60 * 1000,
        Some(ConnectionType::Relay) => 2 * 60 * 1000,
        _ => 5 * 60 * 1000,
    }
}

/// Measured connection quality for one peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    /// Last measured round-trip latency
    pub latency_ms: Option<u32>,
    /// Fraction of attempts that connected, in [0, 1]
    pub success_rate: f64,
    /// Candidate class of the last selected pair
    pub connection_type: Option<ConnectionType>,
    /// When quality was last measured (ms)
    pub last_measured: Option<i64>,
    /// Connection attempts observed
    pub total_connections: u32,
    /// Attempts that reached connected
    pub successful_connections: u32,
    /// Average session uptime in seconds
    pub avg_uptime_s: f64,
}

impl ConnectionQuality {
    /// Record the outcome of one connection attempt
    ///
    /// Maintains `successful_connections ≤ total_connections` and keeps
    /// `success_rate` the exact ratio of the two.
    pub fn record_attempt(&mut self, success: bool, now_ms: i64) {
        self.total_connections = self.total_connections.saturating_add(1);
        if success {
            self.successful_connections = self.successful_connections.saturating_add(1);
        }
        self.success_rate = f64::from(self.successful_connections) / f64::from(self.total_connections);
        self.last_measured = Some(now_ms);
    }

    /// Fold one observed session uptime into the running average
    pub fn record_uptime(&mut self, uptime_s: f64) {
        let sessions = f64::from(self.successful_connections.max(1));
        self.avg_uptime_s = (self.avg_uptime_s * (sessions - 1.0) + uptime_s) / sessions;
    }

    /// Fraction of attempts that failed
    pub fn failure_rate(&self) -> f64 {
        1.0 - self.success_rate
    }
}

/// A cached signalling blob with its capture time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCandidate {
    /// Opaque transport signalling data
    pub blob: serde_json::Value,
    /// When the blob was captured (ms)
    pub cached_at: i64,
}

/// Everything persisted about one known peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's id
    pub peer_id: String,
    /// The peer's display name
    pub display_name: String,
    /// First time we ever saw this peer (ms)
    pub first_seen: i64,
    /// Last time we saw any artefact from this peer (ms)
    pub last_seen: i64,
    /// Last time a channel to this peer connected (ms)
    pub last_connected: Option<i64>,
    /// The peer's public keys, once exchanged
    pub public_key: Option<PublicKey>,
    /// Per-peer shared secret (in the clear only in memory; sealed at rest)
    #[serde(skip)]
    pub shared_secret: Option<Vec<u8>>,
    /// Last known network address, if the transport surfaced one
    pub last_known_address: Option<String>,
    /// Cached signalling for the fast reconnect path
    pub cached_ice_candidates: Vec<CachedCandidate>,
    /// Measured quality
    pub connection_quality: ConnectionQuality,
    /// Consecutive failed reconnection attempts
    pub reconnection_attempts: u32,
    /// Wall-clock deadline until which the peer is invisible (ms)
    pub blacklist_until: Option<i64>,
    /// Record schema version
    pub schema_version: u32,
}

impl PeerRecord {
    /// Create a fresh record for a newly met peer
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>, now_ms: i64) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
            first_seen: now_ms,
            last_seen: now_ms,
            last_connected: None,
            public_key: None,
            shared_secret: None,
            last_known_address: None,
            cached_ice_candidates: Vec::new(),
            connection_quality: ConnectionQuality::default(),
            reconnection_attempts: 0,
            blacklist_until: None,
            schema_version: RECORD_SCHEMA_VERSION,
        }
    }

    /// Whether the peer is blacklisted at `now_ms`
    pub fn is_blacklisted(&self, now_ms: i64) -> bool {
        self.blacklist_until.map(|until| until > now_ms).unwrap_or(false)
    }

    /// Extend the blacklist deadline; deadlines only move forward
    pub fn blacklist(&mut self, until_ms: i64) {
        self.blacklist_until = Some(self.blacklist_until.map_or(until_ms, |cur| cur.max(until_ms)));
    }

    /// Cached candidates still inside the freshness window for the
    /// record's candidate class
    pub fn fresh_cached_candidates(&self, now_ms: i64) -> Vec<&CachedCandidate> {
        let validity = ice_cache_validity_ms(self.connection_quality.connection_type);
        self.cached_ice_candidates
            .iter()
            .filter(|c| now_ms - c.cached_at <= validity)
            .collect()
    }

    /// Milliseconds since the last successful connection, if any
    pub fn ms_since_connected(&self, now_ms: i64) -> Option<i64> {
        self.last_connected.map(|t| now_ms - t)
    }
}

// ============================================================================
// TESTS
// ============================================================================
