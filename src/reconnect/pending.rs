//! Per-attempt reconnection state.
//!
//! One [`PendingReconnect`] per in-flight attempt, owned exclusively by
//! the orchestrator. Transitions are linear; any state may fall into
//! `Failed` on timeout, and a responder's explicit decline lands in
//! `Rejected`.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::transport::PeerTransport;

/// State of one reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// Created, nothing sent yet
    Idle,
    /// Path query in flight
    QueryingPath,
    /// At least one relay responded
    PathFound,
    /// Offer emitted toward the target
    SendingOffer,
    /// Waiting for the answer envelope
    WaitingAnswer,
    /// Answer signalled into the transport; ICE running
    Connecting,
    /// Transport reported connected
    Connected,
    /// Attempt failed (timeout, transport error, no path)
    Failed,
    /// Target declined
    Rejected,
}

impl ReconnectState {
    /// Whether `next` is a legal successor of `self`
    ///
    /// The happy path is strictly linear; `Failed` is reachable from
    /// everywhere, `Rejected` from every non-terminal state.
    pub fn can_advance_to(self, next: ReconnectState) -> bool {
        use ReconnectState::*;
        if self == next {
            return false;
        }
        match next {
            Failed => !matches!(self, Connected | Rejected),
            Rejected => !matches!(self, Connected | Failed),
            QueryingPath => self == Idle,
            PathFound => self == QueryingPath,
            SendingOffer => matches!(self, Idle | PathFound),
            WaitingAnswer => self == SendingOffer,
            Connecting => self == WaitingAnswer,
            Connected => matches!(self, Connecting | WaitingAnswer),
            Idle => false,
        }
    }

    /// Whether the attempt is over
    pub fn is_terminal(self) -> bool {
        matches!(self, ReconnectState::Connected | ReconnectState::Failed | ReconnectState::Rejected)
    }
}

/// What the answer/rejection handlers report back to the ladder
#[derive(Debug)]
pub enum LadderSignal {
    /// The target's answer blob arrived
    Answer(serde_json::Value),
    /// The target declined with this reason
    Rejected(String),
}

/// One in-flight reconnection attempt
pub struct PendingReconnect {
    /// Unique attempt id (shared with the remote side)
    pub reconnect_id: String,
    /// The peer being reconnected to
    pub target_peer_id: String,
    /// The peer's display name
    pub target_name: String,
    /// Current state
    pub state: ReconnectState,
    /// The transport under negotiation
    pub transport: Option<Arc<dyn PeerTransport>>,
    /// When the attempt started (ms)
    pub start_time: i64,
    /// Wall-clock deadline (ms)
    pub timeout_deadline: i64,
    /// Hands the answer (or rejection) to the waiting ladder step
    pub signal_tx: Option<oneshot::Sender<LadderSignal>>,
}

impl PendingReconnect {
    /// Create a fresh attempt in `Idle`
    pub fn new(
        reconnect_id: impl Into<String>,
        target_peer_id: impl Into<String>,
        target_name: impl Into<String>,
        now_ms: i64,
        deadline_ms: i64,
    ) -> Self {
        Self {
            reconnect_id: reconnect_id.into(),
            target_peer_id: target_peer_id.into(),
            target_name: target_name.into(),
            state: ReconnectState::Idle,
            transport: None,
            start_time: now_ms,
            timeout_deadline: deadline_ms,
            signal_tx: None,
        }
    }

    /// Advance the state machine; illegal transitions are ignored and
    /// reported false
    pub fn advance(&mut self, next: ReconnectState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for PendingReconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReconnect")
            .field("reconnect_id", &self.reconnect_id)
            .field("target_peer_id", &self.target_peer_id)
            .field("state", &self.state)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

/// One relay's answer to a path query
#[derive(Debug, Clone)]
pub struct PathResponseEntry {
    /// The relay that claims the target as a live peer
    pub relay_peer_id: String,
    /// Hops the query travelled to reach the relay
    pub hop_count: u32,
    /// When the response arrived (ms)
    pub wall_time: i64,
}

/// An outstanding path query
pub struct PathQueryState {
    /// Unique query id
    pub query_id: String,
    /// The peer being looked for
    pub target_peer_id: String,
    /// Responses collected so far
    pub responses: Vec<PathResponseEntry>,
    /// When the query was emitted (ms)
    pub start_time: i64,
    /// Wakes the ladder when the first response lands
    pub notify: Arc<tokio::sync::Notify>,
}

/// How a connection was ultimately established, for statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconnectMethod {
    /// Cold-start layer 1: recent peers, direct
    RecentPeers,
    /// Cold-start layer 3: any known peer, direct
    AllKnownPeers,
    /// Ladder step A: cached signalling
    CachedDirect,
    /// Ladder step B: mesh-relayed signalling
    MeshRelay,
    /// Channel handed in from outside (manual pairing)
    External,
}

impl ReconnectMethod {
    /// The stable stats key
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectMethod::RecentPeers => "recent_peers",
            ReconnectMethod::AllKnownPeers => "all_known_peers",
            ReconnectMethod::CachedDirect => "cached_direct",
            ReconnectMethod::MeshRelay => "mesh_relay",
            ReconnectMethod::External => "external",
        }
    }
}

/// Running totals over all reconnection activity
#[derive(Debug, Clone, Default)]
pub struct ReconnectStats {
    /// Successful connections per method
    pub method_breakdown: std::collections::HashMap<&'static str, u32>,
    /// Failed attempts (rejections included)
    pub failures: u32,
    /// Duration of the most recent successful attempt (ms)
    pub last_duration_ms: Option<u64>,
}

impl ReconnectStats {
    /// Count a success
    pub fn record_success(&mut self, method: ReconnectMethod, duration_ms: u64) {
        *self.method_breakdown.entry(method.as_str()).or_insert(0) += 1;
        self.last_duration_ms = Some(duration_ms);
    }

    /// Count a failure
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    /// Successes for one method
    pub fn method_count(&self, method: ReconnectMethod) -> u32 {
        self.method_breakdown.get(method.as_str()).copied().unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
