//! # Announcement & Gossip Fabric Module
//!
//! Injects signed presence and ip-change events into the flood router,
//! reacts to incoming ones, and applies deterministic tie-breaking so at
//! most one side of any pair initiates a reconnection.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ANNOUNCEMENT FLOW                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  outbound:  auth.create_announcement ──► envelope (ttl 7, or 10 for    │
//! │             ip-change) ──► flood router ──► mesh                        │
//! │                                                                         │
//! │  inbound:   envelope ──► drop self ──► duplicate cache ──► M2 verify   │
//! │             ──► policy (connected? full? blacklisted? cooldown?)       │
//! │             ──► tie-break (lower id initiates)                         │
//! │             ──► jittered reconnect request to the orchestrator         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The fabric talks to the orchestrator only through an mpsc channel of
//! [`ReconnectRequest`]s, keeping the dependency order acyclic. It also
//! owns the small gossip utilities: ping/pong latency probes, topology
//! sampling, and relay-mediated peer introductions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::auth::{
    AnnounceReason, Announcement, AnnouncementDraft, ConnectionHint, ReconnectAuth, RelayEnvelope,
    Verification,
};
use crate::error::Result;
use crate::identity::IdentityManager;
use crate::peers::{quality_score, PeerStore, QualityUpdate};
use crate::router::{CreateOptions, Delivery, FloodRouter, MsgType, RoutingHint};
use crate::transport::{CandidatePairStats, ConnectionType, LivePeerView, PeerRegistry};

/// Tunables for the announcement fabric
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    /// Heartbeat period (ms)
    pub heartbeat_interval_ms: u64,
    /// Connection budget; above it, inbound announcements never trigger
    /// reconnects
    pub max_connections: usize,
    /// Per-peer cooldown between scheduled reconnects (ms)
    pub reconnect_cooldown_ms: i64,
    /// TTL for ordinary announcements
    pub announce_ttl: u32,
    /// Elevated TTL for ip-change announcements
    pub ip_change_ttl: u32,
    /// Timestamp slack in the announcement duplicate cache (ms)
    pub duplicate_window_ms: i64,
    /// Jittered scheduling delay bounds (ms)
    pub schedule_delay_min_ms: u64,
    /// Upper bound of the scheduling jitter (ms)
    pub schedule_delay_max_ms: u64,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 120_000,
            max_connections: 6,
            reconnect_cooldown_ms: 60_000,
            announce_ttl: 7,
            ip_change_ttl: 10,
            duplicate_window_ms: 1_000,
            schedule_delay_min_ms: 1_000,
            schedule_delay_max_ms: 3_000,
        }
    }
}

/// A request from the fabric to the orchestrator to reconnect to a peer
#[derive(Debug, Clone)]
pub struct ReconnectRequest {
    /// The peer to reconnect to
    pub peer_id: String,
    /// Its display name, as announced
    pub display_name: String,
    /// What prompted the request
    pub reason: AnnounceReason,
    /// Relay hints from the announcement, if any
    pub hint: Option<ConnectionHint>,
}

/// One peer's entry in a topology response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyPeer {
    /// The peer's id
    pub peer_id: String,
    /// The peer's display name
    pub display_name: String,
    /// Measured latency, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u32>,
    /// Seconds the channel has been up
    pub uptime_s: i64,
    /// Quality score of the link
    pub connection_quality: f64,
}

/// A node's role in the mesh, by live-link count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshRole {
    /// ≥ 5 live links
    Hub,
    /// ≥ 3 live links
    Relay,
    /// ≥ 1 live link
    Leaf,
    /// No live links
    Isolated,
}

impl MeshRole {
    fn classify(links: usize) -> Self {
        match links {
            0 => MeshRole::Isolated,
            1..=2 => MeshRole::Leaf,
            3..=4 => MeshRole::Relay,
            _ => MeshRole::Hub,
        }
    }
}

/// Duplicate-cache key parts for one sighted announcement
struct SightedAnnouncement {
    signature: Option<String>,
    nonce: String,
    timestamp: i64,
    sighted_at: i64,
}

/// The announcement fabric (M3)
pub struct AnnouncementFabric {
    identity: Arc<IdentityManager>,
    router: Arc<FloodRouter>,
    auth: Arc<ReconnectAuth>,
    store: Arc<PeerStore>,
    registry: Arc<PeerRegistry>,
    config: AnnounceConfig,
    reconnect_tx: mpsc::Sender<ReconnectRequest>,
    recent: Mutex<HashMap<String, Vec<SightedAnnouncement>>>,
    last_scheduled: Mutex<HashMap<String, i64>>,
    pending_pings: Mutex<HashMap<String, (String, i64)>>,
    security_drops: AtomicU64,
    heartbeat_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AnnouncementFabric {
    /// Build the fabric and wire its handlers into the router
    pub fn new(
        identity: Arc<IdentityManager>,
        router: Arc<FloodRouter>,
        auth: Arc<ReconnectAuth>,
        store: Arc<PeerStore>,
        registry: Arc<PeerRegistry>,
        reconnect_tx: mpsc::Sender<ReconnectRequest>,
        config: AnnounceConfig,
    ) -> Arc<Self> {
        let fabric = Arc::new(Self {
            identity,
            router,
            auth,
            store,
            registry,
            config,
            reconnect_tx,
            recent: Mutex::new(HashMap::new()),
            last_scheduled: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            security_drops: AtomicU64::new(0),
            heartbeat_task: Mutex::new(None),
        });
        fabric.register_handlers();
        fabric
    }

    fn register_handlers(self: &Arc<Self>) {
        for msg_type in [
            MsgType::PeerAnnouncement,
            MsgType::IpChangeAnnouncement,
            MsgType::PeerIntroduction,
            MsgType::Ping,
            MsgType::Pong,
            MsgType::TopologyRequest,
        ] {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.router.register(
                msg_type,
                Arc::new(move |delivery| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(fabric) = weak.upgrade() {
                            fabric.dispatch(msg_type, delivery).await;
                        }
                    })
                }),
            );
        }
    }

    async fn dispatch(self: &Arc<Self>, msg_type: MsgType, delivery: Delivery) {
        match msg_type {
            MsgType::PeerAnnouncement | MsgType::IpChangeAnnouncement => {
                self.handle_announcement(delivery).await;
            }
            MsgType::PeerIntroduction => self.handle_introduction(delivery).await,
            MsgType::Ping => self.handle_ping(delivery).await,
            MsgType::Pong => self.handle_pong(delivery).await,
            MsgType::TopologyRequest => self.handle_topology_request(delivery).await,
            _ => {}
        }
    }

    /// Announcements this fabric rejected for security reasons
    pub fn security_drops(&self) -> u64 {
        self.security_drops.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Emit a signed presence announcement
    pub async fn announce(&self, reason: AnnounceReason) -> Result<()> {
        let connected = self.registry.live_peer_ids();
        let hint = ConnectionHint {
            preferred_relay: self.best_relay(),
            connected_peers_sample: connected.iter().take(3).cloned().collect(),
        };
        let challenge = match reason {
            AnnounceReason::IpChange => {
                use rand::RngCore;
                let mut bytes = [0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                Some(hex::encode(bytes))
            }
            _ => None,
        };
        let announcement = self
            .auth
            .create_announcement(
                reason,
                AnnouncementDraft {
                    connected_peers: connected,
                    connection_hint: Some(hint),
                    challenge,
                },
            )
            .await?;

        let (msg_type, ttl) = match reason {
            AnnounceReason::IpChange => (MsgType::IpChangeAnnouncement, self.config.ip_change_ttl),
            _ => (MsgType::PeerAnnouncement, self.config.announce_ttl),
        };
        let envelope = self.router.create(
            msg_type,
            serde_json::to_value(&announcement)?,
            CreateOptions { ttl: Some(ttl), ..Default::default() },
        );
        let sent = self.router.emit(&envelope).await;
        info!(reason = reason.as_str(), sent, "Announced presence");
        Ok(())
    }

    /// Emit an ip-change announcement with elevated TTL
    pub async fn announce_ip_change(&self) -> Result<()> {
        self.announce(AnnounceReason::IpChange).await
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_announcement(self: &Arc<Self>, delivery: Delivery) {
        // Payload may be a bare announcement or a relay chain.
        let (announcement, relayed) =
            match serde_json::from_value::<RelayEnvelope>(delivery.envelope.payload.clone()) {
                Ok(relay) => (relay.original.innermost().clone(), Some(relay)),
                Err(_) => {
                    match serde_json::from_value::<Announcement>(delivery.envelope.payload.clone())
                    {
                        Ok(announcement) => (announcement, None),
                        Err(e) => {
                            debug!("Unparseable announcement payload: {}", e);
                            return;
                        }
                    }
                }
            };

        // 1. Never react to our own beacons.
        if announcement.peer_id == self.identity.peer_id() {
            return;
        }

        // 2. Duplicate suppression before any crypto.
        if self.is_recent_duplicate(&announcement) {
            trace!(peer_id = %announcement.peer_id, "Duplicate announcement");
            return;
        }
        self.remember(&announcement);

        // 3. Authenticate.
        let verification = match &relayed {
            Some(relay) => self.auth.verify_relay(relay).await,
            None => self.auth.verify_announcement(&announcement).await,
        };
        match verification {
            Ok(Verification::Valid) => {}
            Ok(Verification::Invalid(reason)) => {
                self.security_drops.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer_id = %announcement.peer_id,
                    reason = reason.as_str(),
                    "Dropped unverifiable announcement"
                );
                return;
            }
            Err(e) => {
                warn!("Announcement verification error: {}", e);
                return;
            }
        }

        // The beacon is authentic: remember we saw this peer.
        if let Err(e) = self
            .store
            .update_last_seen(&announcement.peer_id, Some(&announcement.display_name))
            .await
        {
            warn!("Failed to record peer sighting: {}", e);
        }

        // 4. Policy.
        if !self.should_reconnect(&announcement.peer_id).await {
            return;
        }

        // 5. Deterministic tie-break: only the lower id initiates.
        if !self.should_initiate(&announcement.peer_id) {
            debug!(peer_id = %announcement.peer_id, "Higher id waits for the peer to initiate");
            return;
        }

        // 6. Schedule after a jittered delay (halved for ip-change).
        self.schedule_reconnect(announcement).await;
    }

    fn is_recent_duplicate(&self, announcement: &Announcement) -> bool {
        let recent = self.recent.lock();
        let Some(sightings) = recent.get(&announcement.peer_id) else {
            return false;
        };
        sightings.iter().any(|s| {
            (announcement.signature.is_some() && s.signature == announcement.signature)
                || s.nonce == announcement.nonce
                || (announcement.timestamp - s.timestamp).abs() <= self.config.duplicate_window_ms
        })
    }

    fn remember(&self, announcement: &Announcement) {
        let now = crate::time::now_timestamp_millis();
        let mut recent = self.recent.lock();
        let sightings = recent.entry(announcement.peer_id.clone()).or_default();
        sightings.retain(|s| now - s.sighted_at <= 10 * 60 * 1000);
        sightings.push(SightedAnnouncement {
            signature: announcement.signature.clone(),
            nonce: announcement.nonce.clone(),
            timestamp: announcement.timestamp,
            sighted_at: now,
        });
    }

    /// Policy gate for reacting to a peer's beacon
    pub async fn should_reconnect(&self, peer_id: &str) -> bool {
        if self.registry.is_connected(peer_id) {
            return false;
        }
        if self.registry.live_count() >= self.config.max_connections {
            debug!(peer_id, "Connection budget exhausted");
            return false;
        }
        let now = crate::time::now_timestamp_millis();
        if let Ok(Some(record)) = self.store.get(peer_id).await {
            if record.is_blacklisted(now) {
                return false;
            }
        }
        if let Some(&last) = self.last_scheduled.lock().get(peer_id) {
            if now - last < self.config.reconnect_cooldown_ms {
                return false;
            }
        }
        true
    }

    /// Tie-break: true iff this node's id orders strictly below the
    /// peer's. Both sides reach the opposite answer with no coordination.
    pub fn should_initiate(&self, peer_id: &str) -> bool {
        self.identity.peer_id() < peer_id
    }

    async fn schedule_reconnect(self: &Arc<Self>, announcement: Announcement) {
        let mut delay_ms = rand::thread_rng()
            .gen_range(self.config.schedule_delay_min_ms..=self.config.schedule_delay_max_ms);
        if announcement.reason == AnnounceReason::IpChange {
            delay_ms /= 2;
        }
        self.last_scheduled
            .lock()
            .insert(announcement.peer_id.clone(), crate::time::now_timestamp_millis());

        let request = ReconnectRequest {
            peer_id: announcement.peer_id,
            display_name: announcement.display_name,
            reason: announcement.reason,
            hint: announcement.connection_hint,
        };
        debug!(peer_id = %request.peer_id, delay_ms, "Scheduling reconnect");

        let tx = self.reconnect_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if tx.send(request).await.is_err() {
                debug!("Orchestrator gone; reconnect request dropped");
            }
        });
    }

    // ------------------------------------------------------------------
    // Relay selection
    // ------------------------------------------------------------------

    /// The best-scored live peer to name as preferred relay
    ///
    /// Base 100, minus up to 50 for latency, plus candidate-class and
    /// uptime bonuses.
    pub fn best_relay(&self) -> Option<String> {
        let now = crate::time::now_timestamp_millis();
        self.registry
            .handles()
            .into_iter()
            .map(|handle| {
                let mut score = 100.0;
                if let Some(latency) = handle.latency_ms {
                    score -= (f64::from(latency) / 10.0).min(50.0);
                }
                score += match handle.connection_type {
                    Some(ConnectionType::Host) => 20.0,
                    Some(ConnectionType::Srflx) => 10.0,
                    _ => 0.0,
                };
                let uptime_minutes = (now - handle.connected_at) as f64 / 60_000.0;
                score += uptime_minutes.min(20.0);
                (handle.peer_id, score)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(peer_id, _)| peer_id)
    }

    // ------------------------------------------------------------------
    // Introductions
    // ------------------------------------------------------------------

    async fn handle_introduction(self: &Arc<Self>, delivery: Delivery) {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Introduction {
            introduced_peer_id: String,
            introduced_name: String,
            #[allow(dead_code)]
            introduction_id: String,
            #[allow(dead_code)]
            connection_quality: Option<f64>,
        }
        let Ok(intro) = serde_json::from_value::<Introduction>(delivery.envelope.payload.clone())
        else {
            return;
        };
        if intro.introduced_peer_id == self.identity.peer_id() {
            return;
        }
        if !self.should_reconnect(&intro.introduced_peer_id).await
            || !self.should_initiate(&intro.introduced_peer_id)
        {
            return;
        }
        debug!(peer_id = %intro.introduced_peer_id, "Acting on peer introduction");
        self.last_scheduled
            .lock()
            .insert(intro.introduced_peer_id.clone(), crate::time::now_timestamp_millis());
        let _ = self
            .reconnect_tx
            .send(ReconnectRequest {
                peer_id: intro.introduced_peer_id,
                display_name: intro.introduced_name,
                reason: AnnounceReason::Rejoin,
                hint: Some(ConnectionHint {
                    preferred_relay: Some(delivery.envelope.sender_id.clone()),
                    connected_peers_sample: Vec::new(),
                }),
            })
            .await;
    }

    // ------------------------------------------------------------------
    // Latency probes
    // ------------------------------------------------------------------

    /// Send a ping to a live peer; the pong updates its latency
    pub async fn send_ping(&self, peer_id: &str) -> Result<()> {
        let ping_id = uuid::Uuid::new_v4().to_string();
        self.pending_pings.lock().insert(
            ping_id.clone(),
            (peer_id.to_string(), crate::time::now_timestamp_millis()),
        );
        let envelope = self.router.create(
            MsgType::Ping,
            serde_json::json!({ "pingId": ping_id }),
            CreateOptions {
                target_peer_id: Some(peer_id.to_string()),
                routing_hint: Some(RoutingHint::Relay),
                ..Default::default()
            },
        );
        self.router.emit(&envelope).await;
        Ok(())
    }

    async fn handle_ping(self: &Arc<Self>, delivery: Delivery) {
        let Some(ping_id) = delivery.envelope.payload.get("pingId").and_then(|v| v.as_str())
        else {
            return;
        };
        let envelope = self.router.create(
            MsgType::Pong,
            serde_json::json!({ "pingId": ping_id }),
            CreateOptions {
                target_peer_id: Some(delivery.envelope.sender_id.clone()),
                routing_hint: Some(RoutingHint::Relay),
                ..Default::default()
            },
        );
        self.router.emit(&envelope).await;
    }

    async fn handle_pong(self: &Arc<Self>, delivery: Delivery) {
        let Some(ping_id) = delivery.envelope.payload.get("pingId").and_then(|v| v.as_str())
        else {
            return;
        };
        let Some((peer_id, sent_at)) = self.pending_pings.lock().remove(ping_id) else {
            return;
        };
        let rtt = (crate::time::now_timestamp_millis() - sent_at).max(0) as u32;
        self.registry.update_stats(
            &peer_id,
            CandidatePairStats { connection_type: None, latency_ms: Some(rtt) },
        );
        if let Err(e) = self
            .store
            .update_connection_quality(
                &peer_id,
                QualityUpdate { latency_ms: Some(rtt), ..Default::default() },
            )
            .await
        {
            warn!("Failed to record latency: {}", e);
        }
        trace!(peer_id = %peer_id, rtt, "Latency probe completed");
    }

    // ------------------------------------------------------------------
    // Topology sampling
    // ------------------------------------------------------------------

    async fn handle_topology_request(self: &Arc<Self>, delivery: Delivery) {
        let request_id = delivery
            .envelope
            .payload
            .get("requestId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let now = crate::time::now_timestamp_millis();
        let handles = self.registry.handles();

        let mut connected_peers = Vec::with_capacity(handles.len());
        for handle in &handles {
            let connection_quality = match self.store.get(&handle.peer_id).await {
                Ok(Some(record)) => quality_score(&record.connection_quality),
                _ => 0.0,
            };
            connected_peers.push(TopologyPeer {
                peer_id: handle.peer_id.clone(),
                display_name: handle.display_name.clone(),
                latency: handle.latency_ms,
                uptime_s: (now - handle.connected_at) / 1000,
                connection_quality,
            });
        }

        let envelope = self.router.create(
            MsgType::TopologyResponse,
            serde_json::json!({
                "requestId": request_id,
                "responderId": self.identity.peer_id(),
                "connectedPeers": connected_peers,
                "metadata": {
                    "total_connections": handles.len(),
                    "role": MeshRole::classify(handles.len()),
                },
            }),
            CreateOptions {
                target_peer_id: Some(delivery.envelope.sender_id.clone()),
                routing_hint: Some(RoutingHint::Relay),
                ..Default::default()
            },
        );
        self.router.emit(&envelope).await;
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// Start the periodic heartbeat (announces iff ≥ 1 live peer)
    pub fn start(self: &Arc<Self>) {
        let mut task = self.heartbeat_task.lock();
        if task.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        *task = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(fabric) = weak.upgrade() else { break };
                if fabric.registry.live_count() >= 1 {
                    if let Err(e) = fabric.announce(AnnounceReason::Periodic).await {
                        warn!("Heartbeat announcement failed: {}", e);
                    }
                }
            }
        }));
    }

    /// Stop the heartbeat
    pub fn stop(&self) {
        if let Some(task) = self.heartbeat_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for AnnouncementFabric {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================
