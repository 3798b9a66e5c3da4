//! # Cascading Reconnection Orchestrator Module
//!
//! Decides how to get back onto the mesh and runs the per-peer fallback
//! ladder.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    RECONNECTION STRATEGY                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  reconnect_to_mesh()                                                   │
//! │        │  sample live peers 3× / 500 ms                                │
//! │        ▼                                                                │
//! │   0 live ──────────────► COLD START (40 s budget)                      │
//! │        │                   L1  recent peers, direct, 10 s each         │
//! │        │                   L2  knock protocol (advisory)               │
//! │        │                   L3  any known peer ≤ 24 h, 15 s each        │
//! │        │                   L4  manual-pairing event                    │
//! │        │                                                                │
//! │   ≥1 live ─────────────► WARM START                                    │
//! │                            announce(rejoin), rank candidates,          │
//! │                            per-peer ladder:                            │
//! │                              A. cached signalling (8 s, low yield)     │
//! │                              B. mesh-relayed signalling (20 s)         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The orchestrator is the single writer of the peer registry and the
//! sole owner of pending-attempt state. It consumes reconnect requests
//! from the announcement fabric over a channel, never the other way
//! around.

mod mesh;
mod pending;

pub use mesh::RejectReason;
pub use pending::{
    LadderSignal, PathQueryState, PathResponseEntry, PendingReconnect, ReconnectMethod,
    ReconnectState, ReconnectStats,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::announce::{AnnouncementFabric, ReconnectRequest};
use crate::auth::{AnnounceReason, IdentityExchange, ReconnectAuth};
use crate::error::{Error, Result};
use crate::identity::IdentityManager;
use crate::peers::{cold_start_score, CandidateQuery, PeerQuery, PeerRecord, PeerSortKey, PeerStore, QualityUpdate, SortOrder};
use crate::router::{Envelope, FloodRouter};
use crate::storage::{keys, Kv};
use crate::transport::{
    IceConfig, LivePeerView, PeerHandle, PeerRegistry, PeerTransport, TransportEvent, TransportFactory,
};

/// Cold-start tunables
#[derive(Debug, Clone)]
pub struct ColdStartConfig {
    /// `last_connected` window for layer 1 (ms)
    pub recent_window_ms: i64,
    /// Parallel attempts in layer 1
    pub layer1_limit: usize,
    /// Per-attempt timeout in layer 1 (ms)
    pub layer1_timeout_ms: u64,
    /// Knock targets in layer 2
    pub knock_candidates: usize,
    /// Knock timeout (ms)
    pub knock_timeout_ms: u64,
    /// `last_seen` window for layer 3 (ms)
    pub layer3_window_ms: i64,
    /// Parallel attempts in layer 3
    pub layer3_limit: usize,
    /// Per-attempt timeout in layer 3 (ms)
    pub layer3_timeout_ms: u64,
    /// Whole cold start budget (ms)
    pub total_deadline_ms: u64,
    /// Settle delay before the recovery announcement (ms)
    pub recovery_grace_ms: u64,
}

impl Default for ColdStartConfig {
    fn default() -> Self {
        Self {
            recent_window_ms: 5 * 60 * 1000,
            layer1_limit: 5,
            layer1_timeout_ms: 10_000,
            knock_candidates: 3,
            knock_timeout_ms: 5_000,
            layer3_window_ms: 24 * 60 * 60 * 1000,
            layer3_limit: 10,
            layer3_timeout_ms: 15_000,
            total_deadline_ms: 40_000,
            recovery_grace_ms: 3_000,
        }
    }
}

/// Warm-start tunables
#[derive(Debug, Clone)]
pub struct WarmStartConfig {
    /// Delay before the rejoin announcement (ms)
    pub initial_delay_ms: u64,
    /// Candidates pulled from the store
    pub candidate_limit: usize,
    /// Ladder runs per warm start
    pub ladder_cap: usize,
    /// Stop once this many connections exist (None = unbounded)
    pub early_exit: Option<usize>,
}

impl Default for WarmStartConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            candidate_limit: 20,
            ladder_cap: 10,
            early_exit: None,
        }
    }
}

/// Fallback-ladder tunables
#[derive(Debug, Clone)]
pub struct LadderConfig {
    /// Step A budget (ms)
    pub direct_timeout_ms: u64,
    /// Step B budget (ms)
    pub mesh_deadline_ms: u64,
    /// Path-response collection window inside step B (ms)
    pub path_collect_ms: u64,
    /// TTL for path queries
    pub path_query_ttl: u32,
    /// TTL for targeted replies (responses, offers, answers)
    pub targeted_ttl: u32,
    /// How long settled path queries stay around for diagnostics (ms)
    pub query_linger_ms: u64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            direct_timeout_ms: 8_000,
            mesh_deadline_ms: 20_000,
            path_collect_ms: 5_000,
            path_query_ttl: 7,
            targeted_ttl: 10,
            query_linger_ms: 10_000,
        }
    }
}

/// Orchestrator tunables
#[derive(Debug, Clone, Default)]
pub struct ReconnectConfig {
    /// Cold-start settings
    pub cold: ColdStartConfig,
    /// Warm-start settings
    pub warm: WarmStartConfig,
    /// Ladder settings
    pub ladder: LadderConfig,
    /// Periodic-loop period (ms)
    pub periodic_interval_ms: u64,
    /// Ladder runs per periodic tick
    pub periodic_batch: usize,
    /// Cap on simultaneously pending attempts
    pub max_concurrent_attempts: usize,
    /// Live-peer sampling interval on entry (ms)
    pub live_sample_interval_ms: u64,
}

impl ReconnectConfig {
    fn normalized(mut self) -> Self {
        if self.periodic_interval_ms == 0 {
            self.periodic_interval_ms = 5 * 60 * 1000;
        }
        if self.periodic_batch == 0 {
            self.periodic_batch = 3;
        }
        if self.max_concurrent_attempts == 0 {
            self.max_concurrent_attempts = 10;
        }
        if self.live_sample_interval_ms == 0 {
            self.live_sample_interval_ms = 500;
        }
        self
    }
}

/// Out-of-band events for the host application
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Cold start exhausted its layers; the app should offer manual pairing
    ManualPairingRequired,
    /// A TOFU violation or similar; the operator must decide
    SecurityAlert {
        /// The peer the alert concerns
        peer_id: String,
        /// Human-readable detail
        detail: String,
    },
    /// A channel reached connected and joined the registry
    PeerConnected {
        /// The connected peer
        peer_id: String,
    },
    /// A live channel closed
    PeerDisconnected {
        /// The departed peer
        peer_id: String,
    },
    /// A ladder run gave up on a peer
    ReconnectFailed {
        /// The peer the ladder gave up on
        peer_id: String,
    },
}

/// The reconnection orchestrator (M4)
pub struct ReconnectOrchestrator {
    identity: Arc<IdentityManager>,
    router: Arc<FloodRouter>,
    auth: Arc<ReconnectAuth>,
    fabric: Arc<AnnouncementFabric>,
    store: Arc<PeerStore>,
    registry: Arc<PeerRegistry>,
    factory: Arc<dyn TransportFactory>,
    kv: Arc<dyn Kv>,
    ice: IceConfig,
    config: ReconnectConfig,
    pending: Mutex<std::collections::HashMap<String, PendingReconnect>>,
    path_queries: Mutex<std::collections::HashMap<String, PathQueryState>>,
    stats: Mutex<ReconnectStats>,
    events: broadcast::Sender<CoreEvent>,
    manual_in_progress: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReconnectOrchestrator {
    /// Build the orchestrator; call [`start`](Self::start) to wire the
    /// router handlers and background loops
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityManager>,
        router: Arc<FloodRouter>,
        auth: Arc<ReconnectAuth>,
        fabric: Arc<AnnouncementFabric>,
        store: Arc<PeerStore>,
        registry: Arc<PeerRegistry>,
        factory: Arc<dyn TransportFactory>,
        kv: Arc<dyn Kv>,
        ice: IceConfig,
        config: ReconnectConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            identity,
            router,
            auth,
            fabric,
            store,
            registry,
            factory,
            kv,
            ice,
            config: config.normalized(),
            pending: Mutex::new(std::collections::HashMap::new()),
            path_queries: Mutex::new(std::collections::HashMap::new()),
            stats: Mutex::new(ReconnectStats::default()),
            events,
            manual_in_progress: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to out-of-band core events
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ReconnectStats {
        self.stats.lock().clone()
    }

    /// Wire router handlers and start the background loops
    ///
    /// `reconnect_rx` is the request channel fed by the announcement
    /// fabric.
    pub fn start(self: &Arc<Self>, mut reconnect_rx: mpsc::Receiver<ReconnectRequest>) {
        self.register_handlers();

        let weak = Arc::downgrade(self);
        let consumer = tokio::spawn(async move {
            while let Some(request) = reconnect_rx.recv().await {
                let Some(orchestrator) = weak.upgrade() else { break };
                if orchestrator.registry.is_connected(&request.peer_id) {
                    continue;
                }
                debug!(peer_id = %request.peer_id, reason = request.reason.as_str(), "Fabric-requested reconnect");
                if let Err(e) = orchestrator
                    .run_ladder(&request.peer_id, &request.display_name)
                    .await
                {
                    debug!(peer_id = %request.peer_id, "Requested reconnect failed: {}", e);
                }
            }
        });

        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.periodic_interval_ms);
        let periodic = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else { break };
                orchestrator.periodic_tick().await;
            }
        });

        self.tasks.lock().extend([consumer, periodic]);
    }

    /// Stop the background loops
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Top-level entry
    // ------------------------------------------------------------------

    /// Re-establish mesh connectivity after a start or wake
    ///
    /// Samples the live-peer count three times, then runs a cold or warm
    /// start. Returns how many connections the pass established.
    pub async fn reconnect_to_mesh(self: &Arc<Self>) -> Result<usize> {
        self.manual_in_progress.store(true, Ordering::SeqCst);
        let result = self.reconnect_to_mesh_inner().await;
        self.manual_in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn reconnect_to_mesh_inner(self: &Arc<Self>) -> Result<usize> {
        let mut live = self.registry.live_count();
        for _ in 0..2 {
            if live > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.live_sample_interval_ms)).await;
            live = self.registry.live_count();
        }

        if live == 0 {
            info!("Zero live peers: entering cold start");
            let connected = self.cold_start().await?;
            if connected > 0 {
                // The mesh is back; pick up the remaining desired peers
                // the warm way.
                let more = self.warm_start().await.unwrap_or(0);
                Ok(connected + more)
            } else {
                Ok(0)
            }
        } else {
            info!(live, "Live peers present: warm start");
            self.warm_start().await
        }
    }

    // ------------------------------------------------------------------
    // Cold start
    // ------------------------------------------------------------------

    /// Run the cold-start layers under the total deadline
    ///
    /// Returns the number of connections established. On success the
    /// recovery announcement is emitted after a grace delay; on total
    /// failure the manual-pairing escalation fires (layer 4).
    pub async fn cold_start(self: &Arc<Self>) -> Result<usize> {
        let deadline = Duration::from_millis(self.config.cold.total_deadline_ms);
        let connected = tokio::time::timeout(deadline, self.cold_start_layers())
            .await
            .unwrap_or(0);

        if connected > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.cold.recovery_grace_ms)).await;
            if let Err(e) = self.fabric.announce(AnnounceReason::ColdStartRecovery).await {
                warn!("Recovery announcement failed: {}", e);
            }
            return Ok(connected);
        }

        // Layer 4: manual pairing, if the host ever configured a secret.
        match self.kv.get(keys::PAIRING_SECRET).await {
            Ok(Some(_)) => {
                info!("Cold start exhausted; escalating to manual pairing");
                let _ = self.events.send(CoreEvent::ManualPairingRequired);
            }
            _ => {
                info!("Cold start exhausted; no pairing secret configured");
            }
        }
        Ok(0)
    }

    async fn cold_start_layers(self: &Arc<Self>) -> usize {
        let now = crate::time::now_timestamp_millis();

        // Layer 1: peers we were connected to minutes ago.
        let mut recent: Vec<PeerRecord> = self
            .store
            .query(&PeerQuery {
                sort_by: PeerSortKey::LastConnected,
                order: SortOrder::Descending,
                limit: None,
                min_quality: None,
                max_age_ms: None,
                exclude_blacklisted: true,
            })
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| {
                r.ms_since_connected(now)
                    .map(|age| age <= self.config.cold.recent_window_ms)
                    .unwrap_or(false)
            })
            .collect();
        recent.sort_by(|a, b| {
            cold_start_score(b, now)
                .partial_cmp(&cold_start_score(a, now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        recent.truncate(self.config.cold.layer1_limit);

        if !recent.is_empty() {
            debug!(candidates = recent.len(), "Cold start layer 1: recent peers");
            let connected = self
                .attempt_direct_batch(
                    recent.clone(),
                    self.config.cold.layer1_timeout_ms,
                    ReconnectMethod::RecentPeers,
                )
                .await;
            if connected > 0 {
                return connected;
            }

            // Layer 2: knock protocol (experimental). Minimum-cost
            // attempts purely to wake NAT bindings; results are advisory.
            let knock_targets: Vec<PeerRecord> = recent
                .into_iter()
                .take(self.config.cold.knock_candidates)
                .collect();
            debug!(targets = knock_targets.len(), "Cold start layer 2: knock");
            let knocks = knock_targets
                .into_iter()
                .map(|record| self.clone().attempt_knock(record));
            futures::future::join_all(knocks).await;
        }

        // Layer 3: anyone we have seen within a day.
        let known = self
            .store
            .reconnection_candidates(&CandidateQuery {
                limit: self.config.cold.layer3_limit,
                max_age_ms: Some(self.config.cold.layer3_window_ms),
                min_score: None,
                exclude: Vec::new(),
            })
            .await
            .unwrap_or_default();
        if known.is_empty() {
            return 0;
        }
        debug!(candidates = known.len(), "Cold start layer 3: all known peers");
        self.attempt_direct_batch(
            known,
            self.config.cold.layer3_timeout_ms,
            ReconnectMethod::AllKnownPeers,
        )
        .await
    }

    async fn attempt_direct_batch(
        self: &Arc<Self>,
        records: Vec<PeerRecord>,
        timeout_ms: u64,
        method: ReconnectMethod,
    ) -> usize {
        let attempts = records
            .into_iter()
            .map(|record| self.clone().attempt_direct(record, timeout_ms, method));
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    /// One direct reconnection attempt from cached signalling
    async fn attempt_direct(
        self: Arc<Self>,
        record: PeerRecord,
        timeout_ms: u64,
        method: ReconnectMethod,
    ) -> bool {
        let started = crate::time::now_timestamp_millis();
        let Ok(transport) = self.factory.create(true, &self.ice) else {
            return false;
        };
        let mut events = transport.subscribe();

        let now = crate::time::now_timestamp_millis();
        for candidate in record.fresh_cached_candidates(now) {
            if let Err(e) = transport.signal(candidate.blob.clone()).await {
                debug!(peer_id = %record.peer_id, "Cached signalling rejected: {}", e);
            }
        }

        let connected = wait_for_connect(&mut events, Duration::from_millis(timeout_ms)).await;
        if connected {
            self.finalize_connection(&record.peer_id, &record.display_name, transport, method, started)
                .await;
            true
        } else {
            transport.close().await;
            self.record_attempt_failure(&record.peer_id).await;
            false
        }
    }

    /// Layer-2 knock: fire cached signalling and walk away
    async fn attempt_knock(self: Arc<Self>, record: PeerRecord) {
        let Ok(transport) = self.factory.create(true, &self.ice) else {
            return;
        };
        let now = crate::time::now_timestamp_millis();
        for candidate in record.fresh_cached_candidates(now) {
            let _ = transport.signal(candidate.blob.clone()).await;
        }
        tokio::time::sleep(Duration::from_millis(self.config.cold.knock_timeout_ms)).await;
        transport.close().await;
    }

    // ------------------------------------------------------------------
    // Warm start
    // ------------------------------------------------------------------

    /// Announce, rank candidates, and run the ladder over them
    pub async fn warm_start(self: &Arc<Self>) -> Result<usize> {
        tokio::time::sleep(Duration::from_millis(self.config.warm.initial_delay_ms)).await;
        if let Err(e) = self.fabric.announce(AnnounceReason::Rejoin).await {
            warn!("Rejoin announcement failed: {}", e);
        }

        let candidates = self
            .store
            .reconnection_candidates(&CandidateQuery {
                limit: self.config.warm.candidate_limit,
                max_age_ms: None,
                min_score: None,
                exclude: self.registry.live_peer_ids(),
            })
            .await?;

        let mut connected = 0;
        for record in candidates.into_iter().take(self.config.warm.ladder_cap) {
            if let Some(goal) = self.config.warm.early_exit {
                if connected >= goal {
                    break;
                }
            }
            match self.run_ladder(&record.peer_id, &record.display_name).await {
                Ok(()) => connected += 1,
                Err(e) => debug!(peer_id = %record.peer_id, "Ladder failed: {}", e),
            }
        }
        Ok(connected)
    }

    // ------------------------------------------------------------------
    // Per-peer ladder
    // ------------------------------------------------------------------

    /// Run the fallback ladder toward one peer: cached-direct, then
    /// mesh-relayed signalling, in that order and never concurrently
    pub async fn run_ladder(self: &Arc<Self>, peer_id: &str, display_name: &str) -> Result<()> {
        if peer_id == self.identity.peer_id() {
            return Err(Error::Internal("Refusing to reconnect to self".into()));
        }
        if self.registry.is_connected(peer_id) {
            return Err(Error::AlreadyConnected(peer_id.to_string()));
        }
        if self.has_pending_for(peer_id) {
            return Err(Error::TooManyConcurrentAttempts);
        }
        if self.pending.lock().len() >= self.config.max_concurrent_attempts {
            return Err(Error::TooManyConcurrentAttempts);
        }

        // Step A: rehydrate from cached signalling. Low yield, cheap.
        if let Ok(Some(record)) = self.store.get(peer_id).await {
            let now = crate::time::now_timestamp_millis();
            if !record.fresh_cached_candidates(now).is_empty()
                && self
                    .clone()
                    .attempt_direct(
                        record,
                        self.config.ladder.direct_timeout_ms,
                        ReconnectMethod::CachedDirect,
                    )
                    .await
            {
                return Ok(());
            }
        }

        // The peer may have connected to us while step A ran.
        if self.registry.is_connected(peer_id) {
            return Ok(());
        }

        // Step B: mesh-relayed signalling. Slow, high yield.
        let result = self.step_mesh_relay(peer_id, display_name).await;
        if result.is_err() {
            let _ = self
                .events
                .send(CoreEvent::ReconnectFailed { peer_id: peer_id.to_string() });
        }
        result
    }

    // ------------------------------------------------------------------
    // Periodic loop
    // ------------------------------------------------------------------

    async fn periodic_tick(self: &Arc<Self>) {
        if self.manual_in_progress.load(Ordering::SeqCst) {
            debug!("Periodic reconnect skipped: manual pass in progress");
            return;
        }
        if self.registry.live_count() == 0 {
            return;
        }
        let candidates = self
            .store
            .reconnection_candidates(&CandidateQuery {
                limit: self.config.periodic_batch,
                max_age_ms: None,
                min_score: None,
                exclude: self.registry.live_peer_ids(),
            })
            .await
            .unwrap_or_default();
        for record in candidates {
            if let Err(e) = self.run_ladder(&record.peer_id, &record.display_name).await {
                debug!(peer_id = %record.peer_id, "Periodic ladder failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Network change
    // ------------------------------------------------------------------

    /// React to a host network-change signal (LTE↔Wi-Fi and friends)
    ///
    /// Announces the change with elevated TTL, then pauses to let it
    /// propagate; remote peers run their ladders toward us.
    pub async fn on_network_change(&self) -> Result<()> {
        self.fabric.announce_ip_change().await?;
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Channel adoption & shared plumbing
    // ------------------------------------------------------------------

    /// Adopt an externally established channel (manual pairing)
    pub async fn adopt_external_channel(
        self: &Arc<Self>,
        peer_id: &str,
        display_name: &str,
        transport: Arc<dyn PeerTransport>,
    ) {
        let started = crate::time::now_timestamp_millis();
        self.finalize_connection(peer_id, display_name, transport, ReconnectMethod::External, started)
            .await;
    }

    /// Register a connected transport: registry, event pump, identity
    /// exchange, persistence, stats
    pub(crate) async fn finalize_connection(
        self: &Arc<Self>,
        peer_id: &str,
        display_name: &str,
        transport: Arc<dyn PeerTransport>,
        method: ReconnectMethod,
        started_ms: i64,
    ) {
        let now = crate::time::now_timestamp_millis();
        let pair_stats = transport.stats().await.unwrap_or_default();

        self.registry.insert(PeerHandle {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
            transport: transport.clone(),
            connected_at: now,
            latency_ms: pair_stats.latency_ms,
            connection_type: pair_stats.connection_type,
            transient: false,
        });
        self.spawn_channel_pump(peer_id.to_string(), transport.clone());

        // First frame on a fresh channel: who we are.
        match self.auth.identity_exchange_message() {
            Ok(exchange) => match serde_json::to_vec(&exchange) {
                Ok(bytes) => {
                    if let Err(e) = transport.send(bytes).await {
                        warn!(peer_id, "Identity exchange send failed: {}", e);
                    }
                }
                Err(e) => warn!("Identity exchange serialization failed: {}", e),
            },
            Err(e) => warn!("Identity exchange build failed: {}", e),
        }

        if let Err(e) = self.store.mark_connected(peer_id, Some(display_name)).await {
            warn!(peer_id, "Failed to persist connection: {}", e);
        }
        if let Err(e) = self
            .store
            .update_connection_quality(
                peer_id,
                QualityUpdate {
                    attempt: Some(true),
                    latency_ms: pair_stats.latency_ms,
                    connection_type: pair_stats.connection_type,
                    ..Default::default()
                },
            )
            .await
        {
            warn!(peer_id, "Failed to record quality: {}", e);
        }

        let duration = (now - started_ms).max(0) as u64;
        self.stats.lock().record_success(method, duration);
        let _ = self
            .events
            .send(CoreEvent::PeerConnected { peer_id: peer_id.to_string() });
        info!(peer_id, method = method.as_str(), duration_ms = duration, "Peer connected");
    }

    fn spawn_channel_pump(self: &Arc<Self>, peer_id: String, transport: Arc<dyn PeerTransport>) {
        let weak = Arc::downgrade(self);
        let mut events = transport.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Data(bytes)) => {
                        let Some(orchestrator) = weak.upgrade() else { break };
                        orchestrator.handle_channel_data(&peer_id, &bytes).await;
                    }
                    Ok(TransportEvent::Close) | Ok(TransportEvent::Error(_)) => {
                        if let Some(orchestrator) = weak.upgrade() {
                            orchestrator.handle_channel_closed(&peer_id).await;
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(peer_id = %peer_id, skipped, "Channel pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if let Some(orchestrator) = weak.upgrade() {
                            orchestrator.handle_channel_closed(&peer_id).await;
                        }
                        break;
                    }
                }
            }
        });
    }

    async fn handle_channel_data(self: &Arc<Self>, peer_id: &str, bytes: &[u8]) {
        if let Ok(envelope) = Envelope::from_bytes(bytes) {
            self.router.route(envelope, Some(peer_id)).await;
            return;
        }
        if let Ok(exchange) = serde_json::from_slice::<IdentityExchange>(bytes) {
            match self.auth.handle_identity_exchange(&exchange).await {
                Ok(outcome) => {
                    let _ = self
                        .store
                        .update_peer_public_key(&outcome.peer_id, outcome.public_key.clone())
                        .await;
                    let _ = self
                        .store
                        .update_shared_secret(&outcome.peer_id, &outcome.shared_secret)
                        .await;
                }
                Err(Error::KeyMismatch { peer_id: offender }) => {
                    warn!(peer_id = %offender, "TOFU violation on live channel");
                    let _ = self.events.send(CoreEvent::SecurityAlert {
                        peer_id: offender.clone(),
                        detail: "Presented signing key differs from the pinned key".into(),
                    });
                    if let Some(handle) = self.registry.remove(&offender) {
                        handle.transport.close().await;
                    }
                }
                Err(e) => {
                    debug!(peer_id, "Identity exchange rejected: {}", e);
                }
            }
            return;
        }
        debug!(peer_id, "Unrecognized channel frame");
    }

    async fn handle_channel_closed(self: &Arc<Self>, peer_id: &str) {
        let Some(handle) = self.registry.remove(peer_id) else {
            return;
        };
        let uptime_s =
            ((crate::time::now_timestamp_millis() - handle.connected_at) / 1000).max(0) as f64;
        if let Err(e) = self
            .store
            .update_peer(peer_id, None, |record| {
                record.connection_quality.record_uptime(uptime_s);
            })
            .await
        {
            warn!(peer_id, "Failed to record uptime: {}", e);
        }
        let _ = self
            .events
            .send(CoreEvent::PeerDisconnected { peer_id: peer_id.to_string() });
        info!(peer_id, uptime_s, "Peer disconnected");
    }

    async fn record_attempt_failure(self: &Arc<Self>, peer_id: &str) {
        if let Err(e) = self.store.increment_reconnection_attempts(peer_id).await {
            warn!(peer_id, "Failed to count attempt: {}", e);
        }
        self.stats.lock().record_failure();
    }

    fn has_pending_for(&self, peer_id: &str) -> bool {
        self.pending
            .lock()
            .values()
            .any(|p| p.target_peer_id == peer_id && !p.state.is_terminal())
    }
}

impl Drop for ReconnectOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait on a transport event stream until `Connect`, a terminal event,
/// or the timeout
async fn wait_for_connect(
    events: &mut broadcast::Receiver<TransportEvent>,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Connect) => break true,
                Ok(TransportEvent::Close) | Ok(TransportEvent::Error(_)) => break false,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::announce::AnnounceConfig;
    use crate::auth::{AuthConfig, TrustStore};
    use crate::peers::{CachedCandidate, PeerStoreConfig};
    use crate::router::RouterConfig;
    use crate::storage::{load_or_init_storage_key, MemoryKv};
    use crate::transport::mock::{MockConnectBehavior, MockFactory, MockTransport};
    use crate::transport::ConnectionType;

    pub(crate) struct Harness {
        pub orchestrator: Arc<ReconnectOrchestrator>,
        pub fabric: Arc<AnnouncementFabric>,
        pub identity: Arc<IdentityManager>,
        pub auth: Arc<ReconnectAuth>,
        pub router: Arc<FloodRouter>,
        pub registry: Arc<PeerRegistry>,
        pub store: Arc<PeerStore>,
        pub factory: Arc<MockFactory>,
        pub kv: Arc<MemoryKv>,
    }

    pub(crate) async fn harness(display_name: &str, behavior: MockConnectBehavior) -> Harness {
        let kv = Arc::new(MemoryKv::new());
        let storage_key = load_or_init_storage_key(kv.as_ref()).await.unwrap();
        let identity = Arc::new(
            IdentityManager::load_or_create(kv.clone(), storage_key.clone(), display_name)
                .await
                .unwrap(),
        );
        let trust = TrustStore::load(kv.clone(), storage_key.clone()).await.unwrap();
        let auth = Arc::new(
            ReconnectAuth::load(identity.clone(), trust, kv.clone(), AuthConfig::default())
                .await
                .unwrap(),
        );
        let store = Arc::new(PeerStore::new(
            kv.clone(),
            storage_key,
            PeerStoreConfig::default(),
        ));
        let registry = Arc::new(PeerRegistry::new());
        let router = FloodRouter::new(
            identity.peer_id(),
            display_name,
            registry.clone(),
            RouterConfig::default(),
        );
        let (tx, rx) = mpsc::channel(16);
        let fabric = AnnouncementFabric::new(
            identity.clone(),
            router.clone(),
            auth.clone(),
            store.clone(),
            registry.clone(),
            tx,
            AnnounceConfig::default(),
        );
        let factory = MockFactory::new(behavior);
        let orchestrator = ReconnectOrchestrator::new(
            identity.clone(),
            router.clone(),
            auth.clone(),
            fabric.clone(),
            store.clone(),
            registry.clone(),
            factory.clone(),
            kv.clone(),
            IceConfig::default(),
            ReconnectConfig::default(),
        );
        orchestrator.start(rx);
        Harness {
            orchestrator,
            fabric,
            identity,
            auth,
            router,
            registry,
            store,
            factory,
            kv,
        }
    }

    pub(crate) fn add_live_peer(harness: &Harness, peer_id: &str) -> Arc<MockTransport> {
        let transport = MockTransport::new();
        harness.registry.insert(PeerHandle {
            peer_id: peer_id.to_string(),
            display_name: peer_id.to_uppercase(),
            transport: transport.clone(),
            connected_at: crate::time::now_timestamp_millis(),
            latency_ms: None,
            connection_type: None,
            transient: false,
        });
        transport
    }

    pub(crate) async fn seed_recent_peer(harness: &Harness, peer_id: &str, age_ms: i64) {
        let now = crate::time::now_timestamp_millis();
        let mut record = PeerRecord::new(peer_id, peer_id.to_uppercase(), now - age_ms);
        record.last_seen = now - age_ms;
        record.last_connected = Some(now - age_ms);
        record.connection_quality.connection_type = Some(ConnectionType::Host);
        record.connection_quality.record_attempt(true, now - age_ms);
        record.cached_ice_candidates = vec![CachedCandidate {
            blob: serde_json::json!({"sdp": "cached-offer", "sdp_type": "offer"}),
            cached_at: now - age_ms,
        }];
        harness.store.store(&record).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_succeeds_at_layer_one() {
        // S4: a cached host peer connected 90 s ago reconnects directly.
        let harness = harness("alice", MockConnectBehavior::ConnectImmediately).await;
        seed_recent_peer(&harness, "quentin", 90 * 1000).await;

        let connected = harness.orchestrator.reconnect_to_mesh().await.unwrap();

        assert!(connected >= 1);
        assert!(harness.registry.is_connected("quentin"));
        let stats = harness.orchestrator.stats();
        assert_eq!(stats.method_count(ReconnectMethod::RecentPeers), 1);
        assert!(stats.last_duration_ms.unwrap() < 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_escalates_to_manual_pairing() {
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        harness
            .kv
            .put(keys::PAIRING_SECRET, b"secret".to_vec())
            .await
            .unwrap();
        let mut events = harness.orchestrator.events();

        let connected = harness.orchestrator.reconnect_to_mesh().await.unwrap();
        assert_eq!(connected, 0);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event expected")
            .unwrap();
        assert!(matches!(event, CoreEvent::ManualPairingRequired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_without_pairing_secret_stays_quiet() {
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        let mut events = harness.orchestrator.events();

        let connected = harness.orchestrator.reconnect_to_mesh().await.unwrap();
        assert_eq!(connected, 0);

        assert!(
            tokio::time::timeout(Duration::from_millis(100), events.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_direct_attempt_counts_against_peer() {
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        seed_recent_peer(&harness, "quentin", 90 * 1000).await;

        harness.orchestrator.reconnect_to_mesh().await.unwrap();

        let record = harness.store.get("quentin").await.unwrap().unwrap();
        assert!(record.reconnection_attempts >= 1);
        // A peer with a prior success is never auto-blacklisted.
        assert_eq!(record.blacklist_until, None);
        assert!(harness.orchestrator.stats().failures >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_start_announces_rejoin() {
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        let buddy = add_live_peer(&harness, "buddy");

        harness.orchestrator.reconnect_to_mesh().await.unwrap();

        let announcements: Vec<_> = buddy
            .sent_json()
            .into_iter()
            .filter(|e| e["msg_type"] == "peer_announcement")
            .collect();
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0]["payload"]["reason"], "rejoin");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ladder_step_a_succeeds_with_cached_candidates() {
        let harness = harness("alice", MockConnectBehavior::ConnectImmediately).await;
        seed_recent_peer(&harness, "quentin", 30 * 1000).await;

        harness
            .orchestrator
            .run_ladder("quentin", "QUENTIN")
            .await
            .unwrap();

        assert!(harness.registry.is_connected("quentin"));
        assert_eq!(
            harness
                .orchestrator
                .stats()
                .method_count(ReconnectMethod::CachedDirect),
            1
        );
        // The transport was created as initiator.
        assert!(harness.factory.created.lock()[0].0);
    }

    #[tokio::test]
    async fn test_ladder_rejects_self_and_connected_targets() {
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        let self_id = harness.identity.peer_id().to_string();

        assert!(harness.orchestrator.run_ladder(&self_id, "me").await.is_err());

        add_live_peer(&harness, "buddy");
        assert!(matches!(
            harness.orchestrator.run_ladder("buddy", "BUDDY").await,
            Err(Error::AlreadyConnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_event_emitted_on_finalize() {
        let harness = harness("alice", MockConnectBehavior::ConnectImmediately).await;
        seed_recent_peer(&harness, "quentin", 30 * 1000).await;
        let mut events = harness.orchestrator.events();

        harness
            .orchestrator
            .run_ladder("quentin", "QUENTIN")
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event")
            .unwrap();
        assert!(matches!(event, CoreEvent::PeerConnected { ref peer_id } if peer_id == "quentin"));

        // The fresh channel got our identity exchange as its first frame.
        let (_, transport) = harness.factory.created.lock()[0].clone();
        let first: IdentityExchange =
            serde_json::from_slice(&transport.sent.lock()[0]).unwrap();
        assert_eq!(first.peer_id, harness.identity.peer_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_close_updates_store_and_events() {
        let harness = harness("alice", MockConnectBehavior::ConnectImmediately).await;
        seed_recent_peer(&harness, "quentin", 30 * 1000).await;
        harness
            .orchestrator
            .run_ladder("quentin", "QUENTIN")
            .await
            .unwrap();
        let mut events = harness.orchestrator.events();

        let (_, transport) = harness.factory.created.lock()[0].clone();
        transport.emit(TransportEvent::Close);

        // The pump runs as a task; give it a tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!harness.registry.is_connected("quentin"));
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event")
            .unwrap();
        assert!(
            matches!(event, CoreEvent::PeerDisconnected { ref peer_id } if peer_id == "quentin")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tick_skipped_during_manual_pass() {
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        add_live_peer(&harness, "buddy");
        seed_recent_peer(&harness, "quentin", 30 * 1000).await;

        harness
            .orchestrator
            .manual_in_progress
            .store(true, Ordering::SeqCst);
        harness.orchestrator.periodic_tick().await;

        // No attempt was made at all.
        assert_eq!(harness.factory.created_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tick_runs_ladder() {
        let harness = harness("alice", MockConnectBehavior::ConnectImmediately).await;
        add_live_peer(&harness, "buddy");
        seed_recent_peer(&harness, "quentin", 30 * 1000).await;

        harness.orchestrator.periodic_tick().await;

        assert!(harness.registry.is_connected("quentin"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_change_flow_announces_with_elevated_ttl() {
        // S6, local half: the network-change signal produces an
        // ip-change announcement peers reconnect from.
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        let buddy = add_live_peer(&harness, "buddy");

        harness.orchestrator.on_network_change().await.unwrap();

        let sent = buddy.sent_json();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["msg_type"], "ip_change_announcement");
        assert_eq!(sent[0]["ttl"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopt_external_channel() {
        let harness = harness("alice", MockConnectBehavior::Silent).await;
        let transport = MockTransport::new();

        harness
            .orchestrator
            .adopt_external_channel("paired", "Paired", transport.clone())
            .await;

        assert!(harness.registry.is_connected("paired"));
        assert_eq!(
            harness
                .orchestrator
                .stats()
                .method_count(ReconnectMethod::External),
            1
        );
    }
}
