//! # Flood Router Module
//!
//! Carries typed envelopes from any local emitter to the intended
//! recipients via a gossip flood over live peer channels, with
//! deduplication, TTL bounds, loop prevention, and per-type delivery to
//! local handlers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RECEIVE PIPELINE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  bytes ──► shape check ──► duplicate check ──► record in seen cache    │
//! │              │                 │                                        │
//! │              ▼ drop            ▼ drop                                   │
//! │                                                                         │
//! │  ──► TTL / hop bound ──► loop check ──► local delivery ──► forward     │
//! │        │ drop              │ drop         (at most once     (everyone   │
//! │        ▼                   ▼               per msg_id)       except     │
//! │                                                              upstream,  │
//! │                                                              path,      │
//! │                                                              sender)    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The router owns nothing but its seen cache. Peers come from a
//! read-only [`LivePeerView`]; payloads are opaque; handlers are a typed
//! registry with at most one handler per message type. Send failures on
//! one channel never abort forwarding to siblings.

mod envelope;

pub use envelope::{Envelope, MsgType, RoutingHint};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::transport::{LivePeerView, PeerTransport};

/// Tunables for the flood router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// TTL assigned when the creator does not pick one
    pub default_ttl: u32,
    /// Hop bound; envelopes at or past it are expired
    pub max_hops: u32,
    /// Seen-cache capacity before eviction kicks in
    pub seen_capacity: usize,
    /// How many oldest entries one eviction removes
    pub seen_evict_batch: usize,
    /// Hard TTL on seen entries (ms)
    pub seen_ttl_ms: i64,
    /// Duplicate window for repeats from the same upstream peer (ms)
    pub duplicate_same_peer_ms: i64,
    /// Duplicate window for repeats from any peer (ms)
    pub duplicate_any_peer_ms: i64,
    /// Period of the seen-cache purge task (ms)
    pub cleanup_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_ttl: 7,
            max_hops: 10,
            seen_capacity: 10_000,
            seen_evict_batch: 1_000,
            seen_ttl_ms: 60_000,
            duplicate_same_peer_ms: 5_000,
            duplicate_any_peer_ms: 1_000,
            cleanup_interval_ms: 30_000,
        }
    }
}

/// Options for [`FloodRouter::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Override the default TTL
    pub ttl: Option<u32>,
    /// Deliver only at this peer
    pub target_peer_id: Option<String>,
    /// Override the default broadcast hint
    pub routing_hint: Option<RoutingHint>,
}

/// An envelope delivered to a local handler
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The envelope as received
    pub envelope: Envelope,
    /// The upstream peer it arrived from (None for loopback in tests)
    pub from_peer: Option<String>,
}

/// A registered per-type handler
pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Drop/forward counters, all monotone
#[derive(Default)]
pub struct RouterCounters {
    malformed: AtomicU64,
    duplicate: AtomicU64,
    expired: AtomicU64,
    looped: AtomicU64,
    delivered: AtomicU64,
    forwarded: AtomicU64,
    send_errors: AtomicU64,
}

/// Point-in-time snapshot of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterCountersSnapshot {
    /// Envelopes dropped for shape failures
    pub malformed: u64,
    /// Envelopes dropped as duplicates
    pub duplicate: u64,
    /// Envelopes dropped as TTL/hop expired
    pub expired: u64,
    /// Envelopes dropped for path cycles
    pub looped: u64,
    /// Local handler invocations
    pub delivered: u64,
    /// Envelopes forwarded onward
    pub forwarded: u64,
    /// Channel send failures (advisory)
    pub send_errors: u64,
}

struct SeenEntry {
    last_seen_ms: i64,
    from_peer: Option<String>,
    #[allow(dead_code)]
    hop_count: u32,
    delivered: bool,
}

/// The flood router (M1)
pub struct FloodRouter {
    self_id: String,
    self_name: String,
    peers: Arc<dyn LivePeerView>,
    config: RouterConfig,
    handlers: RwLock<HashMap<MsgType, Handler>>,
    seen: Mutex<HashMap<String, SeenEntry>>,
    counters: RouterCounters,
    cleanup_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FloodRouter {
    /// Create a router for this node over a view of live peers
    pub fn new(
        self_id: impl Into<String>,
        self_name: impl Into<String>,
        peers: Arc<dyn LivePeerView>,
        config: RouterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_id: self_id.into(),
            self_name: self_name.into(),
            peers,
            config,
            handlers: RwLock::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            counters: RouterCounters::default(),
            cleanup_task: Mutex::new(None),
        })
    }

    /// This node's peer id
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Register the handler for a message type; replaces any earlier one
    pub fn register(&self, msg_type: MsgType, handler: Handler) {
        self.handlers.write().insert(msg_type, handler);
    }

    /// Counter snapshot
    pub fn counters(&self) -> RouterCountersSnapshot {
        RouterCountersSnapshot {
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            duplicate: self.counters.duplicate.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            looped: self.counters.looped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }

    /// Build a fresh envelope originating at this node
    pub fn create(&self, msg_type: MsgType, payload: serde_json::Value, opts: CreateOptions) -> Envelope {
        use rand::RngCore;
        let now = crate::time::now_timestamp_millis();
        let mut suffix = [0u8; 4];
        rand::rngs::OsRng.fill_bytes(&mut suffix);

        Envelope {
            msg_id: format!("{}-{}-{}", self.self_id, now, hex::encode(suffix)),
            msg_type,
            sender_id: self.self_id.clone(),
            sender_name: self.self_name.clone(),
            timestamp: now,
            ttl: opts.ttl.unwrap_or(self.config.default_ttl),
            hop_count: 0,
            path: vec![self.self_id.clone()],
            target_peer_id: opts.target_peer_id,
            routing_hint: opts.routing_hint.unwrap_or(RoutingHint::Broadcast),
            payload,
        }
    }

    /// Emit a locally created envelope to every live peer
    ///
    /// Returns how many channels accepted the frame. Send failures are
    /// advisory.
    pub async fn emit(&self, envelope: &Envelope) -> usize {
        let mut sent = 0;
        for peer_id in self.peers.live_peer_ids() {
            if let Some(channel) = self.peers.channel(&peer_id) {
                if self.send(envelope, channel.as_ref()).await.is_ok() {
                    sent += 1;
                }
            }
        }
        trace!(msg_id = %envelope.msg_id, sent, "Emitted envelope");
        sent
    }

    /// Send one envelope over one channel
    pub async fn send(&self, envelope: &Envelope, channel: &dyn PeerTransport) -> Result<()> {
        let bytes = envelope.to_bytes()?;
        if let Err(e) = channel.send(bytes).await {
            self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            warn!(msg_id = %envelope.msg_id, "Envelope send failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Ingest an envelope received from `from_peer`
    ///
    /// Idempotent: duplicates, expired, and looped envelopes are counted
    /// and dropped; a given `msg_id` is delivered locally at most once.
    pub async fn route(&self, envelope: Envelope, from_peer: Option<&str>) {
        // 1. Shape.
        if let Err(reason) = envelope.validate_shape() {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            debug!(reason, "Dropping malformed envelope");
            return;
        }

        let now = crate::time::now_timestamp_millis();

        // 2.+3. Duplicate check, then record the sighting.
        let already_delivered = {
            let mut seen = self.seen.lock();
            let duplicate = match seen.get(&envelope.msg_id) {
                Some(entry) => {
                    let age = now - entry.last_seen_ms;
                    let same_upstream = entry.from_peer.as_deref() == from_peer;
                    (same_upstream && age <= self.config.duplicate_same_peer_ms)
                        || age <= self.config.duplicate_any_peer_ms
                }
                None => false,
            };
            if duplicate {
                self.counters.duplicate.fetch_add(1, Ordering::Relaxed);
                trace!(msg_id = %envelope.msg_id, "Dropping duplicate envelope");
                return;
            }

            let delivered = seen
                .get(&envelope.msg_id)
                .map(|entry| entry.delivered)
                .unwrap_or(false);
            seen.insert(
                envelope.msg_id.clone(),
                SeenEntry {
                    last_seen_ms: now,
                    from_peer: from_peer.map(str::to_string),
                    hop_count: envelope.hop_count,
                    delivered,
                },
            );
            if seen.len() > self.config.seen_capacity {
                Self::evict_oldest(&mut seen, self.config.seen_evict_batch);
            }
            delivered
        };

        // 4. TTL / hop bound.
        if envelope.ttl == 0 || envelope.hop_count >= self.config.max_hops {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            trace!(msg_id = %envelope.msg_id, ttl = envelope.ttl, "Dropping expired envelope");
            return;
        }

        // 5. Path cycles.
        if envelope.has_loop() {
            self.counters.looped.fetch_add(1, Ordering::Relaxed);
            debug!(msg_id = %envelope.msg_id, "Dropping looped envelope");
            return;
        }

        // 6. Local delivery, at most once per msg_id.
        let for_us = match &envelope.target_peer_id {
            Some(target) => *target == self.self_id,
            None => envelope.routing_hint == RoutingHint::Broadcast,
        } || envelope.msg_type == MsgType::Chat;

        if for_us && !already_delivered {
            let handler = self.handlers.read().get(&envelope.msg_type).cloned();
            if let Some(handler) = handler {
                if let Some(entry) = self.seen.lock().get_mut(&envelope.msg_id) {
                    entry.delivered = true;
                }
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                handler(Delivery {
                    envelope: envelope.clone(),
                    from_peer: from_peer.map(str::to_string),
                })
                .await;
            }
        }

        // 7. Forward.
        let should_forward = envelope.ttl > 1
            && envelope
                .target_peer_id
                .as_deref()
                .map(|target| target != self.self_id)
                .unwrap_or(true);
        if should_forward {
            self.forward(&envelope, from_peer).await;
        }
    }

    async fn forward(&self, envelope: &Envelope, from_peer: Option<&str>) {
        let next = envelope.forwarded_by(&self.self_id);
        let mut forwarded_to = 0;

        for peer_id in self.peers.live_peer_ids() {
            if Some(peer_id.as_str()) == from_peer
                || envelope.path.iter().any(|hop| *hop == peer_id)
                || peer_id == envelope.sender_id
            {
                continue;
            }
            let Some(channel) = self.peers.channel(&peer_id) else {
                continue;
            };
            // A failure on one channel must not abort the siblings.
            if self.send(&next, channel.as_ref()).await.is_ok() {
                forwarded_to += 1;
            }
        }

        if forwarded_to > 0 {
            self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
            trace!(msg_id = %envelope.msg_id, forwarded_to, "Forwarded envelope");
        }
    }

    fn evict_oldest(seen: &mut HashMap<String, SeenEntry>, batch: usize) {
        let mut by_age: Vec<(String, i64)> = seen
            .iter()
            .map(|(id, entry)| (id.clone(), entry.last_seen_ms))
            .collect();
        by_age.sort_by_key(|(_, ts)| *ts);
        for (msg_id, _) in by_age.into_iter().take(batch) {
            seen.remove(&msg_id);
        }
    }

    /// Purge seen entries past the hard TTL
    pub fn purge_seen(&self) {
        let now = crate::time::now_timestamp_millis();
        let ttl = self.config.seen_ttl_ms;
        let mut seen = self.seen.lock();
        seen.retain(|_, entry| now - entry.last_seen_ms <= ttl);
    }

    /// Start the periodic seen-cache purge
    pub fn start(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock();
        if task.is_some() {
            return;
        }
        let router = Arc::downgrade(self);
        let interval_ms = self.config.cleanup_interval_ms;
        *task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match router.upgrade() {
                    Some(router) => router.purge_seen(),
                    None => break,
                }
            }
        }));
    }

    /// Stop the purge task
    pub fn stop(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn seen_len(&self) -> usize {
        self.seen.lock().len()
    }
}

impl Drop for FloodRouter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::{PeerHandle, PeerRegistry};

    fn registry_with(peers: &[&str]) -> (Arc<PeerRegistry>, Vec<Arc<MockTransport>>) {
        let registry = Arc::new(PeerRegistry::new());
        let mut transports = Vec::new();
        for peer_id in peers {
            let transport = MockTransport::new();
            registry.insert(PeerHandle {
                peer_id: peer_id.to_string(),
                display_name: peer_id.to_uppercase(),
                transport: transport.clone(),
                connected_at: 0,
                latency_ms: None,
                connection_type: None,
                transient: false,
            });
            transports.push(transport);
        }
        (registry, transports)
    }

    fn router_for(self_id: &str, registry: Arc<PeerRegistry>) -> Arc<FloodRouter> {
        FloodRouter::new(self_id, self_id.to_uppercase(), registry, RouterConfig::default())
    }

    fn capture_handler() -> (Handler, Arc<Mutex<Vec<Delivery>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let inner = captured.clone();
        let handler: Handler = Arc::new(move |delivery| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.lock().push(delivery);
            })
        });
        (handler, captured)
    }

    fn chat_from(sender: &str, msg_id: &str, ttl: u32) -> Envelope {
        Envelope {
            msg_id: msg_id.to_string(),
            msg_type: MsgType::Chat,
            sender_id: sender.to_string(),
            sender_name: sender.to_uppercase(),
            timestamp: crate::time::now_timestamp_millis(),
            ttl,
            hop_count: 0,
            path: vec![sender.to_string()],
            target_peer_id: None,
            routing_hint: RoutingHint::Broadcast,
            payload: serde_json::json!({"text": "hello"}),
        }
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let (registry, _) = registry_with(&[]);
        let router = router_for("aaa", registry);

        let e1 = router.create(MsgType::Chat, serde_json::json!({}), CreateOptions::default());
        let e2 = router.create(MsgType::Chat, serde_json::json!({}), CreateOptions::default());

        assert_eq!(e1.ttl, 7);
        assert_eq!(e1.hop_count, 0);
        assert_eq!(e1.path, vec!["aaa".to_string()]);
        assert_eq!(e1.routing_hint, RoutingHint::Broadcast);
        assert_ne!(e1.msg_id, e2.msg_id);
        assert!(e1.validate_shape().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_from_same_upstream_dropped() {
        // S1: B receives m1 from A, delivers and forwards to C; the same
        // m1 from A within 5 s is dropped.
        let (registry, transports) = registry_with(&["aaa", "ccc"]);
        let router = router_for("bbb", registry);
        let (handler, captured) = capture_handler();
        router.register(MsgType::Chat, handler);

        let envelope = chat_from("aaa", "m1", 7);
        router.route(envelope.clone(), Some("aaa")).await;
        router.route(envelope, Some("aaa")).await;

        assert_eq!(captured.lock().len(), 1);
        assert_eq!(router.counters().duplicate, 1);
        // C received exactly one forwarded copy
        let to_c = transports[1].sent_json();
        assert_eq!(to_c.len(), 1);
        assert_eq!(to_c[0]["ttl"], 6);
        assert_eq!(to_c[0]["hop_count"], 1);
        assert_eq!(to_c[0]["path"], serde_json::json!(["aaa", "bbb"]));
        // Nothing went back to A
        assert!(transports[0].sent_json().is_empty());
    }

    #[tokio::test]
    async fn test_local_delivery_at_most_once_even_from_new_peer() {
        let (registry, _) = registry_with(&[]);
        let router = router_for("bbb", registry);
        let (handler, captured) = capture_handler();
        router.register(MsgType::Chat, handler);

        let envelope = chat_from("aaa", "m1", 7);
        router.route(envelope.clone(), Some("aaa")).await;

        // Same msg_id later from a different upstream: not a "duplicate"
        // by the window rule, but the handler must not fire again. Age
        // the sighting past both windows instead of sleeping.
        if let Some(entry) = router.seen.lock().get_mut("m1") {
            entry.last_seen_ms -= 1500;
        }
        let mut via_c = envelope.forwarded_by("ccc");
        via_c.ttl = 7;
        router.route(via_c, Some("ccc")).await;

        assert_eq!(captured.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_envelopes_dropped() {
        let (registry, transports) = registry_with(&["ccc"]);
        let router = router_for("bbb", registry);
        let (handler, captured) = capture_handler();
        router.register(MsgType::Chat, handler);

        let mut dead = chat_from("aaa", "m-dead", 7);
        dead.ttl = 0;
        router.route(dead, Some("aaa")).await;

        let mut hopped = chat_from("aaa", "m-hopped", 7);
        hopped.hop_count = 10;
        hopped.path = (0..11).map(|i| format!("p{}", i)).collect();
        hopped.path[0] = "aaa".into();
        router.route(hopped, Some("aaa")).await;

        assert!(captured.lock().is_empty());
        assert!(transports[0].sent_json().is_empty());
        assert_eq!(router.counters().expired, 2);
    }

    #[tokio::test]
    async fn test_looped_envelope_dropped() {
        let (registry, transports) = registry_with(&["ccc"]);
        let router = router_for("bbb", registry);

        let mut looped = chat_from("aaa", "m-loop", 7);
        looped.path = vec!["aaa".into(), "ddd".into(), "aaa".into()];
        looped.hop_count = 2;
        router.route(looped, Some("ddd")).await;

        assert!(transports[0].sent_json().is_empty());
        assert_eq!(router.counters().looped, 1);
    }

    #[tokio::test]
    async fn test_forward_excludes_upstream_path_and_sender() {
        let (registry, transports) = registry_with(&["aaa", "ddd", "eee"]);
        let router = router_for("bbb", registry);

        // Envelope from A that already passed through D
        let mut envelope = chat_from("aaa", "m2", 7);
        envelope = envelope.forwarded_by("ddd");
        router.route(envelope, Some("ddd")).await;

        // A is the sender, D is upstream and in the path: only E gets it
        assert!(transports[0].sent_json().is_empty());
        assert!(transports[1].sent_json().is_empty());
        assert_eq!(transports[2].sent_json().len(), 1);
    }

    #[tokio::test]
    async fn test_targeted_envelope_not_delivered_elsewhere_but_forwarded() {
        let (registry, transports) = registry_with(&["ccc"]);
        let router = router_for("bbb", registry);
        let (handler, captured) = capture_handler();
        router.register(MsgType::PathResponse, handler);

        let mut envelope = chat_from("aaa", "m3", 7);
        envelope.msg_type = MsgType::PathResponse;
        envelope.target_peer_id = Some("zzz".into());
        router.route(envelope, Some("aaa")).await;

        assert!(captured.lock().is_empty());
        assert_eq!(transports[0].sent_json().len(), 1);
    }

    #[tokio::test]
    async fn test_targeted_envelope_delivered_at_target_and_not_forwarded() {
        let (registry, transports) = registry_with(&["ccc"]);
        let router = router_for("zzz", registry);
        let (handler, captured) = capture_handler();
        router.register(MsgType::PathResponse, handler);

        let mut envelope = chat_from("aaa", "m4", 7);
        envelope.msg_type = MsgType::PathResponse;
        envelope.target_peer_id = Some("zzz".into());
        router.route(envelope, Some("aaa")).await;

        assert_eq!(captured.lock().len(), 1);
        assert!(transports[0].sent_json().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_does_not_abort_siblings() {
        let (registry, transports) = registry_with(&["ccc", "ddd"]);
        let router = router_for("bbb", registry);
        transports[0].fail_sends();

        router.route(chat_from("aaa", "m5", 7), Some("aaa")).await;

        assert_eq!(transports[1].sent_json().len(), 1);
        assert_eq!(router.counters().send_errors, 1);
    }

    #[tokio::test]
    async fn test_malformed_dropped_with_counter() {
        let (registry, _) = registry_with(&[]);
        let router = router_for("bbb", registry);

        let mut bad = chat_from("aaa", "m6", 7);
        bad.path.clear();
        router.route(bad, Some("aaa")).await;

        assert_eq!(router.counters().malformed, 1);
    }

    #[tokio::test]
    async fn test_emit_reaches_all_live_peers() {
        let (registry, transports) = registry_with(&["ccc", "ddd"]);
        let router = router_for("aaa", registry);

        let envelope = router.create(MsgType::Chat, serde_json::json!({"text": "hi"}), CreateOptions::default());
        let sent = router.emit(&envelope).await;

        assert_eq!(sent, 2);
        assert_eq!(transports[0].sent_json().len(), 1);
        assert_eq!(transports[1].sent_json().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_replacement() {
        let (registry, _) = registry_with(&[]);
        let router = router_for("bbb", registry);

        let (first, first_captured) = capture_handler();
        let (second, second_captured) = capture_handler();
        router.register(MsgType::Chat, first);
        router.register(MsgType::Chat, second);

        router.route(chat_from("aaa", "m7", 7), Some("aaa")).await;

        assert!(first_captured.lock().is_empty());
        assert_eq!(second_captured.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_entries_past_ttl() {
        let (registry, _) = registry_with(&[]);
        let router = router_for("bbb", registry);

        router.route(chat_from("aaa", "m8", 7), Some("aaa")).await;
        router.route(chat_from("aaa", "m9", 7), Some("aaa")).await;
        assert_eq!(router.seen_len(), 2);

        // Age one entry past the hard TTL; purge must drop only it.
        if let Some(entry) = router.seen.lock().get_mut("m8") {
            entry.last_seen_ms -= 61_000;
        }
        router.purge_seen();
        assert_eq!(router.seen_len(), 1);
    }

    #[tokio::test]
    async fn test_seen_cache_eviction_bounds_memory() {
        let (registry, _) = registry_with(&[]);
        let mut config = RouterConfig::default();
        config.seen_capacity = 100;
        config.seen_evict_batch = 10;
        let router = FloodRouter::new("bbb", "BBB", registry, config);

        for i in 0..150 {
            router.route(chat_from("aaa", &format!("m-{}", i), 7), Some("aaa")).await;
        }

        assert!(router.seen_len() <= 101);
    }
}
