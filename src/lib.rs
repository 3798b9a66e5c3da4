//! # Tether Core
//!
//! The reconnection and mesh-overlay core of a serverless peer-to-peer
//! chat application: it keeps a participant continuously reachable and
//! connected to a changing set of peers through page and process
//! restarts, IP changes, NAT timeouts, and uncoordinated churn, with no
//! central signalling or rendezvous server.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        TETHER CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Reconnect Orchestrator                                          │  │
//! │  │  cold/warm start · per-peer ladder · periodic loop · collisions  │  │
//! │  └───────┬──────────────┬───────────────┬───────────────┬──────────┘  │
//! │          │              │               │               │             │
//! │  ┌───────▼──────┐ ┌─────▼──────┐ ┌──────▼───────┐ ┌─────▼──────────┐ │
//! │  │ Announcements│ │ Flood      │ │ Reconnection │ │ Peer           │ │
//! │  │              │ │ Router     │ │ Auth         │ │ Persistence    │ │
//! │  │ - beacons    │ │ - dedup    │ │ - TOFU pins  │ │ - records      │ │
//! │  │ - tie-break  │ │ - TTL/loop │ │ - sequences  │ │ - scoring      │ │
//! │  │ - heartbeat  │ │ - handlers │ │ - nonces     │ │ - retention    │ │
//! │  └───────┬──────┘ └─────┬──────┘ └──────┬───────┘ └─────┬──────────┘ │
//! │          │              │               │               │             │
//! │          └──────────────┴───────┬───────┴───────────────┘             │
//! │                                 │                                     │
//! │  ┌─────────────┐  ┌─────────────▼──┐  ┌─────────────────────────────┐│
//! │  │   Crypto    │  │   Identity     │  │  Transport / Storage        ││
//! │  │ - Ed25519   │  │ - peer id      │  │  (collaborator interfaces)  ││
//! │  │ - ECDH P-256│  │ - key pairs    │  │ - PeerTransport, factory    ││
//! │  │ - AES-GCM   │  │ - sequence ctr │  │ - Kv trait, key schema      ││
//! │  │ - canonical │  │                │  │ - live-peer registry        ││
//! │  └─────────────┘  └────────────────┘  └─────────────────────────────┘│
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! Leaf-first dependency order; no module reaches upward:
//!
//! - [`error`] - Error types for the entire library
//! - [`time`] - Wall-clock helpers
//! - [`crypto`] - Primitives (keys, signatures, sealing, canonical bytes)
//! - [`storage`] - The KV collaborator trait and key schema
//! - [`identity`] - The node identity and its persisted sequence counter
//! - [`transport`] - The WebRTC collaborator trait and live-peer registry
//! - [`peers`] - Durable peer records, scoring, retention (M5)
//! - [`auth`] - Reconnection authentication (M2)
//! - [`router`] - The gossip flood substrate (M1)
//! - [`announce`] - Presence beacons and tie-breaking (M3)
//! - [`reconnect`] - The cascading reconnection orchestrator (M4)
//!
//! ## Security Model
//!
//! | Layer | Mechanism |
//! |-------|-----------|
//! | Artefact authenticity | Ed25519 (ECDSA-P256 accepted) over canonical JSON |
//! | Replay protection | Persisted monotone sequences + bounded nonce cache |
//! | Key pinning | Trust-on-first-use; mismatches are hard alerts |
//! | At-rest secrecy | AES-256-GCM under an HKDF-derived storage key |
//!
//! End-to-end encryption of application payloads is deliberately out of
//! scope; chat payloads are opaque bytes to this crate.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod announce;
pub mod auth;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod peers;
pub mod reconnect;
pub mod router;
pub mod storage;
/// Wall-clock helpers shared by every module.
pub mod time;
pub mod transport;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use announce::{AnnounceConfig, AnnouncementFabric, ReconnectRequest};
pub use auth::{AnnounceReason, Announcement, AuthConfig, ReconnectAuth, Verification};
pub use crypto::{KeyPair, PublicKey, SignatureAlgorithm};
pub use error::{Error, Result, VerifyFailure};
pub use identity::{IdentityManager, NodeIdentity};
pub use peers::{PeerRecord, PeerStore, PeerStoreConfig};
pub use reconnect::{CoreEvent, ReconnectConfig, ReconnectOrchestrator};
pub use router::{Envelope, FloodRouter, MsgType, RouterConfig, RoutingHint};
pub use storage::{Kv, MemoryKv};
pub use transport::{
    ConnectionType, IceConfig, PeerRegistry, PeerTransport, TransportEvent, TransportFactory,
};

// ============================================================================
// CORE INSTANCE
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Top-level configuration for [`TetherCore`]
#[derive(Debug, Clone)]
pub struct TetherConfig {
    /// Display name for a freshly created identity
    pub display_name: String,
    /// ICE servers handed to the transport factory
    pub ice: IceConfig,
    /// Flood-router tunables
    pub router: RouterConfig,
    /// Authentication tunables
    pub auth: AuthConfig,
    /// Announcement-fabric tunables
    pub announce: AnnounceConfig,
    /// Orchestrator tunables
    pub reconnect: ReconnectConfig,
    /// Peer-store tunables
    pub peers: PeerStoreConfig,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
            ice: IceConfig::default(),
            router: RouterConfig::default(),
            auth: AuthConfig::default(),
            announce: AnnounceConfig::default(),
            reconnect: ReconnectConfig::default(),
            peers: PeerStoreConfig::default(),
        }
    }
}

/// The assembled mesh core
///
/// Construction wires the layered dependency order explicitly: every
/// component takes its collaborators at construction time, and timers
/// only run between [`start`](Self::start) and [`stop`](Self::stop).
pub struct TetherCore {
    identity: Arc<IdentityManager>,
    auth: Arc<ReconnectAuth>,
    store: Arc<PeerStore>,
    registry: Arc<PeerRegistry>,
    router: Arc<FloodRouter>,
    fabric: Arc<AnnouncementFabric>,
    orchestrator: Arc<ReconnectOrchestrator>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<ReconnectRequest>>>,
}

impl TetherCore {
    /// Build the core over the host-supplied collaborators
    ///
    /// Creates the node identity on first run; reloads it afterwards.
    pub async fn initialize(
        kv: Arc<dyn Kv>,
        factory: Arc<dyn TransportFactory>,
        config: TetherConfig,
    ) -> Result<Self> {
        let storage_key = storage::load_or_init_storage_key(kv.as_ref()).await?;
        let identity = Arc::new(
            IdentityManager::load_or_create(kv.clone(), storage_key.clone(), &config.display_name)
                .await?,
        );
        let trust = auth::TrustStore::load(kv.clone(), storage_key.clone()).await?;
        let auth = Arc::new(
            ReconnectAuth::load(identity.clone(), trust, kv.clone(), config.auth).await?,
        );
        let store = Arc::new(PeerStore::new(kv.clone(), storage_key, config.peers));
        let registry = Arc::new(PeerRegistry::new());
        let router = FloodRouter::new(
            identity.peer_id(),
            identity.display_name(),
            registry.clone(),
            config.router,
        );
        let (reconnect_tx, reconnect_rx) = mpsc::channel(64);
        let fabric = AnnouncementFabric::new(
            identity.clone(),
            router.clone(),
            auth.clone(),
            store.clone(),
            registry.clone(),
            reconnect_tx,
            config.announce,
        );
        let orchestrator = ReconnectOrchestrator::new(
            identity.clone(),
            router.clone(),
            auth.clone(),
            fabric.clone(),
            store.clone(),
            registry.clone(),
            factory,
            kv,
            config.ice,
            config.reconnect,
        );

        Ok(Self {
            identity,
            auth,
            store,
            registry,
            router,
            fabric,
            orchestrator,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
        })
    }

    /// Start the background loops (router purge, heartbeat, orchestrator)
    pub fn start(&self) {
        if let Some(rx) = self.reconnect_rx.lock().take() {
            self.orchestrator.start(rx);
        }
        self.router.start();
        self.fabric.start();
    }

    /// Stop every background loop
    pub fn stop(&self) {
        self.fabric.stop();
        self.router.stop();
        self.orchestrator.stop();
    }

    /// Rejoin the mesh (cold or warm start, decided by live-peer count)
    pub async fn reconnect_to_mesh(&self) -> Result<usize> {
        self.orchestrator.reconnect_to_mesh().await
    }

    /// React to a host network-change signal
    pub async fn on_network_change(&self) -> Result<()> {
        self.orchestrator.on_network_change().await
    }

    /// Broadcast an opaque chat payload over the mesh
    pub async fn broadcast_chat(&self, payload: serde_json::Value) -> usize {
        let envelope = self
            .router
            .create(MsgType::Chat, payload, router::CreateOptions::default());
        self.router.emit(&envelope).await
    }

    /// Subscribe to out-of-band core events
    pub fn events(&self) -> broadcast::Receiver<CoreEvent> {
        self.orchestrator.events()
    }

    /// The node identity manager
    pub fn identity(&self) -> &Arc<IdentityManager> {
        &self.identity
    }

    /// The authentication layer
    pub fn auth(&self) -> &Arc<ReconnectAuth> {
        &self.auth
    }

    /// The durable peer store
    pub fn peers(&self) -> &Arc<PeerStore> {
        &self.store
    }

    /// The live-peer registry
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// The flood router
    pub fn router(&self) -> &Arc<FloodRouter> {
        &self.router
    }

    /// The announcement fabric
    pub fn fabric(&self) -> &Arc<AnnouncementFabric> {
        &self.fabric
    }

    /// The reconnection orchestrator
    pub fn orchestrator(&self) -> &Arc<ReconnectOrchestrator> {
        &self.orchestrator
    }
}

impl Drop for TetherCore {
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
    use crate::transport::mock::{MockConnectBehavior, MockFactory};

    async fn core(kv: Arc<MemoryKv>, name: &str) -> TetherCore {
        let factory = MockFactory::new(MockConnectBehavior::Silent);
        TetherCore::initialize(
            kv,
            factory,
            TetherConfig { display_name: name.to_string(), ..Default::default() },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_creates_and_reloads_identity() {
        let kv = Arc::new(MemoryKv::new());

        let first = core(kv.clone(), "alice").await;
        let peer_id = first.identity().peer_id().to_string();
        drop(first);

        let second = core(kv, "alice").await;
        assert_eq!(second.identity().peer_id(), peer_id);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let kv = Arc::new(MemoryKv::new());
        let core = core(kv, "alice").await;

        core.start();
        core.start();
        core.stop();
    }

    #[tokio::test]
    async fn test_broadcast_chat_reaches_live_peers() {
        use crate::transport::mock::MockTransport;
        use crate::transport::PeerHandle;

        let kv = Arc::new(MemoryKv::new());
        let core = core(kv, "alice").await;

        let transport = MockTransport::new();
        core.registry().insert(PeerHandle {
            peer_id: "buddy".into(),
            display_name: "Buddy".into(),
            transport: transport.clone(),
            connected_at: crate::time::now_timestamp_millis(),
            latency_ms: None,
            connection_type: None,
            transient: false,
        });

        let sent = core
            .broadcast_chat(serde_json::json!({"text": "hello mesh"}))
            .await;

        assert_eq!(sent, 1);
        let frames = transport.sent_json();
        assert_eq!(frames[0]["msg_type"], "chat");
        assert_eq!(frames[0]["payload"]["text"], "hello mesh");
        assert_eq!(frames[0]["sender_id"], core.identity().peer_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_cores_can_authenticate_each_other() {
        let alice = core(Arc::new(MemoryKv::new()), "alice").await;
        let bob = core(Arc::new(MemoryKv::new()), "bob").await;

        // Exchange identities as the channel pump would.
        let from_alice = alice.auth().identity_exchange_message().unwrap();
        bob.auth().handle_identity_exchange(&from_alice).await.unwrap();

        // Bob can now verify Alice's announcements.
        let announcement = alice
            .auth()
            .create_announcement(AnnounceReason::Rejoin, Default::default())
            .await
            .unwrap();
        assert_eq!(
            bob.auth().verify_announcement(&announcement).await.unwrap(),
            Verification::Valid
        );
    }
}
