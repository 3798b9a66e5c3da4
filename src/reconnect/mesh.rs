//! Mesh-relayed signalling: ladder step B and its envelope handlers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 MESH-RELAYED RECONNECTION (step B)                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  P (requester)            R (relay)              Q (target)            │
//! │  ──────────────           ─────────              ──────────            │
//! │  path_query ────────────► has Q live? ──yes──► (not forwarded to Q)    │
//! │              ◄──────────── path_response                                │
//! │  reconnect_offer ───────► forward ────────────► should_accept?         │
//! │                                                  create responder,     │
//! │              ◄──────────── forward ◄──────────── reconnect_answer      │
//! │  signal answer into                                                     │
//! │  transport; ICE runs end-to-end; both orchestrators finalize on        │
//! │  the transport's connect event.                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Collisions resolve deterministically: the lower peer id is the
//! rightful initiator everywhere, so a responder with the lower id
//! rejects the incoming offer (`collision_detected`) and keeps its own,
//! while the higher-id side destroys its own pending offer and accepts.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::pending::{
    LadderSignal, PathQueryState, PathResponseEntry, PendingReconnect, ReconnectMethod,
    ReconnectState,
};
use super::{wait_for_connect, ReconnectOrchestrator};
use crate::error::{Error, Result};
use crate::router::{CreateOptions, Delivery, MsgType, RoutingHint};
use crate::transport::TransportEvent;

/// Why a responder declined an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Policy said no (blacklist, budget)
    Declined,
    /// The requester is already a live peer
    AlreadyConnected,
    /// Both sides offered; the lower id keeps its own offer
    CollisionDetected,
    /// Responder-side failure while building the answer
    Error,
}

impl RejectReason {
    /// The stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Declined => "declined",
            RejectReason::AlreadyConnected => "already_connected",
            RejectReason::CollisionDetected => "collision_detected",
            RejectReason::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathQueryPayload {
    query_id: String,
    target_peer_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathResponsePayload {
    query_id: String,
    relay_peer_id: String,
    hop_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconnectOfferPayload {
    reconnect_id: String,
    offer_blob: serde_json::Value,
    requester_id: String,
    requester_name: String,
    timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconnectAnswerPayload {
    reconnect_id: String,
    answer_blob: serde_json::Value,
    responder_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconnectRejectionPayload {
    reconnect_id: String,
    reason: String,
}

impl ReconnectOrchestrator {
    pub(super) fn register_handlers(self: &Arc<Self>) {
        for msg_type in [
            MsgType::PathQuery,
            MsgType::PathResponse,
            MsgType::ReconnectOffer,
            MsgType::ReconnectAnswer,
            MsgType::ReconnectRejection,
        ] {
            let weak = Arc::downgrade(self);
            self.router.register(
                msg_type,
                Arc::new(move |delivery| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(orchestrator) = weak.upgrade() else { return };
                        match msg_type {
                            MsgType::PathQuery => orchestrator.handle_path_query(delivery).await,
                            MsgType::PathResponse => {
                                orchestrator.handle_path_response(delivery).await
                            }
                            MsgType::ReconnectOffer => {
                                orchestrator.handle_reconnect_offer(delivery).await
                            }
                            MsgType::ReconnectAnswer => {
                                orchestrator.handle_reconnect_answer(delivery).await
                            }
                            MsgType::ReconnectRejection => {
                                orchestrator.handle_reconnect_rejection(delivery).await
                            }
                            _ => {}
                        }
                    })
                }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Ladder step B (requester side)
    // ------------------------------------------------------------------

    pub(super) async fn step_mesh_relay(
        self: &Arc<Self>,
        peer_id: &str,
        display_name: &str,
    ) -> Result<()> {
        let deadline = Duration::from_millis(self.config.ladder.mesh_deadline_ms);
        let result = match tokio::time::timeout(
            deadline,
            self.clone().mesh_relay_inner(peer_id.to_string(), display_name.to_string()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("Mesh relay to {}", peer_id))),
        };

        if let Err(ref e) = result {
            debug!(peer_id, "Mesh relay failed: {}", e);
            self.fail_pending_for(peer_id).await;
            self.record_attempt_failure(peer_id).await;
        }
        result
    }

    async fn mesh_relay_inner(self: Arc<Self>, peer_id: String, display_name: String) -> Result<()> {
        let started = crate::time::now_timestamp_millis();

        // 1. Who can reach the target right now?
        let query_id = uuid::Uuid::new_v4().to_string();
        let notify = Arc::new(tokio::sync::Notify::new());
        self.path_queries.lock().insert(
            query_id.clone(),
            PathQueryState {
                query_id: query_id.clone(),
                target_peer_id: peer_id.clone(),
                responses: Vec::new(),
                start_time: started,
                notify: notify.clone(),
            },
        );
        self.schedule_query_cleanup(query_id.clone());

        let query = self.router.create(
            MsgType::PathQuery,
            serde_json::to_value(PathQueryPayload {
                query_id: query_id.clone(),
                target_peer_id: peer_id.clone(),
            })?,
            CreateOptions {
                ttl: Some(self.config.ladder.path_query_ttl),
                ..Default::default()
            },
        );
        self.router.emit(&query).await;

        // 2. Collect responses; the first one is enough to proceed.
        let _ = tokio::time::timeout(
            Duration::from_millis(self.config.ladder.path_collect_ms),
            notify.notified(),
        )
        .await;
        let relay = {
            let queries = self.path_queries.lock();
            queries
                .get(&query_id)
                .and_then(|q| q.responses.first().cloned())
        };
        let Some(relay) = relay else {
            eprintln!("DEBUG no relay found, returning NoPathFound");
            return Err(Error::NoPathFound(peer_id));
        };
        eprintln!("DEBUG path found relay={}", relay.relay_peer_id);
        debug!(peer_id = %peer_id, relay = %relay.relay_peer_id, "Path found");

        // 3. Build the offer and flood it toward the target.
        let transport = self.factory.create(true, &self.ice)?;
        let mut events = transport.subscribe();
        eprintln!("DEBUG waiting for signal");
        let Some(offer_blob) = wait_for_signal(&mut events, Duration::from_millis(5_000)).await
        else {
            eprintln!("DEBUG signal timed out");
            transport.close().await;
            return Err(Error::Timeout("Local offer was never produced".into()));
        };

        let reconnect_id = uuid::Uuid::new_v4().to_string();
        let (signal_tx, signal_rx) = oneshot::channel();
        {
            let mut pending = PendingReconnect::new(
                &reconnect_id,
                &peer_id,
                &display_name,
                started,
                started + self.config.ladder.mesh_deadline_ms as i64,
            );
            pending.advance(ReconnectState::QueryingPath);
            pending.advance(ReconnectState::PathFound);
            pending.advance(ReconnectState::SendingOffer);
            pending.transport = Some(transport.clone());
            pending.signal_tx = Some(signal_tx);
            self.pending.lock().insert(reconnect_id.clone(), pending);
        }

        let offer = self.router.create(
            MsgType::ReconnectOffer,
            serde_json::to_value(ReconnectOfferPayload {
                reconnect_id: reconnect_id.clone(),
                offer_blob,
                requester_id: self.identity.peer_id().to_string(),
                requester_name: self.identity.display_name().to_string(),
                timestamp: started,
            })?,
            CreateOptions {
                ttl: Some(self.config.ladder.targeted_ttl),
                target_peer_id: Some(peer_id.clone()),
                routing_hint: Some(RoutingHint::Relay),
            },
        );
        self.router.emit(&offer).await;
        self.advance_pending(&reconnect_id, ReconnectState::WaitingAnswer);

        // 4. The answer (or rejection) arrives through the handlers.
        match signal_rx.await {
            Ok(LadderSignal::Answer(answer_blob)) => {
                self.advance_pending(&reconnect_id, ReconnectState::Connecting);
                transport.signal(answer_blob).await?;
                if wait_for_connect(
                    &mut events,
                    Duration::from_millis(self.config.ladder.mesh_deadline_ms),
                )
                .await
                {
                    self.advance_pending(&reconnect_id, ReconnectState::Connected);
                    self.pending.lock().remove(&reconnect_id);
                    self.finalize_connection(
                        &peer_id,
                        &display_name,
                        transport,
                        ReconnectMethod::MeshRelay,
                        started,
                    )
                    .await;
                    Ok(())
                } else {
                    transport.close().await;
                    Err(Error::ConnectionFailed(peer_id))
                }
            }
            Ok(LadderSignal::Rejected(reason)) => {
                self.advance_pending(&reconnect_id, ReconnectState::Rejected);
                transport.close().await;
                Err(Error::ReconnectRejected { peer_id, reason })
            }
            Err(_) => {
                transport.close().await;
                Err(Error::Internal("Pending attempt vanished".into()))
            }
        }
    }

    fn schedule_query_cleanup(self: &Arc<Self>, query_id: String) {
        // Late responses are discarded but the state lingers briefly for
        // diagnostics.
        let weak = Arc::downgrade(self);
        let linger = self.config.ladder.query_linger_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(linger)).await;
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.path_queries.lock().remove(&query_id);
            }
        });
    }

    pub(super) fn advance_pending(&self, reconnect_id: &str, state: ReconnectState) {
        if let Some(pending) = self.pending.lock().get_mut(reconnect_id) {
            if !pending.advance(state) {
                warn!(
                    reconnect_id,
                    current = ?pending.state,
                    requested = ?state,
                    "Illegal reconnect state transition ignored"
                );
            }
        }
    }

    pub(super) async fn fail_pending_for(&self, peer_id: &str) {
        let doomed: Vec<PendingReconnect> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.target_peer_id == peer_id && !p.state.is_terminal())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for mut entry in doomed {
            if let Some(tx) = entry.signal_tx.take() {
                let _ = tx.send(LadderSignal::Rejected("superseded".into()));
            }
            if let Some(transport) = entry.transport.take() {
                transport.close().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn handle_path_query(self: &Arc<Self>, delivery: Delivery) {
        let Ok(query) =
            serde_json::from_value::<PathQueryPayload>(delivery.envelope.payload.clone())
        else {
            return;
        };
        if !self.registry.is_connected(&query.target_peer_id) {
            return;
        }

        let Ok(payload) = serde_json::to_value(PathResponsePayload {
            query_id: query.query_id,
            relay_peer_id: self.identity.peer_id().to_string(),
            hop_count: delivery.envelope.hop_count,
        }) else {
            return;
        };
        let response = self.router.create(
            MsgType::PathResponse,
            payload,
            CreateOptions {
                ttl: Some(self.config.ladder.targeted_ttl),
                target_peer_id: Some(delivery.envelope.sender_id.clone()),
                routing_hint: Some(RoutingHint::Relay),
            },
        );
        self.router.emit(&response).await;
    }

    async fn handle_path_response(self: &Arc<Self>, delivery: Delivery) {
        let Ok(response) =
            serde_json::from_value::<PathResponsePayload>(delivery.envelope.payload.clone())
        else {
            return;
        };
        let mut queries = self.path_queries.lock();
        let Some(query) = queries.get_mut(&response.query_id) else {
            // Settled or expired; late responses are discarded.
            return;
        };
        query.responses.push(PathResponseEntry {
            relay_peer_id: response.relay_peer_id,
            hop_count: response.hop_count,
            wall_time: crate::time::now_timestamp_millis(),
        });
        eprintln!("DEBUG handle_path_response got response, notifying");
        query.notify.notify_one();
    }

    /// Whether an incoming offer from `requester_id` should be accepted
    ///
    /// Exactly one side of any pair accepts: the one with the higher id.
    pub async fn should_accept_reconnection(
        &self,
        requester_id: &str,
    ) -> std::result::Result<(), RejectReason> {
        if requester_id == self.identity.peer_id() {
            return Err(RejectReason::Error);
        }
        if self.registry.is_connected(requester_id) {
            return Err(RejectReason::AlreadyConnected);
        }
        let now = crate::time::now_timestamp_millis();
        if let Ok(Some(record)) = self.store.get(requester_id).await {
            if record.is_blacklisted(now) {
                return Err(RejectReason::Declined);
            }
        }
        if self.identity.peer_id() < requester_id {
            // We are the rightful initiator; the peer should be waiting.
            return Err(RejectReason::CollisionDetected);
        }
        Ok(())
    }

    async fn handle_reconnect_offer(self: &Arc<Self>, delivery: Delivery) {
        let Ok(offer) =
            serde_json::from_value::<ReconnectOfferPayload>(delivery.envelope.payload.clone())
        else {
            return;
        };
        if offer.requester_id == self.identity.peer_id() {
            return;
        }

        if let Err(reason) = self.should_accept_reconnection(&offer.requester_id).await {
            debug!(requester = %offer.requester_id, reason = reason.as_str(), "Rejecting offer");
            self.send_rejection(&offer, reason).await;
            return;
        }

        // Collision, polite side: we hold the higher id, so our own
        // in-flight offer to this peer dies and theirs wins.
        if self.has_pending_for(&offer.requester_id) {
            debug!(requester = %offer.requester_id, "Collision: destroying own pending offer");
            self.fail_pending_for(&offer.requester_id).await;
        }

        let started = crate::time::now_timestamp_millis();
        let Ok(transport) = self.factory.create(false, &self.ice) else {
            self.send_rejection(&offer, RejectReason::Error).await;
            return;
        };
        let mut events = transport.subscribe();
        if let Err(e) = transport.signal(offer.offer_blob.clone()).await {
            warn!("Responder could not take the offer: {}", e);
            self.send_rejection(&offer, RejectReason::Error).await;
            transport.close().await;
            return;
        }
        let Some(answer_blob) = wait_for_signal(&mut events, Duration::from_millis(5_000)).await
        else {
            self.send_rejection(&offer, RejectReason::Error).await;
            transport.close().await;
            return;
        };

        let Ok(payload) = serde_json::to_value(ReconnectAnswerPayload {
            reconnect_id: offer.reconnect_id.clone(),
            answer_blob,
            responder_id: self.identity.peer_id().to_string(),
        }) else {
            transport.close().await;
            return;
        };
        let answer = self.router.create(
            MsgType::ReconnectAnswer,
            payload,
            CreateOptions {
                ttl: Some(self.config.ladder.targeted_ttl),
                target_peer_id: Some(offer.requester_id.clone()),
                routing_hint: Some(RoutingHint::Relay),
            },
        );
        self.router.emit(&answer).await;

        // ICE now runs end to end; finalize when the transport connects.
        let orchestrator = self.clone();
        let deadline = Duration::from_millis(self.config.ladder.mesh_deadline_ms);
        tokio::spawn(async move {
            if wait_for_connect(&mut events, deadline).await {
                orchestrator
                    .finalize_connection(
                        &offer.requester_id,
                        &offer.requester_name,
                        transport,
                        ReconnectMethod::MeshRelay,
                        started,
                    )
                    .await;
            } else {
                transport.close().await;
                orchestrator.record_attempt_failure(&offer.requester_id).await;
            }
        });
    }

    async fn handle_reconnect_answer(self: &Arc<Self>, delivery: Delivery) {
        let Ok(answer) =
            serde_json::from_value::<ReconnectAnswerPayload>(delivery.envelope.payload.clone())
        else {
            return;
        };
        let tx = {
            let mut pending = self.pending.lock();
            pending
                .get_mut(&answer.reconnect_id)
                .and_then(|p| p.signal_tx.take())
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(LadderSignal::Answer(answer.answer_blob));
            }
            None => debug!(reconnect_id = %answer.reconnect_id, "Answer for unknown attempt"),
        }
    }

    async fn handle_reconnect_rejection(self: &Arc<Self>, delivery: Delivery) {
        let Ok(rejection) =
            serde_json::from_value::<ReconnectRejectionPayload>(delivery.envelope.payload.clone())
        else {
            return;
        };
        let tx = {
            let mut pending = self.pending.lock();
            pending
                .get_mut(&rejection.reconnect_id)
                .and_then(|p| p.signal_tx.take())
        };
        if let Some(tx) = tx {
            let _ = tx.send(LadderSignal::Rejected(rejection.reason));
        }
    }

    async fn send_rejection(self: &Arc<Self>, offer: &ReconnectOfferPayload, reason: RejectReason) {
        let Ok(payload) = serde_json::to_value(ReconnectRejectionPayload {
            reconnect_id: offer.reconnect_id.clone(),
            reason: reason.as_str().to_string(),
        }) else {
            return;
        };
        let rejection = self.router.create(
            MsgType::ReconnectRejection,
            payload,
            CreateOptions {
                ttl: Some(self.config.ladder.targeted_ttl),
                target_peer_id: Some(offer.requester_id.clone()),
                routing_hint: Some(RoutingHint::Relay),
            },
        );
        self.router.emit(&rejection).await;
    }
}

/// Wait for the transport's first signalling blob
async fn wait_for_signal(
    events: &mut broadcast::Receiver<TransportEvent>,
    timeout: Duration,
) -> Option<serde_json::Value> {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Signal(blob)) => break Some(blob),
                Ok(TransportEvent::Close) | Ok(TransportEvent::Error(_)) => break None,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::tests::{add_live_peer, harness, seed_recent_peer, Harness};
    use super::*;
    use crate::announce::AnnouncementFabric;
    use crate::router::Envelope;
    use crate::transport::mock::MockConnectBehavior;

    fn envelope_to(
        harness: &Harness,
        msg_type: MsgType,
        sender: &str,
        payload: serde_json::Value,
    ) -> Envelope {
        Envelope {
            msg_id: format!("{}-{}", sender, uuid::Uuid::new_v4()),
            msg_type,
            sender_id: sender.to_string(),
            sender_name: sender.to_uppercase(),
            timestamp: crate::time::now_timestamp_millis(),
            ttl: 10,
            hop_count: 1,
            path: vec![sender.to_string(), "relay".to_string()],
            target_peer_id: Some(harness.identity.peer_id().to_string()),
            routing_hint: RoutingHint::Relay,
            payload,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        // Paused-clock friendly: each sleep is auto-advanced, so this
        // covers 30 virtual seconds, beyond every ladder deadline.
        for _ in 0..3000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_relay_full_requester_flow() {
        // S5: P is connected to R and reconnects to Q through it.
        let h = harness("peer-p", MockConnectBehavior::SignalOnly).await;
        let relay = add_live_peer(&h, "relay");

        let orchestrator = h.orchestrator.clone();
        let ladder = tokio::spawn(async move {
            orchestrator.run_ladder("peer-q", "Quentin").await
        });

        // The path query goes out to the relay.
        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "path_query")
        })
        .await;
        let query = relay
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "path_query")
            .unwrap();
        assert_eq!(query["payload"]["targetPeerId"], "peer-q");
        assert_eq!(query["ttl"], 7);
        let query_id = query["payload"]["queryId"].as_str().unwrap().to_string();

        // R answers: it has Q live.
        h.router
            .route(
                envelope_to(
                    &h,
                    MsgType::PathResponse,
                    "relay",
                    serde_json::json!({
                        "queryId": query_id,
                        "relayPeerId": "relay",
                        "hopCount": 1,
                    }),
                ),
                Some("relay"),
            )
            .await;

        // The offer goes out, targeted at Q with relay routing.
        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "reconnect_offer")
        })
        .await;
        let offer = relay
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "reconnect_offer")
            .unwrap();
        assert_eq!(offer["target_peer_id"], "peer-q");
        assert_eq!(offer["routing_hint"], "relay");
        assert_eq!(offer["ttl"], 10);
        assert_eq!(offer["payload"]["requesterId"], h.identity.peer_id());
        let reconnect_id = offer["payload"]["reconnectId"].as_str().unwrap().to_string();

        // Q's answer comes back.
        h.router
            .route(
                envelope_to(
                    &h,
                    MsgType::ReconnectAnswer,
                    "peer-q",
                    serde_json::json!({
                        "reconnectId": reconnect_id,
                        "answerBlob": {"sdp": "answer-sdp", "sdp_type": "answer"},
                        "responderId": "peer-q",
                    }),
                ),
                Some("relay"),
            )
            .await;

        // The answer reaches the transport, then ICE completes.
        let transport = h.factory.created.lock()[0].1.clone();
        wait_until(|| {
            transport
                .signalled
                .lock()
                .iter()
                .any(|blob| blob["sdp"] == "answer-sdp")
        })
        .await;
        transport.emit(TransportEvent::Connect);

        ladder.await.unwrap().unwrap();
        assert!(h.registry.is_connected("peer-q"));
        assert_eq!(
            h.orchestrator.stats().method_count(ReconnectMethod::MeshRelay),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_relay_no_path_found() {
        let h = harness("peer-p", MockConnectBehavior::SignalOnly).await;
        add_live_peer(&h, "relay");

        let result = h.orchestrator.run_ladder("peer-q", "Quentin").await;

        assert!(matches!(result, Err(Error::NoPathFound(_))));
        let record = h.store.get("peer-q").await.unwrap().unwrap();
        assert_eq!(record.reconnection_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mesh_relay_rejection_fails_ladder() {
        let h = harness("peer-p", MockConnectBehavior::SignalOnly).await;
        let relay = add_live_peer(&h, "relay");

        let orchestrator = h.orchestrator.clone();
        let ladder =
            tokio::spawn(async move { orchestrator.run_ladder("peer-q", "Quentin").await });

        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "path_query")
        })
        .await;
        let query = relay
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "path_query")
            .unwrap();
        h.router
            .route(
                envelope_to(
                    &h,
                    MsgType::PathResponse,
                    "relay",
                    serde_json::json!({
                        "queryId": query["payload"]["queryId"],
                        "relayPeerId": "relay",
                        "hopCount": 1,
                    }),
                ),
                Some("relay"),
            )
            .await;

        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "reconnect_offer")
        })
        .await;
        let offer = relay
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "reconnect_offer")
            .unwrap();

        h.router
            .route(
                envelope_to(
                    &h,
                    MsgType::ReconnectRejection,
                    "peer-q",
                    serde_json::json!({
                        "reconnectId": offer["payload"]["reconnectId"],
                        "reason": "already_connected",
                    }),
                ),
                Some("relay"),
            )
            .await;

        let result = ladder.await.unwrap();
        assert!(matches!(result, Err(Error::ReconnectRejected { .. })));
        // Rejections count as failures of the same kind.
        let record = h.store.get("peer-q").await.unwrap().unwrap();
        assert_eq!(record.reconnection_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_accepts_offer_from_lower_id() {
        // The responder holds the higher id, so it accepts.
        let h = harness("zed", MockConnectBehavior::SignalOnly).await;
        let relay = add_live_peer(&h, "relay");
        let requester = format!("0000-{}", "a".repeat(28));
        assert!(h.identity.peer_id() > requester.as_str());

        h.router
            .route(
                envelope_to(
                    &h,
                    MsgType::ReconnectOffer,
                    &requester,
                    serde_json::json!({
                        "reconnectId": "rc-1",
                        "offerBlob": {"sdp": "offer-sdp", "sdp_type": "offer"},
                        "requesterId": requester,
                        "requesterName": "Requester",
                        "timestamp": crate::time::now_timestamp_millis(),
                    }),
                ),
                Some("relay"),
            )
            .await;

        // The answer went back toward the requester.
        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "reconnect_answer")
        })
        .await;
        let answer = relay
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "reconnect_answer")
            .unwrap();
        assert_eq!(answer["payload"]["reconnectId"], "rc-1");
        assert_eq!(answer["target_peer_id"], requester);

        // The responder transport took the offer blob and, once ICE
        // completes, the requester joins the registry.
        let transport = h.factory.created.lock()[0].1.clone();
        assert_eq!(transport.signalled.lock()[0]["sdp"], "offer-sdp");
        assert!(!h.factory.created.lock()[0].0, "responder side must not initiate");

        transport.emit(TransportEvent::Connect);
        wait_until(|| h.registry.is_connected(&requester)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_rejects_collision_from_higher_id() {
        // The responder holds the lower id: the rightful initiator is us,
        // so the incoming offer is a collision.
        let h = harness("abc", MockConnectBehavior::SignalOnly).await;
        let relay = add_live_peer(&h, "relay");
        let requester = format!("zzzz-{}", "f".repeat(28));
        assert!(h.identity.peer_id() < requester.as_str());

        h.router
            .route(
                envelope_to(
                    &h,
                    MsgType::ReconnectOffer,
                    &requester,
                    serde_json::json!({
                        "reconnectId": "rc-2",
                        "offerBlob": {"sdp": "offer-sdp", "sdp_type": "offer"},
                        "requesterId": requester,
                        "requesterName": "Requester",
                        "timestamp": crate::time::now_timestamp_millis(),
                    }),
                ),
                Some("relay"),
            )
            .await;

        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "reconnect_rejection")
        })
        .await;
        let rejection = relay
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "reconnect_rejection")
            .unwrap();
        assert_eq!(rejection["payload"]["reason"], "collision_detected");
        assert_eq!(rejection["payload"]["reconnectId"], "rc-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_rejects_already_connected() {
        let h = harness("zed", MockConnectBehavior::SignalOnly).await;
        let relay = add_live_peer(&h, "relay");
        let requester = format!("0000-{}", "b".repeat(28));
        add_live_peer(&h, &requester);

        h.router
            .route(
                envelope_to(
                    &h,
                    MsgType::ReconnectOffer,
                    &requester,
                    serde_json::json!({
                        "reconnectId": "rc-3",
                        "offerBlob": {"sdp": "offer-sdp", "sdp_type": "offer"},
                        "requesterId": requester,
                        "requesterName": "Requester",
                        "timestamp": crate::time::now_timestamp_millis(),
                    }),
                ),
                Some("relay"),
            )
            .await;

        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "reconnect_rejection")
        })
        .await;
        let rejection = relay
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "reconnect_rejection")
            .unwrap();
        assert_eq!(rejection["payload"]["reason"], "already_connected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_path_query_answered_for_live_target() {
        let h = harness("relay-node", MockConnectBehavior::Silent).await;
        let asker = add_live_peer(&h, "asker");
        add_live_peer(&h, "target-q");

        let mut query = envelope_to(
            &h,
            MsgType::PathQuery,
            "asker",
            serde_json::json!({"queryId": "q-1", "targetPeerId": "target-q"}),
        );
        // Path queries are broadcast, not targeted.
        query.target_peer_id = None;
        query.routing_hint = RoutingHint::Broadcast;
        h.router.route(query, Some("asker")).await;

        wait_until(|| {
            asker
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "path_response")
        })
        .await;
        let response = asker
            .sent_json()
            .into_iter()
            .find(|e| e["msg_type"] == "path_response")
            .unwrap();
        assert_eq!(response["payload"]["queryId"], "q-1");
        assert_eq!(response["payload"]["relayPeerId"], h.identity.peer_id());
        assert_eq!(response["payload"]["hopCount"], 1);
        assert_eq!(response["target_peer_id"], "asker");
        assert_eq!(response["ttl"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_path_query_ignored_for_unknown_target() {
        let h = harness("relay-node", MockConnectBehavior::Silent).await;
        let asker = add_live_peer(&h, "asker");

        let mut query = envelope_to(
            &h,
            MsgType::PathQuery,
            "asker",
            serde_json::json!({"queryId": "q-2", "targetPeerId": "nobody"}),
        );
        query.target_peer_id = None;
        query.routing_hint = RoutingHint::Broadcast;
        h.router.route(query, Some("asker")).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!asker
            .sent_json()
            .iter()
            .any(|e| e["msg_type"] == "path_response"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_breaking_agreement_between_fabric_and_orchestrator() {
        // Property: for any pair, exactly one side initiates and exactly
        // the other side accepts.
        let a = harness("node-a", MockConnectBehavior::Silent).await;
        let b = harness("node-b", MockConnectBehavior::Silent).await;
        let a_id = a.identity.peer_id().to_string();
        let b_id = b.identity.peer_id().to_string();

        let a_initiates = AnnouncementFabric::should_initiate(&a.fabric, &b_id);
        let b_initiates = AnnouncementFabric::should_initiate(&b.fabric, &a_id);
        assert_ne!(a_initiates, b_initiates);

        let a_accepts = a.orchestrator.should_accept_reconnection(&b_id).await.is_ok();
        let b_accepts = b.orchestrator.should_accept_reconnection(&a_id).await.is_ok();
        assert_ne!(a_accepts, b_accepts);

        // The initiator is exactly the non-accepting side.
        assert_eq!(a_initiates, !a_accepts);
        assert_eq!(b_initiates, !b_accepts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ladder_attempts_cached_direct_before_mesh() {
        // Property: the ladder is (A, B) in order. With fresh cached
        // candidates and a silent transport, step A must burn its budget
        // before any path query appears.
        let h = harness("peer-p", MockConnectBehavior::Silent).await;
        let relay = add_live_peer(&h, "relay");
        seed_recent_peer(&h, "peer-q", 30 * 1000).await;

        let orchestrator = h.orchestrator.clone();
        let ladder =
            tokio::spawn(async move { orchestrator.run_ladder("peer-q", "Quentin").await });

        // Step A creates the transport immediately; no path query yet.
        wait_until(|| h.factory.created_count() >= 1).await;
        assert!(!relay
            .sent_json()
            .iter()
            .any(|e| e["msg_type"] == "path_query"));

        // Step B follows only after step A fails.
        wait_until(|| {
            relay
                .sent_json()
                .iter()
                .any(|e| e["msg_type"] == "path_query")
        })
        .await;

        let result = ladder.await.unwrap();
        assert!(result.is_err());
        // Both failed steps were counted.
        let record = h.store.get("peer-q").await.unwrap().unwrap();
        assert_eq!(record.reconnection_attempts, 2);
    }
}
