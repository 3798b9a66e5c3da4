//! Scriptable transport doubles for unit tests.
//!
//! `MockTransport` records what the core sends and signals, and lets a
//! test inject events as if the candidate pair had produced them.
//! `MockFactory` hands out mocks and records every create call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{CandidatePairStats, IceConfig, PeerTransport, TransportEvent, TransportFactory};
use crate::error::{Error, Result};

pub(crate) struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub signalled: Mutex<Vec<serde_json::Value>>,
    pub closed: AtomicBool,
    fail_sends: AtomicBool,
    stats: Mutex<Option<CandidatePairStats>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            sent: Mutex::new(Vec::new()),
            signalled: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            stats: Mutex::new(None),
        })
    }

    /// Inject an event as if the transport had produced it
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Make every subsequent send fail
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Script the candidate-pair statistics
    pub fn set_stats(&self, stats: CandidatePairStats) {
        *self.stats.lock() = Some(stats);
    }

    /// Frames sent so far, decoded as JSON
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|bytes| serde_json::from_slice(bytes).ok())
            .collect()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn signal(&self, blob: serde_json::Value) -> Result<()> {
        self.signalled.lock().push(blob);
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::TransportError("mock send failure".into()));
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Close);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn stats(&self) -> Option<CandidatePairStats> {
        *self.stats.lock()
    }
}

/// What a `MockFactory` does with each transport it creates
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockConnectBehavior {
    /// Emit `Connect` immediately after creation
    ConnectImmediately,
    /// Emit a signal blob, then nothing (test drives the rest)
    SignalOnly,
    /// Emit nothing; the attempt will time out
    Silent,
}

pub(crate) struct MockFactory {
    pub behavior: Mutex<MockConnectBehavior>,
    pub created: Mutex<Vec<(bool, Arc<MockTransport>)>>,
}

impl MockFactory {
    pub fn new(behavior: MockConnectBehavior) -> Arc<Self> {
        Arc::new(Self { behavior: Mutex::new(behavior), created: Mutex::new(Vec::new()) })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, initiator: bool, _ice: &IceConfig) -> Result<Arc<dyn PeerTransport>> {
        let transport = MockTransport::new();
        let behavior = *self.behavior.lock();
        // Events are emitted from a deferred task so the caller has
        // subscribed by the time they fire (broadcast drops events that
        // have no receiver yet).
        let deferred = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            match behavior {
                MockConnectBehavior::ConnectImmediately => {
                    deferred.set_stats(CandidatePairStats {
                        connection_type: Some(super::ConnectionType::Host),
                        latency_ms: Some(20),
                    });
                    deferred.emit(TransportEvent::Connect);
                }
                MockConnectBehavior::SignalOnly => {
                    deferred.emit(TransportEvent::Signal(serde_json::json!({
                        "sdp_type": "offer",
                        "sdp": "mock-sdp",
                    })));
                }
                MockConnectBehavior::Silent => {}
            }
        });
        self.created.lock().push((initiator, transport.clone()));
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_sends() {
        let transport = MockTransport::new();
        transport.send(b"{\"x\":1}".to_vec()).await.unwrap();

        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(transport.sent_json()[0]["x"], 1);
    }

    #[tokio::test]
    async fn test_mock_fail_sends() {
        let transport = MockTransport::new();
        transport.fail_sends();

        assert!(transport.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_events_reach_subscriber() {
        let transport = MockTransport::new();
        let mut rx = transport.subscribe();

        transport.emit(TransportEvent::Connect);

        match rx.recv().await.unwrap() {
            TransportEvent::Connect => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
