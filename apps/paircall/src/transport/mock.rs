//! Scriptable in-memory transport for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{ConnectivityState, PeerTransport, TransportError, TransportEvent, TransportFactory};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidateBlob, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    Rollback,
    SetRemote(SessionDescription),
    AddCandidate(String),
    Close,
}

pub struct MockPeerTransport {
    label: String,
    ops: Mutex<Vec<MockOp>>,
    reject_candidates: Mutex<HashSet<String>>,
    fail_create_answer: AtomicBool,
    fail_set_remote: AtomicBool,
    connectivity: Mutex<ConnectivityState>,
    remote_live: AtomicBool,
    close_count: AtomicUsize,
    offer_seq: AtomicUsize,
}

impl MockPeerTransport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ops: Mutex::new(Vec::new()),
            reject_candidates: Mutex::new(HashSet::new()),
            fail_create_answer: AtomicBool::new(false),
            fail_set_remote: AtomicBool::new(false),
            connectivity: Mutex::new(ConnectivityState::New),
            remote_live: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            offer_seq: AtomicUsize::new(0),
        }
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.ops.lock().clone()
    }

    /// Remote candidates applied, in application order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                MockOp::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn rolled_back(&self) -> bool {
        self.ops.lock().iter().any(|op| *op == MockOp::Rollback)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.reject_candidates.lock().insert(candidate.to_string());
    }

    pub fn fail_create_answer(&self) {
        self.fail_create_answer.store(true, Ordering::SeqCst);
    }

    pub fn fail_set_remote(&self) {
        self.fail_set_remote.store(true, Ordering::SeqCst);
    }

    pub fn set_remote_live(&self, live: bool) {
        self.remote_live.store(live, Ordering::SeqCst);
    }

    pub fn set_connectivity(&self, state: ConnectivityState) {
        *self.connectivity.lock() = state;
    }

    fn record(&self, op: MockOp) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl PeerTransport for MockPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(MockOp::CreateOffer);
        let seq = self.offer_seq.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!(
            "v=0 {} offer {seq}",
            self.label
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.fail_create_answer.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation("scripted answer failure".into()));
        }
        self.record(MockOp::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "v=0 {} answer",
            self.label
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockOp::SetLocal(description));
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), TransportError> {
        self.record(MockOp::Rollback);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.fail_set_remote.load(Ordering::SeqCst) {
            return Err(TransportError::Negotiation(
                "scripted remote description failure".into(),
            ));
        }
        self.record(MockOp::SetRemote(description));
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidateBlob,
    ) -> Result<(), TransportError> {
        if self.reject_candidates.lock().contains(&candidate.candidate) {
            return Err(TransportError::Negotiation("scripted bad candidate".into()));
        }
        self.record(MockOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.lock()
    }

    fn remote_media_live(&self) -> bool {
        self.remote_live.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.record(MockOp::Close);
        self.remote_live.store(false, Ordering::SeqCst);
        *self.connectivity.lock() = ConnectivityState::Closed;
        Ok(())
    }
}

/// Hands out a fresh mock per matched room and remembers every one of them
/// (senders must be rebuilt per room, so tests assert on distinct mocks).
#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockPeerTransport>>>,
    event_taps: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<Arc<MockPeerTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeerTransport>> {
        self.created.lock().last().cloned()
    }

    /// Event sender handed to the most recent transport, so tests can inject
    /// candidate/connectivity events as if the transport emitted them.
    pub fn last_events(&self) -> Option<mpsc::UnboundedSender<TransportEvent>> {
        self.event_taps.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _media: &LocalMedia,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(MockPeerTransport::new(format!(
            "mock-{}",
            self.created.lock().len()
        )));
        self.created.lock().push(Arc::clone(&transport));
        self.event_taps.lock().push(events);
        Ok(transport)
    }
}
