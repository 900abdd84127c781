//! Offer/answer negotiation for one matched room.
//!
//! Tracks a mirror of the transport's signaling state so glare (both peers
//! offering at once) can be resolved deterministically: a remote offer
//! always wins against our own un-acked offer, which is rolled back before
//! the remote one is applied. Remote candidates that arrive before the
//! remote description are buffered and drained, in arrival order, exactly
//! once.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{ClientMessage, IceCandidateBlob, SessionDescription};
use crate::signaling::{SignalingChannel, SignalingError};
use crate::transport::{PeerTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No descriptions applied (or transport torn down).
    Idle,
    /// Our offer is out, no answer yet. A remote offer arriving now is glare.
    HaveLocalOffer,
    /// Remote offer applied, our answer not yet produced.
    HaveRemoteOffer,
    /// Transient: rolling back our offer because the remote one preempted it.
    GlareResolving,
    /// Both descriptions applied.
    Stable,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("cannot offer while {0:?}")]
    InvalidState(SignalingState),
    #[error("no active transport")]
    NoTransport,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

pub struct Negotiator {
    room_id: String,
    signaling: Arc<dyn SignalingChannel>,
    transport: Option<Arc<dyn PeerTransport>>,
    state: SignalingState,
    remote_description_set: bool,
    pending_remote_candidates: Vec<IceCandidateBlob>,
}

impl Negotiator {
    pub fn new(
        room_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            signaling,
            transport: Some(transport),
            state: SignalingState::Idle,
            remote_description_set: false,
            pending_remote_candidates: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn transport(&self) -> Option<&Arc<dyn PeerTransport>> {
        self.transport.as_ref()
    }

    fn require_transport(&self) -> Result<&Arc<dyn PeerTransport>, NegotiationError> {
        self.transport.as_ref().ok_or(NegotiationError::NoTransport)
    }

    /// Produces and sends our offer. Only legal when no exchange is in
    /// flight; a second call while an offer is un-acked is a bug upstream.
    pub async fn create_offer(&mut self) -> Result<(), NegotiationError> {
        if !matches!(self.state, SignalingState::Idle | SignalingState::Stable) {
            return Err(NegotiationError::InvalidState(self.state));
        }
        let transport = self.require_transport()?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.state = SignalingState::HaveLocalOffer;
        self.signaling.send(ClientMessage::RtcOffer {
            room_id: self.room_id.clone(),
            data: offer,
        })?;
        debug!(target = "negotiation", room_id = %self.room_id, "offer sent");
        Ok(())
    }

    /// Applies the peer's offer and responds with our answer. If our own
    /// offer is still un-acked, it loses: we roll it back first and answer
    /// theirs instead.
    pub async fn handle_remote_offer(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let transport = Arc::clone(self.require_transport()?);
        if self.state == SignalingState::HaveLocalOffer {
            debug!(target = "negotiation", room_id = %self.room_id, "glare: remote offer preempts local offer");
            self.state = SignalingState::GlareResolving;
            if let Err(err) = transport.rollback_local_description().await {
                self.state = SignalingState::HaveLocalOffer;
                return Err(err.into());
            }
        }
        transport.set_remote_description(description).await?;
        self.state = SignalingState::HaveRemoteOffer;
        self.remote_description_set = true;
        self.drain_pending_candidates(&transport).await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.state = SignalingState::Stable;
        self.signaling.send(ClientMessage::RtcAnswer {
            room_id: self.room_id.clone(),
            data: answer,
        })?;
        debug!(target = "negotiation", room_id = %self.room_id, "answer sent");
        Ok(())
    }

    /// Applies the peer's answer to our outstanding offer. Returns whether
    /// the answer was applied; a stale answer (we lost a glare race and no
    /// longer have a local offer out) is discarded without error.
    pub async fn handle_remote_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<bool, NegotiationError> {
        if self.state != SignalingState::HaveLocalOffer {
            debug!(
                target = "negotiation",
                room_id = %self.room_id,
                state = ?self.state,
                "discarding stale answer"
            );
            return Ok(false);
        }
        let transport = Arc::clone(self.require_transport()?);
        transport.set_remote_description(description).await?;
        self.state = SignalingState::Stable;
        self.remote_description_set = true;
        self.drain_pending_candidates(&transport).await;
        Ok(true)
    }

    /// Applies a remote candidate immediately when the remote description
    /// is in place, otherwise buffers it for the post-description drain.
    /// Individual candidate failures never abort the exchange.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidateBlob) {
        let applicable = self.remote_description_set;
        match (applicable, self.transport.as_ref()) {
            (true, Some(transport)) => {
                if let Err(err) = transport.add_remote_candidate(candidate).await {
                    warn!(target = "negotiation", room_id = %self.room_id, error = %err, "dropping remote candidate");
                }
            }
            _ => self.pending_remote_candidates.push(candidate),
        }
    }

    async fn drain_pending_candidates(&mut self, transport: &Arc<dyn PeerTransport>) {
        for candidate in std::mem::take(&mut self.pending_remote_candidates) {
            if let Err(err) = transport.add_remote_candidate(candidate).await {
                warn!(target = "negotiation", room_id = %self.room_id, error = %err, "dropping buffered candidate");
            }
        }
    }

    /// Closes and releases the transport and resets all negotiation state.
    /// Safe to call repeatedly.
    pub async fn teardown_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(err) = transport.close().await {
                debug!(target = "negotiation", room_id = %self.room_id, error = %err, "transport close failed");
            }
        }
        self.pending_remote_candidates.clear();
        self.remote_description_set = false;
        self.state = SignalingState::Idle;
    }
}
